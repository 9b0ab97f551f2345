//! In-flight request tracking for the back channel.
//!
//! Every command the bridge expects an answer to is recorded here under
//! its sequence number before it is transmitted. The back read loop hands
//! replies in by sequence number, so correlation is independent of arrival
//! order. Waiters block on their own completion channel, never on the
//! pending table's lock.

use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::bridge::back::{BackOut, Command, Record};
use crate::bridge::error::{Error, Result};

/// What the caller expects the reply payload to look like. Recorded for
/// diagnostics; payload parsing stays with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Ack,
    VersionInfo,
    ThreadList,
    FrameList,
    VarList,
    Var,
    BreakStatus,
}

type Reply = Result<Record>;

enum Completion {
    Channel(mpsc::SyncSender<Reply>),
    Callback(Box<dyn FnOnce(Reply) + Send>),
}

struct Pending {
    shape: Shape,
    deadline: Instant,
    completion: Completion,
}

impl Pending {
    fn complete(self, reply: Reply) {
        match self.completion {
            // capacity 1 and a single producer, the send never blocks
            Completion::Channel(tx) => {
                let _ = tx.send(reply);
            }
            Completion::Callback(callback) => callback(reply),
        }
    }
}

pub struct Correlator {
    pending: Mutex<IndexMap<i64, Pending>>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Correlator {
        Correlator {
            pending: Mutex::new(IndexMap::new()),
            timeout,
        }
    }

    /// Issue a command and return a handle the caller can block on.
    pub fn send<'a>(
        &'a self,
        out: &BackOut,
        command: Command,
        payload: &str,
        shape: Shape,
    ) -> Result<PendingHandle<'a>> {
        let seq = out.next_seq();
        let deadline = Instant::now() + self.timeout;
        let (tx, rx) = mpsc::sync_channel(1);

        self.register(seq, shape, deadline, Completion::Channel(tx));
        if let Err(e) = out.send(command, seq, payload) {
            self.forget(seq);
            return Err(e);
        }

        Ok(PendingHandle {
            seq,
            rx,
            deadline,
            correlator: self,
        })
    }

    /// Issue a command whose reply is handed to `callback` on the back
    /// read loop instead of a blocked waiter.
    pub fn send_with(
        &self,
        out: &BackOut,
        command: Command,
        payload: &str,
        shape: Shape,
        callback: impl FnOnce(Reply) + Send + 'static,
    ) -> Result<i64> {
        let seq = out.next_seq();
        let deadline = Instant::now() + self.timeout;

        self.register(seq, shape, deadline, Completion::Callback(Box::new(callback)));
        if let Err(e) = out.send(command, seq, payload) {
            self.forget(seq);
            return Err(e);
        }
        Ok(seq)
    }

    fn register(&self, seq: i64, shape: Shape, deadline: Instant, completion: Completion) {
        let mut pending = self.pending.lock().expect("pending table lock");
        let prev = pending.insert(
            seq,
            Pending {
                shape,
                deadline,
                completion,
            },
        );
        debug_assert!(prev.is_none(), "sequence number {seq} reused while in flight");
    }

    /// Deliver an engine reply to the request it answers. The pending
    /// entry is removed under the lock, the waiter completed outside it.
    pub fn resolve(&self, seq: i64, reply: Reply) -> Result<()> {
        let pending = {
            let mut table = self.pending.lock().expect("pending table lock");
            table.shift_remove(&seq)
        };
        match pending {
            Some(pending) => {
                if Instant::now() > pending.deadline {
                    log::warn!(target: "back", "reply {seq} ({:?}) arrived past its deadline", pending.shape);
                } else {
                    log::debug!(target: "back", "reply {seq} ({:?})", pending.shape);
                }
                pending.complete(reply);
                Ok(())
            }
            None => Err(Error::UnexpectedResponse(seq)),
        }
    }

    /// True if `seq` belongs to a request currently in flight.
    pub fn is_pending(&self, seq: i64) -> bool {
        self.pending.lock().expect("pending table lock").contains_key(&seq)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("pending table lock").len()
    }

    /// Fail every outstanding request so no caller blocks forever.
    /// Idempotent, callable from either read loop or a watchdog.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<Pending> = {
            let mut table = self.pending.lock().expect("pending table lock");
            table.drain(..).map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            log::debug!(target: "back", "cancelling {} in-flight requests: {reason}", drained.len());
        }
        for pending in drained {
            pending.complete(Err(Error::Cancelled(reason.to_string())));
        }
    }

    fn forget(&self, seq: i64) {
        self.pending.lock().expect("pending table lock").shift_remove(&seq);
    }
}

/// One caller's view of its in-flight request.
pub struct PendingHandle<'a> {
    seq: i64,
    rx: mpsc::Receiver<Reply>,
    deadline: Instant,
    correlator: &'a Correlator,
}

impl PendingHandle<'_> {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Block until the reply arrives or the deadline passes. Expiry
    /// removes the pending entry so a late reply is treated as unexpected.
    pub fn wait(self) -> Result<Record> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(reply) => reply,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.correlator.forget(self.seq);
                Err(Error::Timeout(self.seq))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }
}
