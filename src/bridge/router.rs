//! Translation of unsolicited engine notifications into front events.
//!
//! One instance per session, driven from the back read loop. Thread
//! events observed before configuration completes are queued and flushed
//! (behind the `process` event) when the session enters Running; the gate
//! lock keeps that flush atomic with respect to later thread events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::bridge::back::{self, Command, CommandId, Record};
use crate::bridge::correlate::Correlator;
use crate::bridge::error::{Error, Result};
use crate::bridge::front::FrontOut;
use crate::bridge::ids::Translator;
use crate::bridge::state::{Phase, SessionState};

struct Gate {
    configured: bool,
    queue: Vec<(&'static str, i64)>,
    terminated: bool,
}

pub struct EventRouter {
    front: Arc<FrontOut>,
    state: Arc<SessionState>,
    translator: Arc<Mutex<Translator>>,
    correlator: Arc<Correlator>,
    gate: Mutex<Gate>,
    exceptions: Mutex<HashMap<i64, (String, String)>>,
}

impl EventRouter {
    pub fn new(
        front: Arc<FrontOut>,
        state: Arc<SessionState>,
        translator: Arc<Mutex<Translator>>,
        correlator: Arc<Correlator>,
    ) -> EventRouter {
        EventRouter {
            front,
            state,
            translator,
            correlator,
            gate: Mutex::new(Gate {
                configured: false,
                queue: Vec::new(),
                terminated: false,
            }),
            exceptions: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one engine notification.
    pub fn dispatch(&self, record: Record) -> Result<()> {
        match record.command {
            CommandId::Known(Command::ThreadCreate) => self.on_thread_create(&record.payload),
            CommandId::Known(Command::ThreadExit) => self.on_thread_exit(&record.payload),
            CommandId::Known(Command::Suspend) => self.on_suspend(&record.payload),
            CommandId::Known(Command::Resume) => self.on_resume(&record.payload),
            CommandId::Known(Command::Output) => self.on_output(&record.payload),
            CommandId::Known(Command::ProcessExit) => self.on_process_exit(&record.payload),
            CommandId::Known(other) => {
                log::warn!(target: "back", "unsolicited {other} record, seq {}", record.seq);
                Ok(())
            }
            CommandId::Opaque(id) => {
                log::debug!(target: "back", "opaque record {id}, seq {} ignored", record.seq);
                Ok(())
            }
        }
    }

    fn on_thread_create(&self, payload: &str) -> Result<()> {
        let threads = back::parse_thread_list(payload)?;
        let Some(info) = threads.first() else {
            return Err(Error::MalformedRecord("thread create without element".into()));
        };

        let (front_id, hidden) = {
            let mut translator = self.translator.lock().expect("translator lock");
            let front_id = translator.allocate_thread(info.id, &info.name);
            let hidden = translator
                .thread_by_back_id(info.id)
                .map(|t| t.hidden)
                .unwrap_or(false);
            (front_id, hidden)
        };
        if hidden {
            return Ok(());
        }
        self.emit_thread_event("started", front_id)
    }

    fn on_thread_exit(&self, payload: &str) -> Result<()> {
        let back_id = payload
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::MalformedRecord(format!("bad thread exit payload `{payload}`")))?;

        let retired = {
            let mut translator = self.translator.lock().expect("translator lock");
            translator.retire_thread(back_id)
        };
        let Some(thread) = retired else {
            log::warn!(target: "back", "exit event for unknown thread {back_id}");
            return Ok(());
        };
        self.exceptions.lock().expect("exception cache lock").remove(&thread.front_id);
        if thread.hidden {
            return Ok(());
        }
        self.emit_thread_event("exited", thread.front_id)
    }

    fn on_suspend(&self, payload: &str) -> Result<()> {
        let info = back::parse_suspend(payload)?;

        let front_id = {
            let mut translator = self.translator.lock().expect("translator lock");
            // a hit may race the create event, register the thread on the fly
            let front_id = translator.allocate_thread(info.thread_id, "");
            translator.set_stopped(info.thread_id, true);
            front_id
        };
        if self.state.phase() == Phase::Running {
            self.state.set_if_active(Phase::Stopped);
        }

        let reason = match info.cause {
            c if c == Command::SetBreak as u32 => "breakpoint",
            c if c == Command::Suspend as u32 => "pause",
            c if c == Command::StepInto as u32
                || c == Command::StepOver as u32
                || c == Command::StepOut as u32 =>
            {
                "step"
            }
            c if c == Command::AddExceptionBreak as u32 => "exception",
            other => {
                log::warn!(target: "back", "suspend with unknown cause {other}");
                "unknown"
            }
        };

        let mut exceptions = self.exceptions.lock().expect("exception cache lock");
        let (text, description) = match &info.exception {
            Some((name, message)) => {
                exceptions.insert(front_id, (name.clone(), message.clone()));
                (Some(name.clone()), Some(message.clone()))
            }
            None => {
                exceptions.remove(&front_id);
                (None, None)
            }
        };
        drop(exceptions);

        self.front.event(
            "stopped",
            Some(json!({
                "reason": reason,
                "threadId": front_id,
                "text": text,
                "description": description,
            })),
        )
    }

    fn on_resume(&self, payload: &str) -> Result<()> {
        let back_id = payload
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::MalformedRecord(format!("bad resume payload `{payload}`")))?;

        let (front_id, none_stopped) = {
            let mut translator = self.translator.lock().expect("translator lock");
            let Some(thread) = translator.thread_by_back_id(back_id) else {
                log::warn!(target: "back", "resume event for unknown thread {back_id}");
                return Ok(());
            };
            let front_id = thread.front_id;
            translator.set_stopped(back_id, false);
            translator.invalidate_thread_scopes(front_id);
            (front_id, !translator.any_stopped())
        };
        self.exceptions.lock().expect("exception cache lock").remove(&front_id);

        if none_stopped && self.state.phase() == Phase::Stopped {
            self.state.set_if_active(Phase::Running);
        }

        self.front.event("continued", Some(json!({ "threadId": front_id })))
    }

    fn on_output(&self, payload: &str) -> Result<()> {
        let (ctx, text) = payload
            .split_once('\t')
            .ok_or_else(|| Error::MalformedRecord(format!("bad output payload `{payload}`")))?;
        let category = match ctx {
            "1" => "stdout",
            "2" => "stderr",
            _ => "console",
        };
        self.front.event(
            "output",
            Some(json!({
                "category": category,
                "output": back::unescape(text),
            })),
        )
    }

    fn on_process_exit(&self, payload: &str) -> Result<()> {
        let code = payload.trim().parse::<i64>().unwrap_or_else(|_| {
            log::warn!(target: "back", "bad process exit payload `{payload}`");
            0
        });

        {
            let mut gate = self.gate.lock().expect("gate lock");
            if gate.terminated {
                return Ok(());
            }
            gate.terminated = true;
            self.front.event("exited", Some(json!({ "exitCode": code })))?;
            self.front.event("terminated", None)?;
        }

        self.state.set(Phase::Terminating);
        self.correlator.cancel_all("engine process exited");
        Ok(())
    }

    fn emit_thread_event(&self, reason: &'static str, front_id: i64) -> Result<()> {
        let mut gate = self.gate.lock().expect("gate lock");
        if !gate.configured {
            log::debug!(target: "bridge", "queueing thread {reason} for {front_id} until configured");
            gate.queue.push((reason, front_id));
            return Ok(());
        }
        self.front.event(
            "thread",
            Some(json!({ "reason": reason, "threadId": front_id })),
        )
    }

    /// Called once when configuration completes: emits the `process`
    /// event and then the queued thread events in arrival order.
    pub fn flush_configured(&self, process_body: Value) -> Result<()> {
        let mut gate = self.gate.lock().expect("gate lock");
        if gate.configured {
            return Ok(());
        }
        gate.configured = true;
        self.front.event("process", Some(process_body))?;
        for (reason, front_id) in std::mem::take(&mut gate.queue) {
            self.front.event(
                "thread",
                Some(json!({ "reason": reason, "threadId": front_id })),
            )?;
        }
        Ok(())
    }

    pub fn exception_details(&self, front_id: i64) -> Option<(String, String)> {
        self.exceptions.lock().expect("exception cache lock").get(&front_id).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::front::{read_frame, Message};
    use std::io::{Cursor, Write};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn new_router() -> (EventRouter, Arc<Mutex<Vec<u8>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let front = Arc::new(FrontOut::new(Shared(sink.clone())));
        let state = Arc::new(SessionState::new());
        state.set(Phase::Configuring);
        let translator = Arc::new(Mutex::new(Translator::default()));
        let correlator = Arc::new(Correlator::new(Duration::from_secs(1)));
        (EventRouter::new(front, state, translator, correlator), sink)
    }

    fn record(command: Command, payload: &str) -> Record {
        Record {
            command: CommandId::Known(command),
            seq: 1,
            payload: payload.to_string(),
        }
    }

    fn drain_events(sink: &Arc<Mutex<Vec<u8>>>) -> Vec<(String, Option<Value>)> {
        let raw = sink.lock().unwrap().clone();
        let mut cursor = Cursor::new(raw);
        let mut events = vec![];
        while let Ok(msg) = read_frame(&mut cursor) {
            if let Message::Event(ev) = msg {
                events.push((ev.event, ev.body));
            }
        }
        events
    }

    #[test]
    fn test_thread_events_buffered_until_configured() {
        let (router, sink) = new_router();
        router
            .dispatch(record(Command::ThreadCreate, r#"<thread name="main" id="10" />"#))
            .unwrap();
        assert!(drain_events(&sink).is_empty());

        router.flush_configured(json!({"name": "spam"})).unwrap();
        let events = drain_events(&sink);
        assert_eq!(events[0].0, "process");
        assert_eq!(events[1].0, "thread");
        assert_eq!(events[1].1.as_ref().unwrap()["threadId"], 1);
        assert_eq!(events[1].1.as_ref().unwrap()["reason"], "started");
    }

    #[test]
    fn test_hidden_threads_produce_no_events() {
        let (router, sink) = new_router();
        router.flush_configured(json!({})).unwrap();
        router
            .dispatch(record(Command::ThreadCreate, r#"<thread name="dbg.worker" id="11" />"#))
            .unwrap();
        let events = drain_events(&sink);
        assert_eq!(events.len(), 1, "only the process event: {events:?}");
    }

    #[test]
    fn test_suspend_then_resume_ordering() {
        let (router, sink) = new_router();
        router.flush_configured(json!({})).unwrap();
        router
            .dispatch(record(Command::ThreadCreate, r#"<thread name="main" id="10" />"#))
            .unwrap();
        router.state.set(Phase::Running);

        router.dispatch(record(Command::Suspend, "10\t111")).unwrap();
        assert_eq!(router.state.phase(), Phase::Stopped);
        router.dispatch(record(Command::Resume, "10")).unwrap();
        assert_eq!(router.state.phase(), Phase::Running);

        let events = drain_events(&sink);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["process", "thread", "stopped", "continued"]);
        let stopped = events[2].1.as_ref().unwrap();
        assert_eq!(stopped["reason"], "breakpoint");
        assert_eq!(stopped["threadId"], 1);
    }

    #[test]
    fn test_exception_suspend_caches_details() {
        let (router, sink) = new_router();
        router.flush_configured(json!({})).unwrap();
        router.state.set(Phase::Running);
        router
            .dispatch(record(Command::Suspend, "10\t122\tMyError\tka-boom"))
            .unwrap();

        let events = drain_events(&sink);
        let stopped = events.last().unwrap().1.as_ref().unwrap();
        assert_eq!(stopped["reason"], "exception");
        assert_eq!(stopped["text"], "MyError");
        assert_eq!(stopped["description"], "ka-boom");
        assert_eq!(
            router.exception_details(1),
            Some(("MyError".to_string(), "ka-boom".to_string()))
        );

        router.dispatch(record(Command::Resume, "10")).unwrap();
        assert_eq!(router.exception_details(1), None);
    }

    #[test]
    fn test_process_exit_emits_exited_then_terminated_once() {
        let (router, sink) = new_router();
        router.flush_configured(json!({})).unwrap();
        router.dispatch(record(Command::ProcessExit, "3")).unwrap();
        router.dispatch(record(Command::ProcessExit, "3")).unwrap();

        let events = drain_events(&sink);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["process", "exited", "terminated"]);
        assert_eq!(events[1].1.as_ref().unwrap()["exitCode"], 3);
        assert_eq!(router.state.phase(), Phase::Terminating);
    }

    #[test]
    fn test_output_category_mapping() {
        let (router, sink) = new_router();
        router.flush_configured(json!({})).unwrap();
        router.dispatch(record(Command::Output, "1\t1+2=3\\n")).unwrap();
        router.dispatch(record(Command::Output, "2\tka-boom")).unwrap();

        let events = drain_events(&sink);
        let out1 = events[1].1.as_ref().unwrap();
        assert_eq!(out1["category"], "stdout");
        assert_eq!(out1["output"], "1+2=3\n");
        assert_eq!(events[2].1.as_ref().unwrap()["category"], "stderr");
    }

    #[test]
    fn test_opaque_records_ignored() {
        let (router, sink) = new_router();
        router
            .dispatch(Record {
                command: CommandId::Opaque(999),
                seq: 77,
                payload: "whatever".to_string(),
            })
            .unwrap();
        assert!(drain_events(&sink).is_empty());
    }
}
