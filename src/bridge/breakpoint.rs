//! Breakpoint and exception-filter bookkeeping.
//!
//! A `setBreakpoints` request is a declarative snapshot for one source:
//! whatever was registered there before is cleared first, then the new
//! specs are installed one by one, in order, and their verification
//! statuses returned in the same order.

use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::bridge::back::{self, BackOut, Command};
use crate::bridge::correlate::{Correlator, Shape};
use crate::bridge::error::{Error, Result};
use crate::bridge::ids::Translator;

/// One breakpoint spec from the front channel.
#[derive(Debug, Clone)]
pub struct Spec {
    pub line: i64,
    pub condition: Option<String>,
    pub log_message: Option<String>,
}

#[derive(Debug, Clone)]
struct Registered {
    id: i64,
    line: i64,
    handle: i64,
    verified: bool,
    reason: Option<String>,
}

pub struct BreakpointManager {
    by_source: Mutex<IndexMap<String, Vec<Registered>>>,
    filters: Mutex<Vec<String>>,
}

impl BreakpointManager {
    pub fn new() -> BreakpointManager {
        BreakpointManager {
            by_source: Mutex::new(IndexMap::new()),
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Replace the breakpoint set for `source` and return one status per
    /// spec, input order. A spec the engine rejects gets `verified: false`
    /// with a reason; it does not fail the rest of the batch.
    pub fn set_breakpoints(
        &self,
        back: &BackOut,
        correlator: &Correlator,
        translator: &Mutex<Translator>,
        source: &str,
        specs: &[Spec],
    ) -> Result<Vec<Value>> {
        let previous = {
            let mut by_source = self.by_source.lock().expect("breakpoint table lock");
            by_source.shift_remove(source).unwrap_or_default()
        };
        for old in previous.iter().filter(|b| b.handle != 0) {
            let payload = format!("{}\t{}", back::escape(source), old.handle);
            let id = old.id;
            correlator.send_with(back, Command::RemoveBreak, &payload, Shape::Ack, move |reply| {
                if let Err(e) = reply {
                    log::warn!(target: "bridge", "failed to clear breakpoint {id}: {e}");
                }
            })?;
        }

        let mut registered = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = {
                let mut translator = translator.lock().expect("translator lock");
                translator.next_breakpoint_id()
            };
            let policy = if spec.log_message.is_some() { "none" } else { "suspend" };
            let payload = format!(
                "{}\t{}\t{policy}\t{}\t{}",
                back::escape(source),
                spec.line,
                back::escape(spec.condition.as_deref().unwrap_or_default()),
                back::escape(spec.log_message.as_deref().unwrap_or_default()),
            );

            let entry = match correlator
                .send(back, Command::SetBreak, &payload, Shape::BreakStatus)?
                .wait()
            {
                Ok(reply) => {
                    let (handle, verified, reason) = parse_break_status(&reply.payload)?;
                    Registered { id, line: spec.line, handle, verified, reason }
                }
                Err(e) if !e.is_fatal() => {
                    log::warn!(target: "bridge", "breakpoint {id} not verified: {e}");
                    Registered {
                        id,
                        line: spec.line,
                        handle: 0,
                        verified: false,
                        reason: Some(e.to_string()),
                    }
                }
                Err(e) => return Err(e),
            };
            registered.push(entry);
        }

        let statuses = registered
            .iter()
            .map(|b| breakpoint_status(b.id, b.verified, b.line, b.reason.clone()))
            .collect();
        let mut by_source = self.by_source.lock().expect("breakpoint table lock");
        by_source.insert(source.to_string(), registered);
        Ok(statuses)
    }

    /// Replace the exception-break configuration wholesale. Only the
    /// difference against the previous set is sent to the engine;
    /// acknowledgements are logged, not surfaced.
    pub fn set_exception_filters(
        &self,
        back: &BackOut,
        correlator: &Correlator,
        filters: Vec<String>,
    ) -> Result<()> {
        let previous = {
            let mut stored = self.filters.lock().expect("filter table lock");
            std::mem::replace(&mut *stored, filters.clone())
        };

        for removed in previous.iter().filter(|f| !filters.contains(f)) {
            let name = removed.clone();
            correlator.send_with(
                back,
                Command::RemoveExceptionBreak,
                &back::escape(removed),
                Shape::Ack,
                move |reply| {
                    if let Err(e) = reply {
                        log::warn!(target: "bridge", "failed to clear exception filter `{name}`: {e}");
                    }
                },
            )?;
        }
        for added in filters.iter().filter(|f| !previous.contains(f)) {
            let name = added.clone();
            correlator.send_with(
                back,
                Command::AddExceptionBreak,
                &back::escape(added),
                Shape::Ack,
                move |reply| {
                    if let Err(e) = reply {
                        log::warn!(target: "bridge", "failed to set exception filter `{name}`: {e}");
                    }
                },
            )?;
        }
        Ok(())
    }

    /// Number of breakpoints currently registered for a source.
    pub fn active_count(&self, source: &str) -> usize {
        self.by_source
            .lock()
            .expect("breakpoint table lock")
            .get(source)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

fn breakpoint_status(id: i64, verified: bool, line: i64, reason: Option<String>) -> Value {
    let mut status = json!({
        "id": id,
        "verified": verified,
        "line": line,
    });
    if let Some(reason) = reason {
        status["message"] = Value::String(reason);
    }
    status
}

fn parse_break_status(payload: &str) -> Result<(i64, bool, Option<String>)> {
    let mut fields = payload.split('\t');
    let (Some(handle), Some(verified)) = (fields.next(), fields.next()) else {
        return Err(Error::MalformedRecord(format!("bad breakpoint status `{payload}`")));
    };
    let handle = handle
        .parse::<i64>()
        .map_err(|_| Error::MalformedRecord("non-numeric breakpoint handle".into()))?;
    let verified = verified == "1";
    let reason = fields.next().filter(|r| !r.is_empty()).map(back::unescape);
    Ok((handle, verified, reason))
}
