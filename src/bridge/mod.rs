//! The bridge engine: one `Session` per debugged-process attachment.
//!
//! A session owns both protocol channels. Two read loops run concurrently,
//! one per channel; outbound writes are serialized per channel. Front
//! requests are dispatched from the front loop (blocking on their own
//! pending engine replies only), engine notifications flow through the
//! [`router::EventRouter`] on the back loop.

pub mod back;
pub mod breakpoint;
pub mod correlate;
pub mod error;
pub mod front;
pub mod ids;
pub mod router;
pub mod state;

use std::io::{BufRead, BufReader};
use std::net::{Shutdown, TcpStream};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use itertools::Itertools;
use serde_json::{json, Value};

use back::{BackOut, Command, CommandId};
use breakpoint::{BreakpointManager, Spec};
use correlate::{Correlator, Shape};
use error::{Error, Result};
use front::{FrontOut, Request};
use ids::{Translator, VarRef, VarScope};
use router::EventRouter;
use state::{FrontCommand, Phase, SessionState};

pub struct SessionOptions {
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Default)]
struct Target {
    name: Option<String>,
    start_method: Option<&'static str>,
    system_pid: Option<i64>,
}

struct Inner {
    front: Arc<FrontOut>,
    back: Arc<BackOut>,
    correlator: Arc<Correlator>,
    translator: Arc<Mutex<Translator>>,
    state: Arc<SessionState>,
    router: EventRouter,
    breakpoints: BreakpointManager,
    target: Mutex<Target>,
    front_stream: TcpStream,
    back_stream: TcpStream,
}

/// A live bridge session over two connected streams.
pub struct Session {
    inner: Arc<Inner>,
    front_reader: BufReader<TcpStream>,
    back_reader: BufReader<TcpStream>,
}

/// Cheap clone handed to watchdogs (signal handlers etc.) to force a
/// session into teardown from outside the read loops.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    pub fn terminate(&self, reason: &str) {
        let _ = self.inner.back.send_detached(Command::Exit, "");
        self.inner.teardown(reason);
    }
}

impl Session {
    pub fn attach(front: TcpStream, back: TcpStream, options: SessionOptions) -> Result<Session> {
        front.set_nodelay(true)?;
        back.set_nodelay(true)?;

        let front_reader = BufReader::new(front.try_clone()?);
        let back_reader = BufReader::new(back.try_clone()?);

        let front_out = Arc::new(FrontOut::new(front.try_clone()?));
        let back_out = Arc::new(BackOut::new(back.try_clone()?));
        let correlator = Arc::new(Correlator::new(options.request_timeout));
        let translator = Arc::new(Mutex::new(Translator::default()));
        let state = Arc::new(SessionState::new());
        let router = EventRouter::new(
            front_out.clone(),
            state.clone(),
            translator.clone(),
            correlator.clone(),
        );

        Ok(Session {
            inner: Arc::new(Inner {
                front: front_out,
                back: back_out,
                correlator,
                translator,
                state,
                router,
                breakpoints: BreakpointManager::new(),
                target: Mutex::new(Target::default()),
                front_stream: front,
                back_stream: back,
            }),
            front_reader,
            back_reader,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: self.inner.clone(),
        }
    }

    /// Drive the session until either channel goes away or the client
    /// disconnects.
    pub fn run(self) -> Result<()> {
        let back_loop = {
            let inner = self.inner.clone();
            let reader = self.back_reader;
            thread::Builder::new()
                .name("back-loop".to_string())
                .spawn(move || back_loop(inner, reader))?
        };

        front_loop(&self.inner, self.front_reader);

        if back_loop.join().is_err() {
            log::error!(target: "bridge", "back loop panicked");
        }
        Ok(())
    }
}

fn front_loop(inner: &Inner, mut reader: BufReader<TcpStream>) {
    loop {
        let message = match front::read_frame(&mut reader) {
            Ok(message) => message,
            Err(Error::ChannelClosed) => {
                inner.teardown("front channel closed");
                break;
            }
            Err(e) => {
                log::error!(target: "front", "{e}");
                inner.teardown("front decode failure");
                break;
            }
        };

        if inner.state.phase() == Phase::Closed {
            log::warn!(target: "front", "message after session close dropped");
            continue;
        }

        let request = match message {
            front::Message::Request(request) => request,
            other => {
                log::warn!(target: "front", "ignoring non-request message: {other:?}");
                continue;
            }
        };

        match inner.handle_request(&request) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                log::error!(target: "front", "{e}");
                inner.teardown("front channel failure");
                break;
            }
        }
    }
}

fn back_loop(inner: Arc<Inner>, mut reader: BufReader<TcpStream>) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {
                inner.teardown("engine channel closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if inner.state.phase() != Phase::Closed {
                    log::error!(target: "back", "{e}");
                }
                inner.teardown("engine channel failure");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let record = match back::decode(&line) {
            Ok(record) => record,
            Err(e) => {
                log::error!(target: "back", "{e}");
                inner.teardown("engine decode failure");
                break;
            }
        };

        match record.command {
            CommandId::Known(Command::ReturnOk) | CommandId::Known(Command::ReturnError) => {
                let seq = record.seq;
                let reply = match record.command {
                    CommandId::Known(Command::ReturnError) => {
                        Err(Error::Engine(back::unescape(&record.payload)))
                    }
                    _ => Ok(record),
                };
                if let Err(e) = inner.correlator.resolve(seq, reply) {
                    // legitimate for fire-and-forget commands
                    log::warn!(target: "back", "{e}");
                }
            }
            _ => {
                if let Err(e) = inner.router.dispatch(record) {
                    if e.is_fatal() {
                        log::error!(target: "back", "{e}");
                        inner.teardown("engine notification failure");
                        break;
                    }
                    log::warn!(target: "back", "{e}");
                }
            }
        }
    }
}

impl Inner {
    /// Idempotent session teardown: fail all waiters, close both channels.
    fn teardown(&self, reason: &str) {
        if self.state.phase() == Phase::Closed {
            return;
        }
        log::info!(target: "bridge", "session teardown: {reason}");
        self.state.set(Phase::Terminating);
        self.correlator.cancel_all(reason);
        let _ = self.front_stream.shutdown(Shutdown::Both);
        let _ = self.back_stream.shutdown(Shutdown::Both);
        self.state.set(Phase::Closed);
    }

    /// Returns `Ok(false)` when the front loop should stop.
    fn handle_request(&self, req: &Request) -> Result<bool> {
        log::debug!(target: "front", "{}: {} {:?}", req.seq, req.command, req.arguments);

        let Ok(command) = FrontCommand::from_str(&req.command) else {
            log::warn!(target: "front", "unsupported command `{}`", req.command);
            self.front
                .respond_error(req, format!("unsupported command `{}`", req.command))?;
            return Ok(true);
        };

        if let Err(e) = self.state.check(command) {
            self.front.respond_error(req, e.to_string())?;
            return Ok(true);
        }

        let result = match command {
            FrontCommand::Initialize => self.handle_initialize(req),
            FrontCommand::Attach => self.handle_attach_or_launch(req, "attach"),
            FrontCommand::Launch => self.handle_attach_or_launch(req, "launch"),
            FrontCommand::SetBreakpoints => self.handle_set_breakpoints(req),
            FrontCommand::SetExceptionBreakpoints => self.handle_set_exception_breakpoints(req),
            FrontCommand::ConfigurationDone => self.handle_configuration_done(req),
            FrontCommand::Threads => self.handle_threads(req),
            FrontCommand::StackTrace => self.handle_stack_trace(req),
            FrontCommand::Scopes => self.handle_scopes(req),
            FrontCommand::Variables => self.handle_variables(req),
            FrontCommand::SetVariable => self.handle_set_variable(req),
            FrontCommand::Evaluate => self.handle_evaluate(req),
            FrontCommand::Continue => self.handle_continue(req),
            FrontCommand::Next => self.handle_step(req, Command::StepOver),
            FrontCommand::StepIn => self.handle_step(req, Command::StepInto),
            FrontCommand::StepOut => self.handle_step(req, Command::StepOut),
            FrontCommand::Pause => self.handle_pause(req),
            FrontCommand::ExceptionInfo => self.handle_exception_info(req),
            FrontCommand::Disconnect => {
                self.handle_disconnect(req)?;
                return Ok(false);
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if !e.is_fatal() => {
                self.front.respond_error(req, e.to_string())?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_initialize(&self, req: &Request) -> Result<()> {
        let payload = format!("1\t{}", std::env::consts::OS);
        let reply = self
            .correlator
            .send(&self.back, Command::Version, &payload, Shape::VersionInfo)?
            .wait()?;

        let mut fields = reply.payload.split('\t');
        let engine_version = fields.next().unwrap_or_default();
        let system_pid = fields.next().and_then(|pid| pid.parse::<i64>().ok());
        log::info!(target: "bridge", "engine version {engine_version}, target pid {system_pid:?}");
        self.target.lock().expect("target lock").system_pid = system_pid;

        self.front.respond_success(
            req,
            Some(json!({
                "supportsConfigurationDoneRequest": true,
                "supportsConditionalBreakpoints": true,
                "supportsSetVariable": true,
                "supportsExceptionInfoRequest": true,
                "supportsExceptionOptions": true,
                "exceptionBreakpointFilters": [
                    { "filter": "raised", "label": "Raised Exceptions", "default": true },
                    { "filter": "uncaught", "label": "Uncaught Exceptions", "default": true },
                ],
            })),
        )?;
        self.front.event("initialized", None)
    }

    fn handle_attach_or_launch(&self, req: &Request, method: &'static str) -> Result<()> {
        let name = req
            .arguments
            .get("program")
            .or_else(|| req.arguments.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("<target>")
            .to_string();

        {
            let mut target = self.target.lock().expect("target lock");
            target.name = Some(name);
            target.start_method = Some(method);
        }
        self.state.set_if_active(Phase::Configuring);
        self.front.respond_success(req, None)
    }

    fn handle_set_breakpoints(&self, req: &Request) -> Result<()> {
        let Some(source) = req
            .arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
        else {
            return self.front.respond_error(req, "missing arguments.source.path");
        };

        let mut specs = Vec::new();
        for spec in req
            .arguments
            .get("breakpoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            // clients disagree on whether `line` is a number or a string
            let line = spec.get("line").and_then(|l| {
                l.as_i64().or_else(|| l.as_str().and_then(|s| s.parse().ok()))
            });
            let Some(line) = line else {
                return self.front.respond_error(req, "breakpoint without a line");
            };
            specs.push(Spec {
                line,
                condition: spec.get("condition").and_then(Value::as_str).map(str::to_string),
                log_message: spec.get("logMessage").and_then(Value::as_str).map(str::to_string),
            });
        }

        let statuses = self.breakpoints.set_breakpoints(
            &self.back,
            &self.correlator,
            &self.translator,
            source,
            &specs,
        )?;
        self.front
            .respond_success(req, Some(json!({ "breakpoints": statuses })))
    }

    fn handle_set_exception_breakpoints(&self, req: &Request) -> Result<()> {
        let filters = req
            .arguments
            .get("filters")
            .and_then(Value::as_array)
            .map(|filters| {
                filters
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect_vec()
            })
            .unwrap_or_default();

        self.breakpoints
            .set_exception_filters(&self.back, &self.correlator, filters)?;
        self.front.respond_success(req, None)
    }

    fn handle_configuration_done(&self, req: &Request) -> Result<()> {
        self.back.send_detached(Command::Run, "")?;
        self.front.respond_success(req, None)?;

        let body = {
            let target = self.target.lock().expect("target lock");
            json!({
                "name": target.name.as_deref().unwrap_or("<target>"),
                "systemProcessId": target.system_pid,
                "isLocalProcess": true,
                "startMethod": target.start_method.unwrap_or("attach"),
            })
        };
        self.state.set_if_active(Phase::Running);
        self.router.flush_configured(body)
    }

    fn handle_threads(&self, req: &Request) -> Result<()> {
        let reply = self
            .correlator
            .send(&self.back, Command::ListThreads, "", Shape::ThreadList)?
            .wait()?;
        let infos = back::parse_thread_list(&reply.payload)?;

        let mut translator = self.translator.lock().expect("translator lock");
        let mut threads = Vec::with_capacity(infos.len());
        for info in &infos {
            translator.allocate_thread(info.id, &info.name);
            if let Some(thread) = translator.thread_by_back_id(info.id) {
                if !thread.hidden {
                    threads.push(json!({ "id": thread.front_id, "name": thread.name }));
                }
            }
        }
        drop(translator);

        self.front
            .respond_success(req, Some(json!({ "threads": threads })))
    }

    fn handle_stack_trace(&self, req: &Request) -> Result<()> {
        let Some(thread_id) = req.arguments.get("threadId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.threadId");
        };

        let (back_id, stopped) = {
            let translator = self.translator.lock().expect("translator lock");
            let thread = translator.resolve_thread(thread_id)?;
            (thread.back_id, thread.stopped)
        };
        if !stopped {
            return self
                .front
                .respond_error(req, format!("thread {thread_id} is not suspended"));
        }

        let reply = self
            .correlator
            .send(&self.back, Command::GetFrames, &back_id.to_string(), Shape::FrameList)?
            .wait()?;
        let frames = back::parse_frame_list(&reply.payload)?;

        let mut translator = self.translator.lock().expect("translator lock");
        let stack_frames = frames
            .iter()
            .map(|frame| {
                let front_id = translator.allocate_frame(thread_id, frame.id);
                json!({
                    "id": front_id,
                    "name": frame.name,
                    "source": { "path": frame.file },
                    "line": frame.line,
                    "column": 0,
                })
            })
            .collect_vec();
        drop(translator);

        self.front.respond_success(
            req,
            Some(json!({
                "stackFrames": stack_frames,
                "totalFrames": stack_frames.len(),
            })),
        )
    }

    fn handle_scopes(&self, req: &Request) -> Result<()> {
        let Some(frame_id) = req.arguments.get("frameId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.frameId");
        };

        let mut translator = self.translator.lock().expect("translator lock");
        let frame = translator.resolve_frame(frame_id)?;
        let thread_back_id = translator.resolve_thread(frame.thread_front_id)?.back_id;

        let scopes = [VarScope::Locals, VarScope::Arguments]
            .into_iter()
            .map(|scope| {
                let reference = translator.allocate_var(VarRef {
                    thread_front_id: frame.thread_front_id,
                    thread_back_id,
                    frame_back_id: frame.back_id,
                    path: scope.root_path().to_string(),
                });
                let name = match scope {
                    VarScope::Locals => "Locals",
                    VarScope::Arguments => "Arguments",
                };
                json!({ "name": name, "variablesReference": reference, "expensive": false })
            })
            .collect_vec();
        drop(translator);

        self.front.respond_success(req, Some(json!({ "scopes": scopes })))
    }

    fn handle_variables(&self, req: &Request) -> Result<()> {
        let Some(reference) = req.arguments.get("variablesReference").and_then(Value::as_i64)
        else {
            return self
                .front
                .respond_error(req, "missing arguments.variablesReference");
        };

        let var = {
            let translator = self.translator.lock().expect("translator lock");
            translator.resolve_var(reference)?
        };
        let payload = format!(
            "{}\t{}\t{}",
            var.thread_back_id,
            var.frame_back_id,
            back::escape(&var.path)
        );
        let reply = self
            .correlator
            .send(&self.back, Command::GetVariables, &payload, Shape::VarList)?
            .wait()?;
        let infos = back::parse_var_list(&reply.payload)?;

        let mut translator = self.translator.lock().expect("translator lock");
        let variables = infos
            .iter()
            .map(|info| {
                let child_ref = if info.expandable {
                    translator.allocate_var(VarRef {
                        thread_front_id: var.thread_front_id,
                        thread_back_id: var.thread_back_id,
                        frame_back_id: var.frame_back_id,
                        path: format!("{}.{}", var.path, info.name),
                    })
                } else {
                    0
                };
                json!({
                    "name": info.name,
                    "value": info.value,
                    "type": info.r#type,
                    "variablesReference": child_ref,
                })
            })
            .collect_vec();
        drop(translator);

        self.front
            .respond_success(req, Some(json!({ "variables": variables })))
    }

    fn handle_set_variable(&self, req: &Request) -> Result<()> {
        let (Some(reference), Some(name), Some(value)) = (
            req.arguments.get("variablesReference").and_then(Value::as_i64),
            req.arguments.get("name").and_then(Value::as_str),
            req.arguments.get("value").and_then(Value::as_str),
        ) else {
            return self
                .front
                .respond_error(req, "setVariable needs variablesReference, name and value");
        };

        let var = {
            let translator = self.translator.lock().expect("translator lock");
            translator.resolve_var(reference)?
        };
        let payload = format!(
            "{}\t{}\t{}\t{}",
            var.thread_back_id,
            var.frame_back_id,
            back::escape(&format!("{}.{name}", var.path)),
            back::escape(value),
        );
        let reply = self
            .correlator
            .send(&self.back, Command::ChangeVariable, &payload, Shape::Var)?
            .wait()?;
        let infos = back::parse_var_list(&reply.payload)?;
        let Some(info) = infos.first() else {
            return self.front.respond_error(req, "engine returned no variable");
        };

        self.front.respond_success(
            req,
            Some(json!({ "value": info.value, "type": info.r#type })),
        )
    }

    fn handle_evaluate(&self, req: &Request) -> Result<()> {
        let Some(expression) = req.arguments.get("expression").and_then(Value::as_str) else {
            return self.front.respond_error(req, "missing arguments.expression");
        };
        let Some(frame_id) = req.arguments.get("frameId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.frameId");
        };

        let (frame, thread_back_id) = {
            let translator = self.translator.lock().expect("translator lock");
            let frame = translator.resolve_frame(frame_id)?;
            let back_id = translator.resolve_thread(frame.thread_front_id)?.back_id;
            (frame, back_id)
        };
        let payload = format!(
            "{thread_back_id}\t{}\t{}",
            frame.back_id,
            back::escape(expression)
        );
        let reply = self
            .correlator
            .send(&self.back, Command::Evaluate, &payload, Shape::Var)?
            .wait()?;
        let infos = back::parse_var_list(&reply.payload)?;
        let Some(info) = infos.first() else {
            return self.front.respond_error(req, "expression produced no result");
        };

        let child_ref = if info.expandable {
            let mut translator = self.translator.lock().expect("translator lock");
            translator.allocate_var(VarRef {
                thread_front_id: frame.thread_front_id,
                thread_back_id,
                frame_back_id: frame.back_id,
                path: expression.to_string(),
            })
        } else {
            0
        };
        self.front.respond_success(
            req,
            Some(json!({
                "result": info.value,
                "type": info.r#type,
                "variablesReference": child_ref,
            })),
        )
    }

    fn handle_continue(&self, req: &Request) -> Result<()> {
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64);
        match thread_id {
            Some(thread_id) => {
                let (back_id, stopped) = {
                    let translator = self.translator.lock().expect("translator lock");
                    let thread = translator.resolve_thread(thread_id)?;
                    (thread.back_id, thread.stopped)
                };
                if !stopped {
                    return self
                        .front
                        .respond_error(req, format!("thread {thread_id} is not suspended"));
                }
                self.correlator
                    .send(&self.back, Command::Resume, &back_id.to_string(), Shape::Ack)?
                    .wait()?;

                let all_continued = {
                    let translator = self.translator.lock().expect("translator lock");
                    !translator.any_stopped_except(thread_id)
                };
                self.front.respond_success(
                    req,
                    Some(json!({ "allThreadsContinued": all_continued })),
                )
            }
            None => {
                self.correlator
                    .send(&self.back, Command::Resume, "*", Shape::Ack)?
                    .wait()?;
                self.front
                    .respond_success(req, Some(json!({ "allThreadsContinued": true })))
            }
        }
    }

    fn handle_step(&self, req: &Request, command: Command) -> Result<()> {
        let Some(thread_id) = req.arguments.get("threadId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.threadId");
        };
        let (back_id, stopped) = {
            let translator = self.translator.lock().expect("translator lock");
            let thread = translator.resolve_thread(thread_id)?;
            (thread.back_id, thread.stopped)
        };
        if !stopped {
            return self
                .front
                .respond_error(req, format!("thread {thread_id} is not suspended"));
        }

        self.correlator
            .send(&self.back, command, &back_id.to_string(), Shape::Ack)?
            .wait()?;
        self.front.respond_success(req, None)
    }

    fn handle_pause(&self, req: &Request) -> Result<()> {
        let Some(thread_id) = req.arguments.get("threadId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.threadId");
        };
        let back_id = {
            let translator = self.translator.lock().expect("translator lock");
            translator.resolve_thread(thread_id)?.back_id
        };

        self.correlator
            .send(&self.back, Command::Suspend, &back_id.to_string(), Shape::Ack)?
            .wait()?;
        self.front.respond_success(req, None)
    }

    fn handle_exception_info(&self, req: &Request) -> Result<()> {
        let Some(thread_id) = req.arguments.get("threadId").and_then(Value::as_i64) else {
            return self.front.respond_error(req, "missing arguments.threadId");
        };
        {
            let translator = self.translator.lock().expect("translator lock");
            translator.resolve_thread(thread_id)?;
        }

        let Some((exception_id, description)) = self.router.exception_details(thread_id) else {
            return Err(Error::UnknownId("exception", thread_id));
        };
        self.front.respond_success(
            req,
            Some(json!({
                "exceptionId": exception_id,
                "description": description,
                "breakMode": "always",
            })),
        )
    }

    fn handle_disconnect(&self, req: &Request) -> Result<()> {
        log::info!(target: "bridge", "client disconnect");
        self.state.set(Phase::Terminating);
        if let Err(e) = self.back.send_detached(Command::Exit, "") {
            log::warn!(target: "back", "failed to send exit command: {e}");
        }
        self.front.respond_success(req, None)?;
        self.teardown("client disconnect");
        Ok(())
    }
}
