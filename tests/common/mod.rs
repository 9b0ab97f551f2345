//! Shared harness for session tests: a front-protocol client and a
//! scripted fake engine, both talking to an in-process bridge session
//! over loopback TCP.

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use dapbridge::bridge::{Session, SessionOptions};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// First sequence number the bridge assigns on the engine channel.
pub const BRIDGE_SEQ_START: i64 = 1_000_000_000;

pub const CMD_RUN: u32 = 101;
pub const CMD_LIST_THREADS: u32 = 102;
pub const CMD_THREAD_CREATE: u32 = 103;
pub const CMD_SUSPEND: u32 = 105;
pub const CMD_RESUME: u32 = 106;
pub const CMD_STEP_OVER: u32 = 108;
pub const CMD_GET_VARIABLES: u32 = 110;
pub const CMD_SET_BREAK: u32 = 111;
pub const CMD_REMOVE_BREAK: u32 = 112;
pub const CMD_EVALUATE: u32 = 113;
pub const CMD_GET_FRAMES: u32 = 114;
pub const CMD_OUTPUT: u32 = 116;
pub const CMD_CHANGE_VARIABLE: u32 = 117;
pub const CMD_EXIT: u32 = 119;
pub const CMD_ADD_EXCEPTION_BREAK: u32 = 122;
pub const CMD_REMOVE_EXCEPTION_BREAK: u32 = 123;
pub const CMD_PROCESS_EXIT: u32 = 130;
pub const CMD_VERSION: u32 = 501;

/// Spin up a bridge session wired to a fresh client and fake engine.
pub fn start_session() -> anyhow::Result<(FrontClient, FakeEngine)> {
    start_session_with(SessionOptions::default())
}

pub fn start_session_with(options: SessionOptions) -> anyhow::Result<(FrontClient, FakeEngine)> {
    let front_listener = TcpListener::bind("127.0.0.1:0").context("bind front listener")?;
    let back_listener = TcpListener::bind("127.0.0.1:0").context("bind back listener")?;
    let front_addr = front_listener.local_addr()?;
    let back_addr = back_listener.local_addr()?;

    thread::spawn(move || {
        let Ok((front, _)) = front_listener.accept() else {
            return;
        };
        let Ok(back) = TcpStream::connect(back_addr) else {
            return;
        };
        let Ok(session) = Session::attach(front, back, options) else {
            return;
        };
        let _ = session.run();
    });

    let client = FrontClient::connect(front_addr)?;
    let (engine_stream, _) = back_listener.accept().context("engine accept")?;
    let engine = FakeEngine::new(engine_stream)?;
    Ok((client, engine))
}

pub struct FrontClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_seq: i64,
    pending_events: VecDeque<Value>,
    /// Names of every event observed, in arrival order.
    pub seen_events: Vec<String>,
}

impl FrontClient {
    pub fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).context("connect front client")?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
            pending_events: VecDeque::new(),
            seen_events: Vec::new(),
        })
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_message(&request)?;
        Ok(seq)
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        loop {
            let msg = self.read_message()?;
            match msg.get("type").and_then(Value::as_str) {
                Some("event") => self.pending_events.push_back(msg),
                Some("response") => {
                    if msg.get("request_seq").and_then(Value::as_i64) == Some(request_seq) {
                        return Ok(msg);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn read_event(&mut self) -> anyhow::Result<Value> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            let msg = self.read_message()?;
            if msg.get("type").and_then(Value::as_str) == Some("event") {
                return Ok(msg);
            }
        }
    }

    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        loop {
            let event = self.read_event()?;
            if event.get("event").and_then(Value::as_str) == Some(name) {
                return Ok(event);
            }
        }
    }

    fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("Timed out waiting for front header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("front connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        let mut offset = 0;
        while offset < buf.len() {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Err(anyhow!("front connection closed")),
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("Timed out waiting for front body"));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let msg: Value = serde_json::from_slice(&buf)?;
        if msg.get("type").and_then(Value::as_str) == Some("event") {
            if let Some(name) = msg.get("event").and_then(Value::as_str) {
                self.seen_events.push(name.to_string());
            }
        }
        Ok(msg)
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        write!(self.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Plays the in-process debug engine: reads bridge commands off the back
/// channel and emits scripted replies and notifications.
pub struct FakeEngine {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_seq: i64,
}

impl FakeEngine {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
        })
    }

    /// Read the next command record from the bridge.
    pub fn expect_command(&mut self) -> anyhow::Result<(u32, i64, String)> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut line = String::new();
        loop {
            match self.reader.read_line(&mut line) {
                Ok(0) => return Err(anyhow!("back connection closed")),
                Ok(_) => break,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("Timed out waiting for engine command"));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.splitn(3, '\t');
        let (Some(id), Some(seq), Some(payload)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(anyhow!("short record: `{line}`"));
        };
        Ok((id.parse()?, seq.parse()?, payload.to_string()))
    }

    pub fn reply_ok(&mut self, seq: i64, payload: &str) -> anyhow::Result<()> {
        self.send_record(502, seq, payload)
    }

    pub fn reply_error(&mut self, seq: i64, message: &str) -> anyhow::Result<()> {
        self.send_record(901, seq, message)
    }

    /// Emit an unsolicited notification with an engine-side sequence
    /// number (small and odd, far from the bridge's own counter).
    pub fn send_event(&mut self, command: u32, payload: &str) -> anyhow::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 2;
        self.send_record(command, seq, payload)
    }

    pub fn send_record(&mut self, command: u32, seq: i64, payload: &str) -> anyhow::Result<()> {
        writeln!(self.stream, "{command}\t{seq}\t{payload}")?;
        self.stream.flush()?;
        Ok(())
    }
}

// ------------------------------------ scenario helpers -------------------------------------------

/// Run the initialize exchange: version handshake with the engine, the
/// capabilities response and the `initialized` event.
pub fn initialize(client: &mut FrontClient, engine: &mut FakeEngine) -> anyhow::Result<Value> {
    let seq = client.send_request("initialize", json!({ "adapterID": "tests" }))?;

    let (cmd, engine_seq, _payload) = engine.expect_command()?;
    assert_eq!(cmd, CMD_VERSION);
    assert_eq!(engine_seq, BRIDGE_SEQ_START);
    engine.reply_ok(engine_seq, "0.1\t4242")?;

    let response = client.read_response(seq)?;
    assert_eq!(response["success"], true, "initialize failed: {response}");
    client.wait_for_event("initialized")?;
    Ok(response["body"].clone())
}

pub fn attach(client: &mut FrontClient) -> anyhow::Result<()> {
    let seq = client.send_request("attach", json!({ "program": "/w/spam" }))?;
    let response = client.read_response(seq)?;
    assert_eq!(response["success"], true, "attach failed: {response}");
    Ok(())
}

/// Finish configuration: the bridge tells the engine to run the target
/// and emits the `process` event.
pub fn configuration_done(client: &mut FrontClient, engine: &mut FakeEngine) -> anyhow::Result<()> {
    let seq = client.send_request("configurationDone", json!({}))?;
    let (cmd, _, _) = engine.expect_command()?;
    assert_eq!(cmd, CMD_RUN);
    let response = client.read_response(seq)?;
    assert_eq!(response["success"], true, "configurationDone failed: {response}");
    Ok(())
}

pub fn disconnect(client: &mut FrontClient, engine: &mut FakeEngine) -> anyhow::Result<()> {
    let seq = client.send_request("disconnect", json!({}))?;
    let (cmd, _, _) = engine.expect_command()?;
    assert_eq!(cmd, CMD_EXIT);
    let response = client.read_response(seq)?;
    assert_eq!(response["success"], true, "disconnect failed: {response}");
    Ok(())
}
