//! Front-protocol envelopes and framing.
//!
//! The front channel carries JSON bodies behind `Content-Length` headers.
//! Every body has a sender-assigned `seq` and a `type` discriminator; the
//! bridge numbers its own outgoing responses and events starting from 1,
//! in write order.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::error::{Error, Result};

/// Upper bound for a single frame body. Anything larger is treated as
/// inconsistent framing metadata, not as a request to allocate.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Read one framed message. Unknown header lines are skipped, the blank
/// line terminates the header block.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Message> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(Error::ChannelClosed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            let len = v
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::MalformedFrame(format!("bad Content-Length `{}`", v.trim())))?;
            content_length = Some(len);
        }
    }

    let len =
        content_length.ok_or_else(|| Error::MalformedFrame("missing Content-Length".into()))?;
    if len > MAX_FRAME_LEN {
        return Err(Error::MalformedFrame(format!("frame of {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| Error::InvalidPayload(e.to_string()))
}

pub fn write_frame(writer: &mut impl Write, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message).map_err(|e| Error::InvalidPayload(e.to_string()))?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

struct Sink {
    writer: Box<dyn Write + Send>,
    next_seq: i64,
}

/// Serialized writer half of the front channel. Sequence numbers are
/// assigned under the writer lock so they always match the write order.
pub struct FrontOut {
    sink: Mutex<Sink>,
}

impl FrontOut {
    pub fn new(writer: impl Write + Send + 'static) -> FrontOut {
        FrontOut {
            sink: Mutex::new(Sink {
                writer: Box::new(writer),
                next_seq: 1,
            }),
        }
    }

    fn send(&self, build: impl FnOnce(i64) -> Message) -> Result<()> {
        let mut sink = self.sink.lock().expect("front sink lock");
        let seq = sink.next_seq;
        sink.next_seq += 1;
        let message = build(seq);
        write_frame(&mut sink.writer, &message)
    }

    pub fn respond_success(&self, req: &Request, body: Option<Value>) -> Result<()> {
        log::debug!(target: "front", "success {}: {:?}", req.seq, body);
        let command = req.command.clone();
        self.send(|seq| {
            Message::Response(Response {
                seq,
                request_seq: req.seq,
                success: true,
                command,
                message: None,
                body,
            })
        })
    }

    pub fn respond_error(&self, req: &Request, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        log::debug!(target: "front", "error {}: {message}", req.seq);
        let command = req.command.clone();
        self.send(|seq| {
            Message::Response(Response {
                seq,
                request_seq: req.seq,
                success: false,
                command,
                message: Some(message),
                body: None,
            })
        })
    }

    pub fn event(&self, name: &str, body: Option<Value>) -> Result<()> {
        log::debug!(target: "front", "event {name}: {:?}", body);
        self.send(|seq| {
            Message::Event(Event {
                seq,
                event: name.to_string(),
                body,
            })
        })
    }
}
