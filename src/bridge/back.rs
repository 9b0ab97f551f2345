//! Engine-protocol records and payload codecs.
//!
//! The back channel carries newline-terminated records of the form
//! `<command-id>\t<sequence>\t<payload>`. Composite payloads (thread lists,
//! frame lists, variables) are sequences of self-closed markup elements.

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bridge::error::{Error, Result};

/// First sequence number the bridge assigns to its own engine commands.
/// Far above anything the engine generates for itself, so the two
/// namespaces can never collide.
pub const SEQ_START: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::FromRepr, strum_macros::Display)]
#[repr(u32)]
pub enum Command {
    Run = 101,
    ListThreads = 102,
    ThreadCreate = 103,
    ThreadExit = 104,
    Suspend = 105,
    Resume = 106,
    StepInto = 107,
    StepOver = 108,
    StepOut = 109,
    GetVariables = 110,
    SetBreak = 111,
    RemoveBreak = 112,
    Evaluate = 113,
    GetFrames = 114,
    Output = 116,
    ChangeVariable = 117,
    Exit = 119,
    AddExceptionBreak = 122,
    RemoveExceptionBreak = 123,
    ProcessExit = 130,
    Version = 501,
    ReturnOk = 502,
    ReturnError = 901,
}

/// Command field of a decoded record. Ids outside the known set stay
/// opaque and flow through to the router untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Known(Command),
    Opaque(u32),
}

#[derive(Debug, Clone)]
pub struct Record {
    pub command: CommandId,
    pub seq: i64,
    pub payload: String,
}

pub fn decode(line: &str) -> Result<Record> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = line.splitn(3, '\t');
    let (Some(id), Some(seq), Some(payload)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(Error::MalformedRecord(format!("expected 3 fields in `{line}`")));
    };

    let id = id
        .parse::<u32>()
        .map_err(|_| Error::MalformedRecord(format!("bad command id `{id}`")))?;
    let seq = seq
        .parse::<i64>()
        .map_err(|_| Error::MalformedRecord(format!("bad sequence number `{seq}`")))?;

    let command = match Command::from_repr(id) {
        Some(cmd) => CommandId::Known(cmd),
        None => CommandId::Opaque(id),
    };

    Ok(Record {
        command,
        seq,
        payload: payload.to_string(),
    })
}

pub fn encode(command: Command, seq: i64, payload: &str) -> String {
    format!("{}\t{seq}\t{payload}\n", command as u32)
}

/// Escape one payload text field so it survives the tab/newline framing.
pub fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\t', "\\t").replace('\n', "\\n")
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Serialized writer half of the back channel, owner of the bridge-side
/// sequence counter.
pub struct BackOut {
    writer: Mutex<Box<dyn Write + Send>>,
    next_seq: AtomicI64,
}

impl BackOut {
    pub fn new(writer: impl Write + Send + 'static) -> BackOut {
        BackOut {
            writer: Mutex::new(Box::new(writer)),
            next_seq: AtomicI64::new(SEQ_START),
        }
    }

    pub fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(2, Ordering::SeqCst)
    }

    pub fn send(&self, command: Command, seq: i64, payload: &str) -> Result<()> {
        log::debug!(target: "back", "send {command} {seq}: {payload}");
        let mut writer = self.writer.lock().expect("back sink lock");
        writer.write_all(encode(command, seq, payload).as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Transmit a command nobody will wait on. A sequence number is still
    /// burned so the engine sees a strictly increasing stream.
    pub fn send_detached(&self, command: Command, payload: &str) -> Result<i64> {
        let seq = self.next_seq();
        self.send(command, seq, payload)?;
        Ok(seq)
    }
}

// ---------------------------------- markup payloads ----------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: i64,
    pub name: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub value: String,
    pub r#type: String,
    pub expandable: bool,
}

/// Reason carried by a `Suspend` event: the id of the command that caused
/// the stop, plus exception details when the cause was an exception break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendInfo {
    pub thread_id: i64,
    pub cause: u32,
    pub exception: Option<(String, String)>,
}

static ELEMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(\w+)((?:\s+\w+="[^"]*")*)\s*/>"#).expect("must compile")
});
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("must compile"));

fn entity_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn elements<'p>(payload: &'p str, tag: &str) -> impl Iterator<Item = Vec<(String, String)>> + 'p {
    let tag = tag.to_string();
    ELEMENT_RE.captures_iter(payload).filter_map(move |caps| {
        if &caps[1] != tag {
            return None;
        }
        let attrs = ATTR_RE
            .captures_iter(caps.get(2).map_or("", |m| m.as_str()))
            .map(|a| (a[1].to_string(), entity_unescape(&a[2])))
            .collect();
        Some(attrs)
    })
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn required<'a>(attrs: &'a [(String, String)], name: &str, tag: &str) -> Result<&'a str> {
    attr(attrs, name)
        .ok_or_else(|| Error::MalformedRecord(format!("<{tag}> element without `{name}`")))
}

pub fn parse_thread_list(payload: &str) -> Result<Vec<ThreadInfo>> {
    elements(payload, "thread")
        .map(|attrs| {
            let id = required(&attrs, "id", "thread")?
                .parse::<i64>()
                .map_err(|_| Error::MalformedRecord("non-numeric thread id".into()))?;
            let name = required(&attrs, "name", "thread")?.to_string();
            Ok(ThreadInfo { id, name })
        })
        .collect()
}

pub fn parse_frame_list(payload: &str) -> Result<Vec<FrameInfo>> {
    elements(payload, "frame")
        .map(|attrs| {
            let id = required(&attrs, "id", "frame")?
                .parse::<i64>()
                .map_err(|_| Error::MalformedRecord("non-numeric frame id".into()))?;
            let line = required(&attrs, "line", "frame")?
                .parse::<u32>()
                .map_err(|_| Error::MalformedRecord("non-numeric frame line".into()))?;
            Ok(FrameInfo {
                id,
                name: required(&attrs, "name", "frame")?.to_string(),
                file: required(&attrs, "file", "frame")?.to_string(),
                line,
            })
        })
        .collect()
}

pub fn parse_var_list(payload: &str) -> Result<Vec<VarInfo>> {
    elements(payload, "var")
        .map(|attrs| {
            Ok(VarInfo {
                name: required(&attrs, "name", "var")?.to_string(),
                value: required(&attrs, "value", "var")?.to_string(),
                r#type: attr(&attrs, "type").unwrap_or_default().to_string(),
                expandable: attr(&attrs, "expandable") == Some("1"),
            })
        })
        .collect()
}

pub fn parse_suspend(payload: &str) -> Result<SuspendInfo> {
    let mut fields = payload.split('\t');
    let (Some(tid), Some(cause)) = (fields.next(), fields.next()) else {
        return Err(Error::MalformedRecord(format!("bad suspend payload `{payload}`")));
    };
    let thread_id = tid
        .parse::<i64>()
        .map_err(|_| Error::MalformedRecord("non-numeric suspended thread id".into()))?;
    let cause = cause
        .parse::<u32>()
        .map_err(|_| Error::MalformedRecord("non-numeric suspend cause".into()))?;

    let exception = match (fields.next(), fields.next()) {
        (Some(name), Some(message)) => Some((unescape(name), unescape(message))),
        _ => None,
    };

    Ok(SuspendInfo {
        thread_id,
        cause,
        exception,
    })
}
