//! Identifier translation between the engine's id namespace and the ids
//! visible on the front channel.
//!
//! Thread entries live for the whole session (until the engine retires
//! them). Frame and variable entries are scoped to one suspension of their
//! owning thread and are invalidated in bulk when it resumes; counters are
//! never rewound, so a stale reference can never alias a fresh one.

use indexmap::IndexMap;

use crate::bridge::error::{Error, Result};

/// Engine service threads carry this name prefix. They get ids like any
/// other thread but are hidden from the front channel.
pub const INTERNAL_THREAD_PREFIX: &str = "dbg.";

#[derive(Debug, Clone)]
pub struct ThreadRef {
    pub front_id: i64,
    pub back_id: i64,
    pub name: String,
    pub stopped: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct FrameRef {
    pub front_id: i64,
    pub back_id: i64,
    pub thread_front_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Locals,
    Arguments,
}

impl VarScope {
    pub fn root_path(&self) -> &'static str {
        match self {
            VarScope::Locals => "locals",
            VarScope::Arguments => "args",
        }
    }
}

/// What a front-side `variablesReference` resolves to: a path rooted in
/// one scope of one suspended frame.
#[derive(Debug, Clone)]
pub struct VarRef {
    pub thread_front_id: i64,
    pub thread_back_id: i64,
    pub frame_back_id: i64,
    pub path: String,
}

#[derive(Default)]
pub struct Translator {
    threads: IndexMap<i64, ThreadRef>,
    frames: IndexMap<i64, FrameRef>,
    vars: IndexMap<i64, VarRef>,
    next_thread: i64,
    next_frame: i64,
    next_var: i64,
    next_breakpoint: i64,
}

impl Translator {
    /// Register a thread reported by the engine. Idempotent: a back id
    /// seen before keeps its front id.
    pub fn allocate_thread(&mut self, back_id: i64, name: &str) -> i64 {
        if let Some(thread) = self.threads.get_mut(&back_id) {
            if !name.is_empty() {
                thread.name = name.to_string();
            }
            return thread.front_id;
        }

        self.next_thread += 1;
        let front_id = self.next_thread;
        self.threads.insert(
            back_id,
            ThreadRef {
                front_id,
                back_id,
                name: name.to_string(),
                stopped: false,
                hidden: name.starts_with(INTERNAL_THREAD_PREFIX),
            },
        );
        front_id
    }

    pub fn resolve_thread(&self, front_id: i64) -> Result<&ThreadRef> {
        self.threads
            .values()
            .find(|t| t.front_id == front_id)
            .ok_or(Error::UnknownId("thread", front_id))
    }

    pub fn thread_by_back_id(&self, back_id: i64) -> Option<&ThreadRef> {
        self.threads.get(&back_id)
    }

    pub fn retire_thread(&mut self, back_id: i64) -> Option<ThreadRef> {
        let thread = self.threads.shift_remove(&back_id)?;
        self.invalidate_thread_scopes(thread.front_id);
        Some(thread)
    }

    pub fn set_stopped(&mut self, back_id: i64, stopped: bool) {
        if let Some(thread) = self.threads.get_mut(&back_id) {
            thread.stopped = stopped;
        }
    }

    pub fn any_stopped(&self) -> bool {
        self.threads.values().any(|t| t.stopped)
    }

    pub fn any_stopped_except(&self, front_id: i64) -> bool {
        self.threads.values().any(|t| t.stopped && t.front_id != front_id)
    }

    pub fn visible_threads(&self) -> impl Iterator<Item = &ThreadRef> {
        self.threads.values().filter(|t| !t.hidden)
    }

    pub fn allocate_frame(&mut self, thread_front_id: i64, back_id: i64) -> i64 {
        self.next_frame += 1;
        let front_id = self.next_frame;
        self.frames.insert(
            front_id,
            FrameRef {
                front_id,
                back_id,
                thread_front_id,
            },
        );
        front_id
    }

    pub fn resolve_frame(&self, front_id: i64) -> Result<FrameRef> {
        self.frames
            .get(&front_id)
            .cloned()
            .ok_or(Error::UnknownId("frame", front_id))
    }

    pub fn allocate_var(&mut self, var: VarRef) -> i64 {
        self.next_var += 1;
        self.vars.insert(self.next_var, var);
        self.next_var
    }

    pub fn resolve_var(&self, reference: i64) -> Result<VarRef> {
        self.vars
            .get(&reference)
            .cloned()
            .ok_or(Error::UnknownId("variables", reference))
    }

    /// Drop every frame and variable entry owned by a thread. Called when
    /// the thread leaves its stopped state; its old references must fail
    /// resolution from then on.
    pub fn invalidate_thread_scopes(&mut self, thread_front_id: i64) {
        self.frames.retain(|_, f| f.thread_front_id != thread_front_id);
        self.vars.retain(|_, v| v.thread_front_id != thread_front_id);
    }

    /// Stable breakpoint ids, monotonic, never reused.
    pub fn next_breakpoint_id(&mut self) -> i64 {
        self.next_breakpoint += 1;
        self.next_breakpoint
    }
}
