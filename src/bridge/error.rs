use crate::bridge::state::Phase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- codec errors ----------------------------------------------
    #[error("malformed front-protocol frame: {0}")]
    MalformedFrame(String),
    #[error("invalid front-protocol payload: {0}")]
    InvalidPayload(String),
    #[error("malformed engine record: {0}")]
    MalformedRecord(String),

    // --------------------------------- session errors --------------------------------------------
    #[error("command `{command}` is not allowed in the {phase} phase")]
    InvalidSessionState { command: String, phase: Phase },
    #[error("unknown {0} id {1}")]
    UnknownId(&'static str, i64),
    #[error("no pending request for sequence number {0}")]
    UnexpectedResponse(i64),
    #[error("engine request {0} timed out")]
    Timeout(i64),
    #[error("request cancelled: {0}")]
    Cancelled(String),
    #[error("engine error: {0}")]
    Engine(String),

    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Return a hint to the session loop - recover and answer the single offending
    /// request, or tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidSessionState { .. } => false,
            Error::UnknownId(_, _) => false,
            Error::UnexpectedResponse(_) => false,
            Error::Timeout(_) => false,
            Error::Cancelled(_) => false,
            Error::Engine(_) => false,

            // currently fatal errors
            Error::MalformedFrame(_) => true,
            Error::InvalidPayload(_) => true,
            Error::MalformedRecord(_) => true,
            Error::Io(_) => true,
            Error::ChannelClosed => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
