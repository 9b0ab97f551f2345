//! Session lifecycle phases and per-phase command gating.

use std::sync::Mutex;

use crate::bridge::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum Phase {
    Handshaking,
    Configuring,
    Running,
    Stopped,
    Terminating,
    Closed,
}

/// Front-protocol request names the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
pub enum FrontCommand {
    #[strum(serialize = "initialize")]
    Initialize,
    #[strum(serialize = "attach")]
    Attach,
    #[strum(serialize = "launch")]
    Launch,
    #[strum(serialize = "setBreakpoints")]
    SetBreakpoints,
    #[strum(serialize = "setExceptionBreakpoints")]
    SetExceptionBreakpoints,
    #[strum(serialize = "configurationDone")]
    ConfigurationDone,
    #[strum(serialize = "threads")]
    Threads,
    #[strum(serialize = "stackTrace")]
    StackTrace,
    #[strum(serialize = "scopes")]
    Scopes,
    #[strum(serialize = "variables")]
    Variables,
    #[strum(serialize = "setVariable")]
    SetVariable,
    #[strum(serialize = "evaluate")]
    Evaluate,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "next")]
    Next,
    #[strum(serialize = "stepIn")]
    StepIn,
    #[strum(serialize = "stepOut")]
    StepOut,
    #[strum(serialize = "pause")]
    Pause,
    #[strum(serialize = "exceptionInfo")]
    ExceptionInfo,
    #[strum(serialize = "disconnect")]
    Disconnect,
}

impl Phase {
    /// Which requests a phase admits. `disconnect` is always legal; in
    /// Terminating/Closed nothing else is.
    pub fn allows(&self, command: FrontCommand) -> bool {
        use FrontCommand::*;
        if command == Disconnect {
            return true;
        }
        match self {
            Phase::Handshaking => matches!(command, Initialize | Attach | Launch),
            Phase::Configuring => matches!(
                command,
                SetBreakpoints | SetExceptionBreakpoints | ConfigurationDone | Threads
            ),
            Phase::Running | Phase::Stopped => matches!(
                command,
                SetBreakpoints | SetExceptionBreakpoints | Threads | StackTrace | Scopes
                    | Variables | SetVariable | Evaluate | Continue | Next | StepIn | StepOut
                    | Pause | ExceptionInfo
            ),
            Phase::Terminating | Phase::Closed => false,
        }
    }
}

pub struct SessionState {
    phase: Mutex<Phase>,
}

impl SessionState {
    pub fn new() -> SessionState {
        SessionState {
            phase: Mutex::new(Phase::Handshaking),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase lock")
    }

    pub fn set(&self, to: Phase) {
        let mut phase = self.phase.lock().expect("phase lock");
        if *phase != to {
            log::debug!(target: "bridge", "session {} -> {to}", *phase);
            *phase = to;
        }
    }

    /// Move to `to` unless the session is already tearing down.
    pub fn set_if_active(&self, to: Phase) {
        let mut phase = self.phase.lock().expect("phase lock");
        if *phase < Phase::Terminating && *phase != to {
            log::debug!(target: "bridge", "session {} -> {to}", *phase);
            *phase = to;
        }
    }

    pub fn check(&self, command: FrontCommand) -> Result<()> {
        let phase = self.phase();
        if phase.allows(command) {
            Ok(())
        } else {
            Err(Error::InvalidSessionState {
                command: command.to_string(),
                phase,
            })
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_command_names_round_trip() {
        assert_eq!(FrontCommand::from_str("setBreakpoints").unwrap(), FrontCommand::SetBreakpoints);
        assert_eq!(FrontCommand::Continue.to_string(), "continue");
        assert!(FrontCommand::from_str("restartFrame").is_err());
    }

    #[test]
    fn test_handshaking_gate() {
        let state = SessionState::new();
        assert!(state.check(FrontCommand::Initialize).is_ok());
        assert!(state.check(FrontCommand::Disconnect).is_ok());
        let err = state.check(FrontCommand::Threads).unwrap_err();
        assert!(matches!(err, Error::InvalidSessionState { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_configuring_gate() {
        let state = SessionState::new();
        state.set(Phase::Configuring);
        assert!(state.check(FrontCommand::SetBreakpoints).is_ok());
        assert!(state.check(FrontCommand::ConfigurationDone).is_ok());
        assert!(state.check(FrontCommand::Threads).is_ok());
        assert!(state.check(FrontCommand::Continue).is_err());
        assert!(state.check(FrontCommand::Initialize).is_err());
    }

    #[test]
    fn test_run_state_gate() {
        let state = SessionState::new();
        state.set(Phase::Stopped);
        assert!(state.check(FrontCommand::StackTrace).is_ok());
        assert!(state.check(FrontCommand::ConfigurationDone).is_err());
    }

    #[test]
    fn test_terminating_admits_only_disconnect() {
        let state = SessionState::new();
        state.set(Phase::Terminating);
        assert!(state.check(FrontCommand::Disconnect).is_ok());
        assert!(state.check(FrontCommand::Threads).is_err());
        // teardown transitions stick
        state.set_if_active(Phase::Running);
        assert_eq!(state.phase(), Phase::Terminating);
    }
}
