//! Failure taxonomy of identity resolution

use super::inspect::ProcessInfo;
use super::options::Strategy;
use thiserror::Error;

/// Why a target PID could not be resolved.
///
/// Every variant has a stable snake_case [`code`](ResolveError::code) for
/// logs and machine consumers.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("Invalid file options: expected {{ file: {{ path }} }}")]
    InvalidFileOptions,

    #[error("No PID found in file {path}")]
    NoPidFound { path: String },

    #[error("Invalid PID in file {path}: {raw:?}")]
    InvalidPidInFile { path: String, raw: String },

    #[error("Failed to read PID file {path}: {message}")]
    FileReadError { path: String, message: String },

    #[error("PID {pid} is not alive")]
    PidNotAlive { pid: u32 },

    #[error("Could not probe liveness of PID {pid}: {message}")]
    LivenessProbeFailed { pid: u32, message: String },

    #[error("Could not fetch process info for PID {pid}")]
    ProcessInfoNotFound { pid: u32 },

    #[error("Process name {actual:?} does not match the expected name {expected:?}")]
    ConstraintNameMismatch { expected: Vec<String>, actual: String },

    #[error("Process args {actual:?} do not match the expected pattern {pattern:?}")]
    ConstraintCmdMismatch { pattern: String, actual: String },

    #[error("Process user {actual:?} does not match the expected user {expected:?}")]
    ConstraintUserMismatch { expected: String, actual: String },

    #[error("Strict verification failed on second check for PID {pid}: {reason}")]
    StrictVerificationFailed { pid: u32, reason: Box<ResolveError> },

    #[error("Process identity (user/comm/args) of PID {pid} changed between checks")]
    StrictIdentityChanged {
        pid: u32,
        before: Option<ProcessInfo>,
        after: Option<ProcessInfo>,
    },

    #[error("Strategy {strategy:?} not implemented")]
    NotImplemented { strategy: Strategy },

    #[error("Command not found: {command}")]
    ToolUnavailable { command: String },

    #[error("Command {command} timed out after {timeout_ms} ms")]
    CmdTimeout { command: String, timeout_ms: u64 },

    #[error("Command {command} exited with code {code:?}: {stderr}")]
    CmdExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command {command} failed: {message}")]
    CmdFailed { command: String, message: String },

    #[error("Invalid command options: expected {{ command: {{ pattern }} }}")]
    InvalidCommandOptions,

    #[error("No process matched the command pattern {pattern:?}")]
    NoMatch { pattern: String },

    #[error("{count} processes matched the pattern: {pids:?}")]
    MultipleMatches { count: usize, pids: Vec<u32> },
}

impl ResolveError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::InvalidFileOptions => "invalid_file_options",
            ResolveError::NoPidFound { .. } => "no_pid_found",
            ResolveError::InvalidPidInFile { .. } => "invalid_pid_in_file",
            ResolveError::FileReadError { .. } => "file_read_error",
            ResolveError::PidNotAlive { .. } => "pid_not_alive",
            ResolveError::LivenessProbeFailed { .. } => "liveness_probe_failed",
            ResolveError::ProcessInfoNotFound { .. } => "process_info_not_found",
            ResolveError::ConstraintNameMismatch { .. } => "constraint_name_mismatch",
            ResolveError::ConstraintCmdMismatch { .. } => "constraint_cmd_mismatch",
            ResolveError::ConstraintUserMismatch { .. } => "constraint_user_mismatch",
            ResolveError::StrictVerificationFailed { .. } => "strict_verification_failed",
            ResolveError::StrictIdentityChanged { .. } => "strict_identity_changed",
            ResolveError::NotImplemented { .. } => "not_implemented",
            ResolveError::ToolUnavailable { .. } => "tool_unavailable",
            ResolveError::CmdTimeout { .. } => "cmd_timeout",
            ResolveError::CmdExit { .. } => "cmd_exit",
            ResolveError::CmdFailed { .. } => "cmd_failed",
            ResolveError::InvalidCommandOptions => "invalid_command_options",
            ResolveError::NoMatch { .. } => "no_match",
            ResolveError::MultipleMatches { .. } => "multiple_matches",
        }
    }

    /// The failure that caused a strict re-check to fail, if any
    pub fn strict_reason(&self) -> Option<&ResolveError> {
        match self {
            ResolveError::StrictVerificationFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_snake_case() {
        let errors = vec![
            ResolveError::InvalidFileOptions,
            ResolveError::PidNotAlive { pid: 1 },
            ResolveError::CmdTimeout {
                command: "ps".to_string(),
                timeout_ms: 10,
            },
            ResolveError::NotImplemented {
                strategy: Strategy::Port,
            },
        ];
        for err in errors {
            let code = err.code();
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{code}");
        }
    }

    #[test]
    fn test_strict_reason() {
        let err = ResolveError::StrictVerificationFailed {
            pid: 9,
            reason: Box::new(ResolveError::PidNotAlive { pid: 9 }),
        };
        assert_eq!(err.code(), "strict_verification_failed");
        assert_eq!(err.strict_reason().map(|r| r.code()), Some("pid_not_alive"));
        assert!(err.to_string().contains("PID 9 is not alive"));
    }
}
