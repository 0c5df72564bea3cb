use crate::backup::archive_validator::Violation;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::sync::mpsc::SendError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    LettreAddress(#[from] lettre::address::AddressError),
    #[error(transparent)]
    LettreMessage(#[from] lettre::error::Error),
    #[error(transparent)]
    LettreSmtp(#[from] lettre::transport::smtp::Error),
    #[error("Cannot reach database: {0}")]
    Connection(String),
    #[error(
        "{} exited with {}:\n  stdout:\n{}\n  stderr:\n{}",
        tool,
        exit_code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
        indent::indent_all_with("    ", stdout),
        indent::indent_all_with("    ", stderr)
    )]
    ToolExecution {
        tool: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error(
        "{} killed after {:?} timeout:\n  stdout:\n{}\n  stderr:\n{}",
        tool,
        timeout,
        indent::indent_all_with("    ", stdout),
        indent::indent_all_with("    ", stderr)
    )]
    ToolTimeout {
        tool: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("Integrity check failed for backup {backup_id}: {reason}")]
    Integrity { backup_id: i64, reason: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Archive rejected: {0}")]
    ArchiveRejected(Violation),
    #[error("Backup {backup_id} not found")]
    NotFound { backup_id: i64 },
    #[error(
        "Restore failed, safety backup {} holds the pre-restore state:\n{}",
        safety_backup_id,
        indent::indent_all_with("  ", error.to_string())
    )]
    RestoreFailed {
        safety_backup_id: i64,
        error: Box<Error>,
    },
    #[error("Smtp send error: {0}")]
    SmtpSendError(String),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + 'static> AddDebugObjectAndFnName<S, O> for Error {
    fn add_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        Self::lots_of_error(errors)
    }
}

impl Error {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(backup_id: i64) -> Self {
        Self::NotFound { backup_id }
    }

    pub fn integrity<S: Into<String>>(backup_id: i64, reason: S) -> Self {
        Self::Integrity {
            backup_id,
            reason: reason.into(),
        }
    }

    pub fn smtp_send_error<S: Into<String>>(msg: S) -> Self {
        Self::SmtpSendError(msg.into())
    }

    pub fn lots_of_error(errors: Vec<Error>) -> Self {
        Self::LotsOfError(errors.into_iter().flat_map(Error::into_iter).collect_vec())
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(Error::into_iter)),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Peels context wrappers (`WithMsg`, `WithFnName`, `WithDebugObjAndFnName`) off the error.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. }
            | Error::WithFnName { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.root(),
            e => e,
        }
    }

    /// Safety backup id carried by a failed restore, wherever it sits in the context chain.
    pub fn safety_backup_id(&self) -> Option<i64> {
        match self.root() {
            Error::RestoreFailed {
                safety_backup_id, ..
            } => Some(*safety_backup_id),
            _ => None,
        }
    }

    /// True when the failure came from the process being interrupted.
    pub fn is_interrupted(&self) -> bool {
        match self.root() {
            Error::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            Error::RestoreFailed { error, .. } => error.is_interrupted(),
            Error::LotsOfError(v) => v.iter().any(Error::is_interrupted),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_add_msg() {
        let error = Error::not_found(7).add_msg("Loading backup");

        match error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Loading backup"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_add_debug_object_and_fn_name() {
        let error = Error::validation("bad preset");
        let error_with_debug = error.add_debug_object_and_fn_name("hourly", "update_schedule");

        match error_with_debug {
            Error::WithDebugObjAndFnName { fn_name, .. } => {
                assert_eq!(fn_name, "update_schedule")
            }
            _ => panic!("Expected WithDebugObjAndFnName error"),
        }
    }

    #[test]
    fn test_root_peels_context() {
        let error = Error::not_found(3)
            .add_msg("outer")
            .add_fn_name("verify_backup")
            .add_debug_object_and_fn_name(3, "cli");

        assert!(matches!(error.root(), Error::NotFound { backup_id: 3 }));
    }

    #[test]
    fn test_safety_backup_id_found_through_context() {
        let error = Error::RestoreFailed {
            safety_backup_id: 42,
            error: Box::new(Error::validation("boom")),
        }
        .add_msg("execute_restore");

        assert_eq!(error.safety_backup_id(), Some(42));
        assert_eq!(Error::validation("x").safety_backup_id(), None);
    }

    #[test]
    fn test_error_from_send_error() {
        let (tx, rx) = mpsc::channel();
        drop(rx);

        let error = Error::from(tx.send("test").unwrap_err());
        assert!(matches!(error, Error::ChannelSendError(_)));
    }

    #[test]
    fn test_error_from_vec_flattens() {
        let nested = Error::lots_of_error(vec![Error::validation("a"), Error::validation("b")]);
        let combined = Error::from(vec![nested, Error::validation("c")]);

        match combined {
            Error::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_error_chain() {
        let chained = Error::validation("one").chain(Error::validation("two"));
        assert_eq!(chained.into_iter().count(), 2);
    }

    #[test]
    fn test_tool_execution_display_contains_output() {
        let error = Error::ToolExecution {
            tool: "pg_dump".into(),
            exit_code: Some(1),
            stdout: "partial".into(),
            stderr: "permission denied for table users".into(),
        };
        let error_str = error.to_string();

        assert!(error_str.contains("pg_dump exited with code 1"));
        assert!(error_str.contains("partial"));
        assert!(error_str.contains("permission denied for table users"));
    }

    #[test]
    fn test_is_interrupted() {
        let error = Error::from(std::io::Error::from(std::io::ErrorKind::Interrupted))
            .add_msg("reading dump");
        assert!(error.is_interrupted());
        assert!(!Error::validation("x").is_interrupted());
    }
}
