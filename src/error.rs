//! Error classes shared by the engine, the registry and the run store.
//!
//! The variants map onto how a failure is handled:
//! - configuration and step resolution errors are fatal before any chain starts
//! - execution errors abort the current chain only (teardown still runs)
//! - [`Error::NotFound`] is kept apart from storage failures so `prune` can
//!   report "nothing to prune" instead of an I/O error

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("step '{name}' not found in search path")]
    ModuleNotFound { name: String },

    #[error("step '{name}' is invalid: {reason}")]
    InvalidModule { name: String, reason: String },

    #[error("step '{step}' failed: {reason}")]
    ModuleExecution { step: String, reason: String },

    #[error("step '{step}': command `{command}` failed with {status}")]
    CommandFailed {
        step: String,
        command: String,
        status: ExitStatus,
    },

    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },

    #[error("{}", not_found_message(.chain, .kver.as_deref()))]
    NotFound { chain: String, kver: Option<String> },

    #[error("run store failure at '{}'", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt run record '{}'", .path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("filesystem operation on '{}' failed", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn execution(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ModuleExecution {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_module(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidModule {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the run store has no record for the requested chain/kver.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for failures that abort only the chain that raised them.
    pub fn is_chain_local(&self) -> bool {
        matches!(
            self,
            Error::ModuleExecution { .. }
                | Error::CommandFailed { .. }
                | Error::InvalidArtifact { .. }
                | Error::Io { .. }
        )
    }
}

fn not_found_message(chain: &str, kver: Option<&str>) -> String {
    match kver {
        Some(kver) => format!("no stored run of chain '{chain}' for kernel version {kver}"),
        None => format!("chain '{chain}' has no stored runs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable_from_storage_errors() {
        let missing = Error::NotFound {
            chain: "A".into(),
            kver: Some("6.6.1".into()),
        };
        let storage = Error::Storage {
            path: PathBuf::from("/var/lib/bootchain/runs/A.json"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };

        assert!(missing.is_not_found());
        assert!(!storage.is_not_found());
        assert_eq!(
            missing.to_string(),
            "no stored run of chain 'A' for kernel version 6.6.1"
        );
    }

    #[test]
    fn chain_missing_message_omits_kver() {
        let err = Error::NotFound {
            chain: "uki".into(),
            kver: None,
        };
        assert_eq!(err.to_string(), "chain 'uki' has no stored runs");
    }

    #[test]
    fn execution_errors_are_chain_local() {
        assert!(Error::execution("layout/plain", "boom").is_chain_local());
        assert!(!Error::config("bad").is_chain_local());
        assert!(!Error::ModuleNotFound { name: "x".into() }.is_chain_local());
    }
}
