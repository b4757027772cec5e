//! Error taxonomy for provisioning runs.
//!
//! Most code propagates `anyhow::Result` with context attached; the variants
//! here mark the conditions callers need to tell apart (exit messages, tests).

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Missing or invalid operator input, detected before any side effect.
    #[error("configuration error: {0}")]
    Config(String),

    /// The hypervisor control surface reported a failure.
    #[error("backend command `{command}` failed: {message}")]
    Backend { command: String, message: String },

    /// Installer image construction failed.
    #[error("installer image build failed: {0}")]
    Build(String),

    /// Listener could not be bound or the accept itself failed.
    #[error("rendezvous error: {0}")]
    Rendezvous(String),

    /// The guest never called back within the configured window.
    #[error("install timed out after {}s without the guest calling back", .waited.as_secs())]
    InstallTimedOut { waited: Duration },

    /// The guest connected but closed the socket before sending its status byte.
    #[error("guest disconnected before reporting install status")]
    GuestDisconnected,

    /// Operator interrupt while waiting on the guest.
    #[error("interrupted while waiting for the guest")]
    Interrupted,

    /// The identity pool file could not be turned into a pool.
    #[error("malformed identity pool: {0}")]
    MalformedPool(String),
}

impl ProvisionError {
    pub fn config(msg: impl Into<String>) -> Self {
        ProvisionError::Config(msg.into())
    }

    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        ProvisionError::Backend {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_names_command() {
        let err = ProvisionError::backend("VBoxManage unregistervm ghost --delete", "not found");
        let msg = err.to_string();
        assert!(msg.contains("unregistervm ghost"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_timeout_message_in_seconds() {
        let err = ProvisionError::InstallTimedOut {
            waited: Duration::from_secs(1800),
        };
        assert!(err.to_string().contains("1800s"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ProvisionError::GuestDisconnected.into();
        let err = err.context("awaiting install");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::GuestDisconnected)
        ));
    }
}
