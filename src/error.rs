//! Failure classes surfaced to the operator.
//!
//! Library functions return `anyhow::Result`; failures that the caller has to
//! tell apart are raised as a [`BootstrapError`] and can be recovered with
//! `err.downcast_ref::<BootstrapError>()`.

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Missing or inconsistent operator input. Raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cluster is in the wrong state for the requested mode.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// One or more trustee identifiers had no public key.
    #[error("no public key found for trustee(s): {}", .missing.join(", "))]
    Resolution { missing: Vec<String> },

    /// Keys were found but declare no mail address, so their shares could
    /// never be delivered.
    #[error("public key declares no mail address for trustee(s): {}", .trustees.join(", "))]
    NoAddress { trustees: Vec<String> },

    /// An external service could not be reached or answered with an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An external service answered with something that breaks the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A rekey submission was made against a session other than the active one.
    #[error("rekey nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: String, actual: String },
}

impl BootstrapError {
    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        Self::Config(msg.into()).into()
    }

    pub fn precondition(msg: impl Into<String>) -> anyhow::Error {
        Self::Precondition(msg.into()).into()
    }

    pub fn transport(msg: impl Into<String>) -> anyhow::Error {
        Self::Transport(msg.into()).into()
    }

    pub fn protocol(msg: impl Into<String>) -> anyhow::Error {
        Self::Protocol(msg.into()).into()
    }
}

/// Returns the classified error, if any, at the root of an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&BootstrapError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BootstrapError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(BootstrapError::transport("connection refused"));
        let err = err.context("checking cluster state").unwrap_err();
        assert!(matches!(classify(&err), Some(BootstrapError::Transport(_))));
        assert!(format!("{:#}", err).contains("connection refused"));
    }

    #[test]
    fn resolution_lists_every_missing_trustee() {
        let err = BootstrapError::Resolution {
            missing: vec!["alice".to_string(), "carol".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no public key found for trustee(s): alice, carol"
        );
    }
}
