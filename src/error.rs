//! Typed failures that callers need to tell apart.
//!
//! Everything travels inside `anyhow::Error`; the session and server
//! downcast to these types to classify an abort.

use std::path::PathBuf;
use thiserror::Error;

/// The peer sent something the protocol does not allow. Fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid symlink target for {path:?}: {reason}")]
    InvalidSymlinkTarget { path: String, reason: &'static str },

    #[error("unsupported file type {mode:#o} for {path:?}")]
    UnsupportedFileType { path: String, mode: u32 },

    #[error("invalid session parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("unexpected token {found} while {context}")]
    UnexpectedToken { found: u8, context: &'static str },

    #[error("data block of {len} bytes exceeds limit of {max}")]
    OversizedBlock { len: i64, max: usize },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: i64 },

    #[error("record stream out of order at {path:?}: {reason}")]
    OutOfOrder { path: String, reason: &'static str },

    #[error("unexpected end of input while {0}")]
    UnexpectedEof(&'static str),
}

/// On-disk state contradicts an invariant the engine relies on.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("rename target already exists: {from:?} -> {to:?}")]
    TargetExists { from: PathBuf, to: PathBuf },

    #[error("link-to directory {0:?} is one of the working directories")]
    LinkToIsWorking(PathBuf),
}

/// True when the error chain contains a protocol violation.
pub fn is_protocol_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<ProtocolError>())
}

/// True when the error chain contains a consistency violation.
pub fn is_consistency_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<ConsistencyError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classification_through_context() {
        let err: anyhow::Result<()> = Err(ProtocolError::UnexpectedEof("reading token").into());
        let err = err.context("receiving /a").unwrap_err();
        assert!(is_protocol_error(&err));
        assert!(!is_consistency_error(&err));

        let err = anyhow::Error::from(ConsistencyError::LinkToIsWorking(PathBuf::from("/x")));
        assert!(is_consistency_error(&err));
    }
}
