use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PargzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid gzip data: {0}")]
    Format(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("unexpected end of stream: {0}")]
    TruncatedStream(String),

    #[error("block {seq} failed: {msg}")]
    Worker { seq: u64, msg: String },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid compression level: {0}")]
    InvalidLevel(u32),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl PargzError {
    pub fn format<T: fmt::Display>(msg: T) -> Self {
        PargzError::Format(msg.to_string())
    }

    pub fn integrity<T: fmt::Display>(msg: T) -> Self {
        PargzError::Integrity(msg.to_string())
    }

    pub fn truncated<T: fmt::Display>(msg: T) -> Self {
        PargzError::TruncatedStream(msg.to_string())
    }

    pub fn worker<T: fmt::Display>(seq: u64, msg: T) -> Self {
        PargzError::Worker {
            seq,
            msg: msg.to_string(),
        }
    }

    pub fn resource<T: fmt::Display>(msg: T) -> Self {
        PargzError::Resource(msg.to_string())
    }

    pub fn invalid_argument<T: fmt::Display>(msg: T) -> Self {
        PargzError::InvalidArgument(msg.to_string())
    }

    /// True for errors where retrying the same input deterministically fails
    /// (data corruption as opposed to transient I/O trouble).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            PargzError::Format(_)
                | PargzError::Integrity(_)
                | PargzError::TruncatedStream(_)
                | PargzError::Worker { .. }
        )
    }
}

pub type PargzResult<T> = Result<T, PargzError>;
