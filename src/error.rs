use scata_protocol::ReadErrorKind;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Stable identifiers for errors that abort a dataset, a task or a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadInput,
    IdMismatch,
    LengthMismatch,
    BadQualfile,
    MissingQual,
    UnpairedReads,
    NoAmplicon,
    InvalidInput,
    NotFound,
    AlreadyExists,
    Io,
    Aligner,
    TaskFailed,
    InvalidTransition,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadInput => "bad_input",
            ErrorCode::IdMismatch => "id_mismatch",
            ErrorCode::LengthMismatch => "length_mismatch",
            ErrorCode::BadQualfile => "bad_qualfile",
            ErrorCode::MissingQual => "missing_qual",
            ErrorCode::UnpairedReads => "unpaired_reads",
            ErrorCode::NoAmplicon => "no_amplicon",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::Io => "io",
            ErrorCode::Aligner => "aligner",
            ErrorCode::TaskFailed => "task_failed",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Fatal error: stops processing of the whole dataset, task or job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScataError {
    pub code: ErrorCode,
    pub message: String,
}

impl ScataError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, format!("{context}: {err}"))
    }
}

impl fmt::Display for ScataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl Error for ScataError {}

impl From<std::io::Error> for ScataError {
    fn from(err: std::io::Error) -> Self {
        ScataError::new(ErrorCode::Io, err.to_string())
    }
}

impl From<serde_json::Error> for ScataError {
    fn from(err: serde_json::Error) -> Self {
        ScataError::new(ErrorCode::InvalidInput, err.to_string())
    }
}

/// Recoverable per-read error. Counted by kind, never aborts a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub message: String,
}

impl ReadError {
    pub fn new(kind: ReadErrorKind) -> Self {
        Self {
            kind,
            message: kind.default_message().to_string(),
        }
    }

    pub fn with_message(kind: ReadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for ReadError {}

/// Item error of every read iterator.
#[derive(Debug, Clone)]
pub enum ReadFailure {
    Skip(ReadError),
    Fatal(ScataError),
}

impl ReadFailure {
    pub fn skip(kind: ReadErrorKind) -> Self {
        ReadFailure::Skip(ReadError::new(kind))
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        ReadFailure::Fatal(ScataError::new(code, message))
    }
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFailure::Skip(e) => write!(f, "{e}"),
            ReadFailure::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl Error for ReadFailure {}

impl From<ReadError> for ReadFailure {
    fn from(err: ReadError) -> Self {
        ReadFailure::Skip(err)
    }
}

impl From<ScataError> for ReadFailure {
    fn from(err: ScataError) -> Self {
        ReadFailure::Fatal(err)
    }
}

pub type Result<T> = std::result::Result<T, ScataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_stable_code() {
        let err = ScataError::new(ErrorCode::LengthMismatch, "read r1: 10 bases, 9 scores");
        assert_eq!(err.to_string(), "length_mismatch: read r1: 10 bases, 9 scores");
        assert_eq!(
            serde_json::to_string(&ErrorCode::BadQualfile).unwrap(),
            "\"bad_qualfile\""
        );
    }

    #[test]
    fn read_error_defaults_to_kind_message() {
        let err = ReadError::new(ReadErrorKind::ChimericTag);
        assert_eq!(err.message, "Chimeric tags");
        let failure: ReadFailure = err.into();
        assert!(matches!(failure, ReadFailure::Skip(_)));
    }
}
