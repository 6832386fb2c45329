// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {std::path::PathBuf, thiserror::Error};

/// Classification of a single download failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchErrorKind {
    /// Transport-level failure (connect, reset, timeout, truncated body).
    Network,
    /// A non-success HTTP status without more specific handling.
    Status(u16),
    /// HTTP 404 on a required artifact.
    NotFound,
    /// HTTP 401 or 403.
    Unauthorized,
    /// A computed digest differed from the declared digest.
    DigestMismatch,
    /// The received byte count differed from the declared size.
    SizeMismatch,
    /// Local filesystem error while writing the artifact.
    Disk,
    /// The run was interrupted before the artifact completed.
    Cancelled,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network error"),
            Self::Status(code) => write!(f, "HTTP status {}", code),
            Self::NotFound => write!(f, "not found"),
            Self::Unauthorized => write!(f, "access denied"),
            Self::DigestMismatch => write!(f, "checksum mismatch"),
            Self::SizeMismatch => write!(f, "size mismatch"),
            Self::Disk => write!(f, "disk error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("hex parsing error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("integer parsing error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("date parsing error: {0}")]
    DateParse(#[from] mailparse::MailParseError),

    #[error("{}:{}: {}", path.display(), line, message)]
    Config {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("another run is active (lock file {} exists)", .0.display())]
    LockContention(PathBuf),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("digest missing from index entry")]
    ReleaseMissingDigest,

    #[error("size missing from index entry")]
    ReleaseMissingSize,

    #[error("path missing from index entry")]
    ReleaseMissingPath,

    #[error("index entry path unexpectedly has spaces: {0}")]
    ReleasePathWithSpaces(String),

    #[error("expected 1 paragraph in release file; got {0}")]
    ReleaseParagraphMismatch(usize),

    #[error("conflicting sizes declared for {path}: {first} vs {second}")]
    DeclaredSizeConflict {
        path: String,
        first: u64,
        second: u64,
    },

    #[error("required field missing in package stanza: {0}")]
    StanzaRequiredFieldMissing(&'static str),

    #[error("malformed checksum line in source stanza: {0}")]
    SourceChecksumLineMalformed(String),

    #[error("{repo}: {path}: {kind} after {attempts} attempt(s): {detail}")]
    Download {
        repo: String,
        path: String,
        kind: FetchErrorKind,
        attempts: u32,
        detail: String,
    },

    #[error("{repo}: signature verification failed: {reason}")]
    SignatureVerification { repo: String, reason: String },

    #[error("{repo}: {message}")]
    Repository { repo: String, message: String },

    #[error("run interrupted")]
    Interrupted,
}

impl MirrorError {
    /// Whether this error represents a signature verification failure.
    pub fn is_signature_failure(&self) -> bool {
        matches!(self, Self::SignatureVerification { .. })
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, MirrorError>;
