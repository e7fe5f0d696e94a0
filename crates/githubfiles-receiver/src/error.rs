//! Error types for the receiver.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`RemoteStore`](crate::store::RemoteStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested file does not exist
    #[error("file not found: {0}")]
    NotFound(String),

    /// Write rejected because the file changed (or appeared) since it was read
    #[error("write conflict on {path}: {reason}")]
    Conflict { path: String, reason: String },

    /// HTTP request failed (connect, TLS, timeout)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a status we do not handle
    #[error("remote store returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Response body could not be decoded
    #[error("failed to decode remote content: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether this error is an optimistic-concurrency rejection.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Template rendering failure.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Handlebars failed to parse or render the template
    #[error("failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Errors while parsing or regenerating an incident document.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Content does not start with a header marker line
    #[error("document does not start with a header block")]
    MissingHeader,

    /// Header block has no closing marker line
    #[error("header block is not terminated")]
    UnterminatedHeader,

    /// Header block is not a YAML mapping
    #[error("invalid header: {0}")]
    HeaderYaml(#[from] serde_yaml::Error),

    /// A known header field holds something other than a string
    #[error("header field `{field}` is not a string")]
    FieldType { field: &'static str },

    /// `startsAt` could not be parsed with the document time format
    #[error("header field `{field}` has invalid timestamp `{value}`: {source}")]
    Timestamp {
        field: &'static str,
        value: String,
        source: chrono::ParseError,
    },

    /// Header or entry template failed
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Errors from a single reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Filename or content template failed; nothing was fetched or written
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Filename template rendered to an empty path
    #[error("filename template rendered an empty path")]
    EmptyPath,

    /// Remote store failure (including conflicts)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Existing document could not be merged
    #[error("incident merge failed: {0}")]
    Merge(#[from] MergeError),

    /// Existing remote content is not UTF-8 text
    #[error("remote content at {path} is not valid UTF-8")]
    NonUtf8 { path: String },

    /// A remote call or the whole firing exceeded its time budget
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl ReconcileError {
    /// Whether this failure was a lost write race rather than an outage.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
