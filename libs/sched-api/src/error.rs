//! Error types for request parsing.

use thiserror::Error;

/// Errors produced while parsing scheduler inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A range fragment could not be parsed.
    #[error("invalid range fragment '{fragment}'")]
    InvalidRange { fragment: String },

    /// The range expands to more values than allowed.
    #[error("range '{fragment}' expands past {limit} values")]
    RangeTooLarge { fragment: String, limit: usize },

    /// The schedtag config string is empty.
    #[error("schedtag config cannot be empty")]
    EmptySchedtag,

    /// The schedtag config is not `<id>:<strategy>`.
    #[error("invalid schedtag config '{0}': expected '<id>:<strategy>'")]
    InvalidSchedtag(String),

    /// The schedtag strategy is not one of the allowed values.
    #[error("unknown schedtag strategy '{strategy}', allowed: require, exclude, prefer, avoid")]
    UnknownStrategy { strategy: String },
}

impl ParseError {
    /// Returns true if this error came from range parsing.
    pub fn is_range_error(&self) -> bool {
        matches!(
            self,
            ParseError::InvalidRange { .. } | ParseError::RangeTooLarge { .. }
        )
    }
}
