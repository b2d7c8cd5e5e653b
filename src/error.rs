//! Error types for the Tether webhook

use thiserror::Error;

/// Main error type for webhook operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The before/after diff could not be turned into an admission patch
    #[error("patch error: {0}")]
    Patch(String),
}

impl Error {
    /// Create an invalid-review error with the given message
    pub fn invalid_review(msg: impl Into<String>) -> Self {
        Self::InvalidReview(msg.into())
    }

    /// Create a patch error with the given message
    pub fn patch(msg: impl Into<String>) -> Self {
        Self::Patch(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: every failure in the mutation pipeline degrades, never denies
    ///
    /// Both error categories here are "optional enrichment" failures: the
    /// admission response still allows the pod, carrying the message in its
    /// status instead of rejecting the object.
    #[test]
    fn story_errors_carry_context_for_the_response_status() {
        let err = Error::patch("pod and clone are not diff-comparable");
        assert!(err.to_string().contains("patch error"));
        assert!(err.to_string().contains("not diff-comparable"));

        let err = Error::from(serde_json::from_str::<()>("not json").unwrap_err());
        assert!(err.to_string().contains("serialization error"));
    }

    #[test]
    fn patch_constructor_accepts_str_and_string() {
        let from_str = Error::patch("static");
        assert!(matches!(from_str, Error::Patch(ref m) if m == "static"));

        let node = "node-7";
        let from_string = Error::patch(format!("bad value for {node}"));
        assert!(from_string.to_string().contains("node-7"));
    }
}
