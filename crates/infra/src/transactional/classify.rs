//! Retryable vs non-retryable classification.

use super::error::OperationError;

/// Message fragments that mark an error as permanent.
pub const DEFAULT_NON_RETRYABLE_PATTERNS: &[&str] = &[
    "duplicate",
    "already exists",
    "validation failed",
    "unauthorized",
    "forbidden",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Decides whether a failed attempt is worth repeating.
///
/// Typed variants are checked first; anything else falls back to a
/// case-insensitive match of the message against the configured patterns.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_NON_RETRYABLE_PATTERNS.iter().copied())
    }
}

impl ErrorClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, err: &OperationError) -> ErrorClass {
        match err {
            OperationError::Validation(_)
            | OperationError::Unauthenticated(_)
            | OperationError::Forbidden(_) => ErrorClass::NonRetryable,
            OperationError::Domain(e) if e.is_permanent() => ErrorClass::NonRetryable,
            OperationError::BatchStep { source, .. } => self.classify(source),
            other => self.classify_message(&other.to_string()),
        }
    }

    pub fn is_retryable(&self, err: &OperationError) -> bool {
        self.classify(err) == ErrorClass::Retryable
    }

    fn classify_message(&self, message: &str) -> ErrorClass {
        let message = message.to_lowercase();
        if self.patterns.iter().any(|p| message.contains(p.as_str())) {
            ErrorClass::NonRetryable
        } else {
            ErrorClass::Retryable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use wms_core::DomainError;

    #[test]
    fn typed_permanent_errors() {
        let c = ErrorClassifier::default();
        assert_eq!(c.classify(&OperationError::validation("qty < 0")), ErrorClass::NonRetryable);
        assert_eq!(c.classify(&OperationError::unauthenticated("no token")), ErrorClass::NonRetryable);
        assert_eq!(c.classify(&OperationError::forbidden("role")), ErrorClass::NonRetryable);
        assert_eq!(
            c.classify(&DomainError::Unauthorized.into()),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn message_patterns_are_case_insensitive() {
        let c = ErrorClassifier::default();
        assert_eq!(
            c.classify(&OperationError::other("Shipment ALREADY EXISTS for order 42")),
            ErrorClass::NonRetryable
        );
        // "duplicate key: ..." from a unique constraint
        assert_eq!(
            c.classify(&StorageError::UniqueViolation("sku".into()).into()),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn transient_failures_are_retryable() {
        let c = ErrorClassifier::default();
        assert!(c.is_retryable(&StorageError::Conflict("40001".into()).into()));
        assert!(c.is_retryable(&OperationError::Timeout(std::time::Duration::from_secs(1))));
        assert!(c.is_retryable(&OperationError::other("connection reset by peer")));
        assert!(c.is_retryable(&DomainError::conflict("stale bin version").into()));
    }

    #[test]
    fn batch_steps_are_classified_by_their_cause() {
        let c = ErrorClassifier::default();
        let err = OperationError::BatchStep {
            name: "pick".into(),
            source: Box::new(OperationError::validation("empty pick list")),
        };
        assert_eq!(c.classify(&err), ErrorClass::NonRetryable);
    }

    #[test]
    fn custom_patterns() {
        let c = ErrorClassifier::new(["Out Of Stock"]);
        assert!(!c.is_retryable(&OperationError::other("sku A: out of stock")));
        assert!(c.is_retryable(&OperationError::other("duplicate delivery")));
    }
}
