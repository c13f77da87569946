use crate::core::{SERIALIZATION_FAILURE, SqlState};

/// Whether a failed attempt may be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Serialization conflict: the transaction can be restarted from the retry boundary.
    Retryable,
    /// Anything else. The transaction is rolled back and the error surfaces.
    Fatal,
}

/// Maps an error to a [`Classification`]. Must be pure.
///
/// Any `Fn(&E) -> Classification` closure is a classifier, which lets a
/// [`RetryPolicy`](super::RetryPolicy) carry a custom rule.
pub trait Classifier<E: ?Sized>: Send + Sync {
    fn classify(&self, err: &E) -> Classification;
}

impl<E: ?Sized, F> Classifier<E> for F
where
    F: Fn(&E) -> Classification + Send + Sync,
{
    fn classify(&self, err: &E) -> Classification {
        self(err)
    }
}

/// Default classifier: retryable iff the error carries SQLSTATE `40001`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlStateClassifier;

impl<E: SqlState + ?Sized> Classifier<E> for SqlStateClassifier {
    fn classify(&self, err: &E) -> Classification {
        classify(err)
    }
}

/// Classify by SQLSTATE alone.
pub fn classify<E: SqlState + ?Sized>(err: &E) -> Classification {
    match err.sqlstate() {
        Some(SERIALIZATION_FAILURE) => Classification::Retryable,
        _ => Classification::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;

    #[test]
    fn test_serialization_failure_is_retryable() {
        let err = DbError::SerializationFailure("http".into());
        assert_eq!(SqlStateClassifier.classify(&err), Classification::Retryable);
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let fatal = [
            DbError::NotNullViolation("remote".into()),
            DbError::ParseError("syntax error at or near \"INSRT\"".into()),
            DbError::ConnectionClosed,
            DbError::InFailedTransaction,
            DbError::ExecutionError("restart transaction: retry serialization".into()),
        ];
        for err in &fatal {
            assert_eq!(classify(err), Classification::Fatal, "{err}");
        }
    }

    #[test]
    fn test_closure_classifier() {
        let everything_retries = |_: &DbError| Classification::Retryable;
        assert_eq!(
            everything_retries.classify(&DbError::PoolTimeout),
            Classification::Retryable
        );
    }
}
