//! Result type alias for Redmatch operations

use crate::error::RedmatchError;

/// Standard Result type for Redmatch operations
pub type Result<T> = std::result::Result<T, RedmatchError>;

/// Extension trait for Result to provide additional convenience methods
pub trait ResultExt<T> {
    /// Log the error and continue with None
    fn log_and_continue(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn log_and_continue(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                if err.is_recoverable() {
                    tracing::warn!("Continuing after error: {}", err);
                } else {
                    tracing::error!("Fatal error: {}", err);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;

    #[test]
    fn test_log_and_continue_drops_errors() {
        let recoverable: Result<u32> = Err(ImportError::EmptyMetadata.into());
        assert_eq!(recoverable.log_and_continue(), None);
        let fatal: Result<u32> = Err(RedmatchError::internal_error("boom"));
        assert_eq!(fatal.log_and_continue(), None);
    }

    #[test]
    fn test_log_and_continue_keeps_values() {
        let result: Result<u32> = Ok(7);
        assert_eq!(result.log_and_continue(), Some(7));
    }
}
