//! Write-conflict retry loop
//!
//! Write conflicts are an expected outcome, not a failure: the storage
//! layer raises them whenever an update's precondition no longer holds
//! (duplicate key on upsert, predicate mismatch on replace). The fix is
//! always the same: re-run the whole logical operation against fresh
//! state. This helper is that loop.

use quill_core::Result;
use tracing::debug;

/// Retry `f` until it returns anything other than a write conflict
///
/// All other errors, and success, propagate immediately. Each conflict is
/// logged with the attempt count so pathological contention is visible.
pub fn write_conflict_retry<T>(
    op_name: &str,
    ns: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempts: u64 = 0;
    loop {
        match f() {
            Err(e) if e.is_write_conflict() => {
                attempts += 1;
                debug!(
                    operation = op_name,
                    namespace = ns,
                    attempts,
                    "caught write conflict, retrying"
                );
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::Error;

    #[test]
    fn test_success_passes_through() {
        let result = write_conflict_retry("test", "app.items", || Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_retries_until_conflict_clears() {
        let mut remaining_conflicts = 3;
        let result = write_conflict_retry("test", "app.items", || {
            if remaining_conflicts > 0 {
                remaining_conflicts -= 1;
                Err(Error::write_conflict("not yet"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(remaining_conflicts, 0);
    }

    #[test]
    fn test_other_errors_propagate() {
        let mut calls = 0;
        let result: Result<()> = write_conflict_retry("test", "app.items", || {
            calls += 1;
            Err(Error::Storage("disk on fire".into()))
        });
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(calls, 1);
    }
}
