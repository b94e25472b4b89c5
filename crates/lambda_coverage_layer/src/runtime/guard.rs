use std::time::{Duration, Instant};

use lambda_coverage_core::error::{CoverageError, CoverageResult};

use crate::runtime::context::InvocationContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub kind: &'static str,
    pub message: String,
    pub operation: String,
    pub duration_ms: u128,
}

/// Runs one step of the coverage lifecycle and decides whether its
/// failure reaches the caller.
///
/// Critical operations, and errors that are critical on their own
/// (configuration, fallback root), propagate after being recorded. Every
/// other failure is recorded, logged at warn, and turned into `Ok(None)`.
#[derive(Debug)]
pub struct GuardedOperation {
    name: String,
    critical: bool,
    failure: Option<FailureDetails>,
}

impl GuardedOperation {
    pub fn new(name: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            critical,
            failure: None,
        }
    }

    pub fn run<T>(
        &mut self,
        operation: impl FnOnce() -> CoverageResult<T>,
    ) -> CoverageResult<Option<T>> {
        let started_at = Instant::now();
        tracing::debug!(operation = %self.name, "operation started");

        match operation() {
            Ok(value) => {
                tracing::debug!(
                    operation = %self.name,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "operation completed"
                );
                Ok(Some(value))
            }
            Err(error) => {
                let details = FailureDetails {
                    kind: error.kind(),
                    message: error.to_string(),
                    operation: self.name.clone(),
                    duration_ms: started_at.elapsed().as_millis(),
                };
                let propagate = self.critical || error.is_critical();
                if propagate {
                    tracing::error!(
                        operation = %details.operation,
                        error_type = details.kind,
                        error = %details.message,
                        duration_ms = details.duration_ms as u64,
                        "critical coverage operation failed"
                    );
                } else {
                    tracing::warn!(
                        operation = %details.operation,
                        error_type = details.kind,
                        error = %details.message,
                        duration_ms = details.duration_ms as u64,
                        "coverage operation failed; continuing"
                    );
                }
                self.failure = Some(details);

                if propagate {
                    Err(error)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn error_occurred(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&FailureDetails> {
        self.failure.as_ref()
    }
}

/// Advisory deadline for a multi-step operation.
///
/// It never interrupts a blocked call: callers check it between steps, and
/// [`DeadlineGuard::run`] reports an overrun only once the operation
/// returns successfully.
#[derive(Debug, Clone)]
pub struct DeadlineGuard {
    operation: String,
    timeout: Duration,
    started_at: Instant,
}

impl DeadlineGuard {
    pub fn new(operation: impl Into<String>, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            timeout,
            started_at: Instant::now(),
        }
    }

    pub fn from_seconds(operation: impl Into<String>, seconds: f64) -> Self {
        Self::new(operation, Duration::from_secs_f64(seconds.max(0.0)))
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started_at.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.started_at.elapsed() >= self.timeout
    }

    pub fn check(&self) -> CoverageResult<()> {
        if self.expired() {
            tracing::warn!(
                operation = %self.operation,
                timeout_seconds = self.timeout.as_secs_f64(),
                "operation exceeded its deadline"
            );
            return Err(self.timeout_error());
        }
        Ok(())
    }

    /// Errors raised by `operation` are returned unchanged; a timeout is
    /// only reported for an operation that otherwise succeeded.
    pub fn run<T>(
        &self,
        operation: impl FnOnce(&DeadlineGuard) -> CoverageResult<T>,
    ) -> CoverageResult<T> {
        let value = operation(self)?;
        self.check()?;
        Ok(value)
    }

    fn timeout_error(&self) -> CoverageError {
        CoverageError::Timeout {
            operation: self.operation.clone(),
            timeout_seconds: self.timeout.as_secs_f64(),
        }
    }
}

/// Remaining invocation budget in seconds; 0 when the platform cannot
/// report it.
pub fn remaining_time(context: &dyn InvocationContext) -> f64 {
    context
        .remaining_time_ms()
        .map(|ms| ms as f64 / 1_000.0)
        .unwrap_or(0.0)
}

pub fn has_sufficient_time(context: &dyn InvocationContext, min_buffer_seconds: f64) -> bool {
    remaining_time(context) > min_buffer_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Budget(Option<u64>);

    impl InvocationContext for Budget {
        fn request_id(&self) -> Option<String> {
            None
        }

        fn function_name(&self) -> Option<String> {
            None
        }

        fn remaining_time_ms(&self) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn non_critical_failure_is_recorded_and_suppressed() {
        let mut guard = GuardedOperation::new("coverage_start", false);
        let outcome: Option<()> = guard
            .run(|| Err(CoverageError::Session("engine refused".into())))
            .unwrap();

        assert_eq!(outcome, None);
        assert!(guard.error_occurred());
        let failure = guard.failure().unwrap();
        assert_eq!(failure.kind, "session_error");
        assert_eq!(failure.operation, "coverage_start");
    }

    #[test]
    fn critical_operation_propagates() {
        let mut guard = GuardedOperation::new("fallback_root", true);
        let error = guard
            .run::<()>(|| Err(CoverageError::Session("boom".into())))
            .expect_err("critical guard propagates");
        assert!(matches!(error, CoverageError::Session(_)));
        assert!(guard.error_occurred());
    }

    #[test]
    fn critical_errors_escape_non_critical_guards() {
        let mut guard = GuardedOperation::new("coverage_start", false);
        let error = guard
            .run::<()>(|| Err(CoverageError::Configuration("bucket missing".into())))
            .expect_err("configuration errors always propagate");
        assert!(error.is_critical());
    }

    #[test]
    fn success_passes_value_through() {
        let mut guard = GuardedOperation::new("finalize", false);
        assert_eq!(guard.run(|| Ok(7)).unwrap(), Some(7));
        assert!(!guard.error_occurred());
    }

    #[test]
    fn deadline_reports_timeout_only_after_successful_overrun() {
        let expired = DeadlineGuard::new("upload", Duration::ZERO);
        let error = expired.run(|_| Ok(())).expect_err("deadline already passed");
        assert!(matches!(error, CoverageError::Timeout { .. }));

        let error = expired
            .run::<()>(|_| Err(CoverageError::Upload {
                message: "denied".into(),
                attempts: 1,
            }))
            .expect_err("operation error wins");
        assert!(matches!(error, CoverageError::Upload { .. }));

        let generous = DeadlineGuard::from_seconds("upload", 30.0);
        assert_eq!(generous.run(|_| Ok(3)).unwrap(), 3);
        assert!(generous.remaining() > Duration::from_secs(29));
    }

    #[test]
    fn budget_helpers_treat_unknown_as_zero() {
        assert_eq!(remaining_time(&Budget(None)), 0.0);
        assert_eq!(remaining_time(&Budget(Some(2_500))), 2.5);
        assert!(has_sufficient_time(&Budget(Some(3_001)), 3.0));
        assert!(!has_sufficient_time(&Budget(Some(3_000)), 3.0));
        assert!(!has_sufficient_time(&Budget(None), 0.0));
    }
}
