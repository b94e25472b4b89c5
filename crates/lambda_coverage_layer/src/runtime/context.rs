use std::time::{Duration, Instant, SystemTime};

/// What the coverage runtime needs from the platform's invocation context.
pub trait InvocationContext {
    fn request_id(&self) -> Option<String>;
    fn function_name(&self) -> Option<String>;
    /// Remaining execution budget, or `None` when the platform cannot say.
    fn remaining_time_ms(&self) -> Option<u64>;
}

impl InvocationContext for lambda_runtime::Context {
    fn request_id(&self) -> Option<String> {
        Some(self.request_id.clone()).filter(|id| !id.is_empty())
    }

    fn function_name(&self) -> Option<String> {
        Some(self.env_config.function_name.clone()).filter(|name| !name.is_empty())
    }

    fn remaining_time_ms(&self) -> Option<u64> {
        if self.deadline == 0 {
            return None;
        }
        let remaining = self
            .deadline()
            .duration_since(SystemTime::now())
            .map(|left| left.as_millis() as u64)
            .unwrap_or(0);
        Some(remaining)
    }
}

/// Owned copy of an invocation context, taken when coverage starts so the
/// budget can still be read after the handler consumed its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    request_id: Option<String>,
    function_name: Option<String>,
    deadline: Option<Instant>,
}

impl ContextSnapshot {
    pub fn capture(context: &dyn InvocationContext) -> Self {
        Self {
            request_id: context.request_id(),
            function_name: context.function_name(),
            deadline: context
                .remaining_time_ms()
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        }
    }
}

impl InvocationContext for ContextSnapshot {
    fn request_id(&self) -> Option<String> {
        self.request_id.clone()
    }

    fn function_name(&self) -> Option<String> {
        self.function_name.clone()
    }

    fn remaining_time_ms(&self) -> Option<u64> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}
