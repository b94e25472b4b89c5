#![allow(dead_code)]

use lambda_coverage_layer::runtime::context::InvocationContext;

/// Invocation context with a fixed identity and remaining budget.
#[derive(Clone, Debug)]
pub struct FakeContext {
    pub request_id: Option<String>,
    pub function_name: Option<String>,
    pub remaining_ms: Option<u64>,
}

impl FakeContext {
    pub fn new(function_name: &str, request_id: &str, remaining_ms: u64) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            function_name: Some(function_name.to_string()),
            remaining_ms: Some(remaining_ms),
        }
    }
}

impl InvocationContext for FakeContext {
    fn request_id(&self) -> Option<String> {
        self.request_id.clone()
    }

    fn function_name(&self) -> Option<String> {
        self.function_name.clone()
    }

    fn remaining_time_ms(&self) -> Option<u64> {
        self.remaining_ms
    }
}
