//! Ties session, upload, and fallback together around one invocation.
//!
//! [`CoverageScope`] is the one place the finalize sequence lives. The
//! decorator surfaces ([`CoverageRuntime::instrument`],
//! [`CoverageRuntime::invoke`], [`CoverageRuntime::run_instrumented_sync`])
//! only open a scope, run the handler, and hand the outcome back untouched.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use lambda_coverage_core::error::{CoverageError, CoverageResult};
use lambda_coverage_core::settings::{resolve as resolve_settings, Settings};
use lambda_coverage_core::storage_keys::{generate_key, PlatformIdentity, UNKNOWN_COMPONENT};
use lambda_runtime::LambdaEvent;

use crate::adapters::object_store::ObjectStore;
use crate::runtime::context::{ContextSnapshot, InvocationContext};
use crate::runtime::fallback::{FallbackMetadata, FallbackStore};
use crate::runtime::guard::{has_sufficient_time, remaining_time, GuardedOperation};
use crate::runtime::session::{SessionHandle, SessionManager, SessionRegistry};
use crate::runtime::upload::{Sleeper, ThreadSleeper, UploadResult, Uploader};

/// Budget that must remain before the report is finalized at all.
pub const FINALIZE_BUFFER_SECONDS: f64 = 3.0;
/// Budget that must remain before upload or fallback is attempted.
pub const UPLOAD_BUFFER_SECONDS: f64 = 2.0;

pub type HandlerFuture<R> = Pin<Box<dyn Future<Output = Result<R, lambda_runtime::Error>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    NotStarted,
    SkippedLowBudget,
    FinalizeFailed,
    Uploaded(UploadResult),
    StoredLocally(PathBuf),
    Lost,
}

#[derive(Clone)]
pub struct CoverageRuntime {
    uploader: Uploader,
    sessions: Arc<SessionManager>,
    fallback: FallbackStore,
    settings: Option<Arc<Settings>>,
}

impl CoverageRuntime {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        sessions: Arc<SessionManager>,
        fallback: FallbackStore,
    ) -> Self {
        Self {
            uploader: Uploader::new(store, Arc::new(ThreadSleeper)),
            sessions,
            fallback,
            settings: None,
        }
    }

    /// Process-wide session manager and environment-configured fallback
    /// root.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(
            store,
            SessionRegistry::global().current(),
            FallbackStore::from_env(),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.uploader = Uploader::new(Arc::clone(self.uploader.store()), sleeper);
        self
    }

    /// Uses fixed settings instead of resolving them from the environment.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn fallback(&self) -> &FallbackStore {
        &self.fallback
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn settings(&self) -> CoverageResult<Arc<Settings>> {
        match &self.settings {
            Some(settings) => Ok(Arc::clone(settings)),
            None => resolve_settings(),
        }
    }

    /// Opens a coverage scope for the current invocation.
    ///
    /// Configuration errors propagate. Any other failure to start tracking
    /// yields a scope that does nothing on exit.
    pub fn scope(&self, context: &dyn InvocationContext) -> CoverageResult<CoverageScope> {
        let context = ContextSnapshot::capture(context);
        let function_name = context
            .function_name()
            .unwrap_or_else(|| PlatformIdentity::from_env().function_name_or_unknown());
        tracing::info!(
            request_id = %context.request_id().unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
            function_name = %function_name,
            remaining_seconds = remaining_time(&context),
            "coverage invocation started"
        );

        let settings = self.settings()?;
        let mut guard = GuardedOperation::new("coverage_start", false);
        let handle = guard.run(|| self.sessions.start(&settings))?;

        Ok(CoverageScope {
            runtime: self.clone(),
            context,
            settings,
            function_name,
            handle,
            finished: false,
        })
    }

    /// Runs a synchronous handler with coverage around it. The handler's
    /// own result is returned unchanged; only critical coverage errors are
    /// converted into `E`.
    pub fn run_instrumented_sync<T, E, F>(
        &self,
        context: &dyn InvocationContext,
        handler: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CoverageError> + Display,
    {
        let scope = self.scope(context)?;
        let result = handler();
        if let Err(error) = &result {
            tracing::error!(error = %error, "instrumented handler failed");
        }
        scope.finish(result.is_err());
        result
    }

    pub async fn invoke<P, R, F, Fut>(
        &self,
        event: LambdaEvent<P>,
        handler: F,
    ) -> Result<R, lambda_runtime::Error>
    where
        F: FnOnce(LambdaEvent<P>) -> Fut,
        Fut: Future<Output = Result<R, lambda_runtime::Error>>,
    {
        let scope = self
            .scope(&event.context)
            .map_err(lambda_runtime::Error::from)?;
        let result = handler(event).await;
        if let Err(error) = &result {
            tracing::error!(error = %error, "instrumented handler failed");
        }
        scope.finish(result.is_err());
        result
    }

    /// Wraps an async Lambda handler for `lambda_runtime::service_fn`.
    pub fn instrument<P, R, F, Fut>(
        &self,
        handler: F,
    ) -> impl Fn(LambdaEvent<P>) -> HandlerFuture<R> + Clone + Send + Sync + 'static
    where
        P: Send + 'static,
        R: Send + 'static,
        F: Fn(LambdaEvent<P>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<R, lambda_runtime::Error>> + Send + 'static,
    {
        let runtime = self.clone();
        move |event: LambdaEvent<P>| {
            let runtime = runtime.clone();
            let handler = handler.clone();
            Box::pin(async move { runtime.invoke(event, handler).await }) as HandlerFuture<R>
        }
    }
}

/// Coverage bracket around a region of an invocation.
///
/// Call [`CoverageScope::finish`] when the region ends. A scope dropped
/// without `finish` (early return, unwinding panic) runs the same sequence
/// from `Drop`.
pub struct CoverageScope {
    runtime: CoverageRuntime,
    context: ContextSnapshot,
    settings: Arc<Settings>,
    function_name: String,
    handle: Option<SessionHandle>,
    finished: bool,
}

impl CoverageScope {
    pub fn is_tracking(&self) -> bool {
        self.handle.is_some()
    }

    pub fn finish(mut self, had_error: bool) -> FinalizeOutcome {
        self.complete(had_error)
    }

    fn complete(&mut self, had_error: bool) -> FinalizeOutcome {
        self.finished = true;
        let Some(handle) = self.handle.take() else {
            return FinalizeOutcome::NotStarted;
        };

        if !has_sufficient_time(&self.context, FINALIZE_BUFFER_SECONDS) {
            tracing::warn!(
                remaining_seconds = remaining_time(&self.context),
                min_buffer_seconds = FINALIZE_BUFFER_SECONDS,
                "insufficient time remaining; skipping coverage finalization"
            );
            self.runtime.sessions.reset();
            return FinalizeOutcome::SkippedLowBudget;
        }

        let sessions = &self.runtime.sessions;
        let mut guard = GuardedOperation::new("coverage_finalize", false);
        let report_path = match guard.run(|| sessions.finalize(&handle, &self.function_name)) {
            Ok(Some(path)) => path,
            Ok(None) => return FinalizeOutcome::FinalizeFailed,
            Err(error) => {
                tracing::error!(error = %error, "coverage finalization failed");
                return FinalizeOutcome::FinalizeFailed;
            }
        };

        let outcome = self.deliver(&report_path, had_error);
        remove_report(&report_path);
        outcome
    }

    fn deliver(&self, report_path: &Path, had_error: bool) -> FinalizeOutcome {
        let request_id = self.context.request_id();
        let metadata = BTreeMap::from([
            ("function-name".to_string(), self.function_name.clone()),
            (
                "request-id".to_string(),
                request_id
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
            ),
            ("handler-error".to_string(), had_error.to_string()),
            ("coverage-type".to_string(), "invocation".to_string()),
        ]);

        let mut reason = "insufficient_time_for_upload";
        if has_sufficient_time(&self.context, UPLOAD_BUFFER_SECONDS) {
            match self.upload(report_path, request_id.as_deref(), metadata.clone()) {
                Ok(Some(result)) => return FinalizeOutcome::Uploaded(result),
                Ok(None) => reason = "upload_failed",
                Err(error) => {
                    tracing::warn!(error = %error, "coverage upload could not run");
                    reason = "upload_failed";
                }
            }
        } else {
            tracing::warn!(
                remaining_seconds = remaining_time(&self.context),
                "insufficient time remaining; skipping coverage upload"
            );
        }

        if !has_sufficient_time(&self.context, UPLOAD_BUFFER_SECONDS) {
            tracing::warn!("insufficient time remaining; coverage report discarded");
            return FinalizeOutcome::Lost;
        }

        let fallback_metadata = FallbackMetadata::new(reason, metadata);
        let mut guard = GuardedOperation::new("fallback_store", false);
        match guard.run(|| {
            self.runtime
                .fallback
                .store(report_path, &self.function_name, Some(&fallback_metadata))
        }) {
            Ok(Some(path)) => {
                tracing::warn!(
                    path = %path.display(),
                    reason,
                    "coverage report kept in fallback storage"
                );
                FinalizeOutcome::StoredLocally(path)
            }
            Ok(None) => FinalizeOutcome::Lost,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    "fallback storage unavailable; coverage report lost"
                );
                FinalizeOutcome::Lost
            }
        }
    }

    fn upload(
        &self,
        report_path: &Path,
        execution_id: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> CoverageResult<Option<UploadResult>> {
        let key = generate_key(
            Some(&self.function_name),
            execution_id,
            &self.settings.prefix,
            None,
        )?;
        let budget = remaining_time(&self.context) - UPLOAD_BUFFER_SECONDS;
        let deadline = self.settings.upload_timeout().as_secs_f64().min(budget);

        self.runtime.uploader.upload(
            report_path,
            Some(&key),
            Some(&self.settings),
            metadata,
            Some(deadline),
        )
    }
}

impl Drop for CoverageScope {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(std::thread::panicking());
        }
    }
}

fn remove_report(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "temporary coverage report removed"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(
            path = %path.display(),
            error = %error,
            "failed to remove temporary coverage report"
        ),
    }
}
