use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use lambda_coverage_core::error::{CoverageError, CoverageResult};
use lambda_coverage_core::settings::Settings;
use lambda_coverage_core::storage_keys::report_file_name;
use lambda_coverage_core::tracker::{LineTracker, TrackingEngine};

use crate::runtime::short_id;

pub type EngineFactory =
    Arc<dyn Fn(&Settings) -> CoverageResult<Box<dyn TrackingEngine>> + Send + Sync>;

pub fn line_tracker_factory() -> EngineFactory {
    Arc::new(|settings: &Settings| {
        let tracker = LineTracker::from_settings(settings)?;
        Ok(Box::new(tracker) as Box<dyn TrackingEngine>)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Stopped,
}

/// Explicit handle to the session started for the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: u64,
    pub worker_id: u32,
}

struct Session {
    id: u64,
    engine: Box<dyn TrackingEngine>,
    state: SessionState,
}

/// Owns the single tracking session of one worker process.
///
/// Not meant for concurrent invocations: the platform hands a worker one
/// invocation at a time, and the mutex only protects the slot itself.
pub struct SessionManager {
    worker_id: u32,
    report_dir: PathBuf,
    factory: EngineFactory,
    slot: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(worker_id: u32, report_dir: impl Into<PathBuf>, factory: EngineFactory) -> Self {
        Self {
            worker_id,
            report_dir: report_dir.into(),
            factory,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    fn slot(&self) -> MutexGuard<'_, Option<Session>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.slot()
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(SessionState::Uninitialized)
    }

    /// Starts tracking, or returns the already active session.
    pub fn start(&self, settings: &Settings) -> CoverageResult<SessionHandle> {
        let mut slot = self.slot();
        if let Some(session) = slot.as_ref() {
            if session.state == SessionState::Active {
                tracing::debug!(session_id = session.id, "coverage session already active");
                return Ok(self.handle_for(session.id));
            }
        }

        let mut engine = (self.factory)(settings)?;
        engine.start()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Session {
            id,
            engine,
            state: SessionState::Active,
        });
        tracing::info!(
            session_id = id,
            worker_id = self.worker_id,
            track_branches = settings.track_branches,
            "coverage session started"
        );
        Ok(self.handle_for(id))
    }

    /// Stops tracking and writes the report to a fresh file under the
    /// report directory. The manager is Uninitialized afterwards whether or
    /// not serialization succeeded.
    pub fn finalize(&self, handle: &SessionHandle, function_name: &str) -> CoverageResult<PathBuf> {
        let taken = self.slot().take();
        let mut session = match taken {
            Some(session) if session.id == handle.session_id => session,
            Some(other) => {
                let message = format!(
                    "session {} is not the active session {}",
                    handle.session_id, other.id
                );
                *self.slot() = Some(other);
                return Err(CoverageError::Session(message));
            }
            None => {
                return Err(CoverageError::Session(
                    "no active coverage session to finalize".to_string(),
                ));
            }
        };

        if session.state != SessionState::Active {
            return Err(CoverageError::Session(format!(
                "session {} is not active",
                session.id
            )));
        }

        session.engine.stop()?;
        session.state = SessionState::Stopped;

        let report = session.engine.report()?;
        fs::create_dir_all(&self.report_dir)
            .map_err(|error| CoverageError::io(&self.report_dir, error))?;
        let path = self
            .report_dir
            .join(report_file_name(function_name, &short_id()));
        let written = report.write_to(&path)?;

        let size = fs::metadata(&path)
            .map_err(|error| CoverageError::io(&path, error))?
            .len();
        if size == 0 || written == 0 {
            let _ = fs::remove_file(&path);
            return Err(CoverageError::Session(format!(
                "coverage report at {} is empty",
                path.display()
            )));
        }

        tracing::info!(
            session_id = session.id,
            path = %path.display(),
            file_size_bytes = size,
            covered_lines = report.totals.covered_lines,
            num_statements = report.totals.num_statements,
            "coverage session finalized"
        );
        Ok(path)
    }

    /// Forces the Uninitialized state, stopping a running engine and
    /// ignoring any error from doing so.
    pub fn reset(&self) {
        let taken = self.slot().take();
        if let Some(mut session) = taken {
            if session.engine.is_running() {
                if let Err(error) = session.engine.stop() {
                    tracing::debug!(
                        session_id = session.id,
                        error = %error,
                        "ignored stop failure during reset"
                    );
                }
            }
            tracing::debug!(session_id = session.id, "coverage session reset");
        }
    }

    fn handle_for(&self, session_id: u64) -> SessionHandle {
        SessionHandle {
            session_id,
            worker_id: self.worker_id,
        }
    }
}

/// Process-lifetime registry of session managers keyed by worker process.
pub struct SessionRegistry {
    report_dir: PathBuf,
    factory: EngineFactory,
    managers: Mutex<HashMap<u32, Arc<SessionManager>>>,
}

impl SessionRegistry {
    pub fn new(report_dir: impl Into<PathBuf>, factory: EngineFactory) -> Self {
        Self {
            report_dir: report_dir.into(),
            factory,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static SessionRegistry {
        static REGISTRY: OnceLock<SessionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| SessionRegistry::new(std::env::temp_dir(), line_tracker_factory()))
    }

    pub fn manager_for(&self, worker_id: u32) -> Arc<SessionManager> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let manager = managers.entry(worker_id).or_insert_with(|| {
            Arc::new(SessionManager::new(
                worker_id,
                self.report_dir.clone(),
                Arc::clone(&self.factory),
            ))
        });
        Arc::clone(manager)
    }

    pub fn current(&self) -> Arc<SessionManager> {
        self.manager_for(std::process::id())
    }
}
