use std::sync::{Mutex, OnceLock};

/// Global lock for tests that mutate process-wide state (runtime paths,
/// environment variables). All such tests should hold this lock to avoid
/// races between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
