//! Close-once guard for connectors, with a process-exit safety net.
//!
//! Every [`LifecycleGuard`] registers an exit hook when it is created. The
//! hook table is drained by [`run_exit_hooks`], which is installed with
//! `atexit(3)` the first time a guard is created, so connectors that are
//! still open when the process exits get closed (flushing disk-resident
//! stores) before it terminates.
//!
//! ```text
//!   LifecycleGuard::new ──► EXIT_HOOKS[id] = state
//!          │
//!          ├── close() ──► remove EXIT_HOOKS[id], run close action once
//!          ├── drop    ──► close()
//!          └── exit    ──► run_exit_hooks(): drain table, force_close() each
//! ```
//!
//! Hooks hold the guard state only while the guard is open; closing removes
//! the entry so the table never grows with closed connectors.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use anyhow::Result;
use lazy_static::lazy_static;

use crate::error;

type CloseAction = Box<dyn Fn() -> Result<()> + Send + Sync>;

lazy_static! {
    static ref EXIT_HOOKS: Mutex<HashMap<u64, Arc<GuardState>>> = Mutex::new(HashMap::new());
}

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);
static INSTALL_EXIT_HANDLER: Once = Once::new();

struct GuardState {
    id: u64,
    label: String,
    closed: AtomicBool,
    on_close: CloseAction,
}

impl GuardState {
    /// Mark closed and run the close action, at most once over the guard's life.
    fn close_once(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        (self.on_close)()?;
        Ok(true)
    }
}

/// Guarantees a connector closes at most once and never leaks past process exit.
pub struct LifecycleGuard {
    state: Arc<GuardState>,
}

impl LifecycleGuard {
    /// Create an open guard and register its exit hook.
    ///
    /// `on_close` releases the guarded resources; it runs at most once, from
    /// [`close`](Self::close), from `Drop`, or from the exit hook.
    pub fn new<F>(label: impl Into<String>, on_close: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        install_exit_handler();

        let state = Arc::new(GuardState {
            id: NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            closed: AtomicBool::new(false),
            on_close: Box::new(on_close),
        });
        hooks().insert(state.id, Arc::clone(&state));

        Self { state }
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Whether an exit hook is still registered for this guard.
    #[cfg(test)]
    fn is_registered(&self) -> bool {
        hooks().contains_key(&self.state.id)
    }

    /// Fail with a closed error once the guard has closed.
    pub fn ensure_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(error::closed(&self.state.label));
        }
        Ok(())
    }

    /// Close the guarded resource. A second call is a no-op.
    ///
    /// The exit hook is deregistered before the close action runs, so an
    /// exit racing with this call cannot close twice.
    pub fn close(&self) -> Result<()> {
        hooks().remove(&self.state.id);
        if self.state.close_once()? {
            tracing::debug!(label = %self.state.label, "[LifecycleGuard] Closed");
        }
        Ok(())
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(
                label = %self.state.label,
                error = %e,
                "[LifecycleGuard] Close on drop failed"
            );
        }
    }
}

impl std::fmt::Debug for LifecycleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleGuard")
            .field("label", &self.state.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Force-close every guard that is still open. Returns how many were closed.
///
/// This is what runs at process exit. It never panics and never returns an
/// error: failures are logged, since nothing can recover from them at exit.
pub fn run_exit_hooks() -> usize {
    let pending: Vec<Arc<GuardState>> = {
        let mut table = hooks();
        table.drain().map(|(_, state)| state).collect()
    };

    let mut closed = 0;
    for state in pending {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.close_once()));
        match outcome {
            Ok(Ok(true)) => {
                closed += 1;
                tracing::warn!(label = %state.label, "[LifecycleGuard] Force-closed at exit");
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    label = %state.label,
                    error = %e,
                    "[LifecycleGuard] Force close at exit failed"
                );
            }
            Err(_) => {
                tracing::error!(label = %state.label, "[LifecycleGuard] Close action panicked at exit");
            }
        }
    }
    closed
}

/// Number of exit hooks currently registered.
pub fn pending_exit_hooks() -> usize {
    hooks().len()
}

fn hooks() -> std::sync::MutexGuard<'static, HashMap<u64, Arc<GuardState>>> {
    EXIT_HOOKS.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn exit_handler() {
    // Unwinding out of an extern "C" fn aborts the process.
    let _ = panic::catch_unwind(run_exit_hooks);
}

fn install_exit_handler() {
    INSTALL_EXIT_HANDLER.call_once(|| {
        // SAFETY: exit_handler is a plain extern "C" fn with no arguments that
        // cannot unwind; registering it has no other preconditions.
        let rc = unsafe { libc::atexit(exit_handler) };
        if rc != 0 {
            tracing::error!(rc, "[LifecycleGuard] Failed to register atexit handler");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_guard(label: &str) -> (LifecycleGuard, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let guard = LifecycleGuard::new(label, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (guard, count)
    }

    #[test]
    fn test_close_is_idempotent() {
        let (guard, count) = counting_guard("idempotent");
        assert!(!guard.is_closed());
        assert!(guard.is_registered());

        guard.close().unwrap();
        guard.close().unwrap();

        assert!(guard.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_deregisters_hook() {
        let (guard, _count) = counting_guard("deregister");
        assert!(guard.is_registered());
        guard.close().unwrap();
        assert!(!guard.is_registered());
    }

    #[test]
    fn test_drop_closes() {
        let (guard, count) = counting_guard("drop");
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ensure_not_closed() {
        let (guard, _count) = counting_guard("ensure");
        guard.ensure_not_closed().unwrap();
        guard.close().unwrap();

        let err = guard.ensure_not_closed().unwrap_err();
        assert!(crate::error::StorageError::is_closed(&err));
        assert!(err.to_string().contains("ensure"));
    }

    #[test]
    fn test_failed_close_still_marks_closed() {
        let guard = LifecycleGuard::new("failing", || Err(anyhow::anyhow!("flush failed")));
        assert!(guard.close().is_err());
        assert!(guard.is_closed());
        // The resource is considered released; no retry on the second call.
        guard.close().unwrap();
    }
}
