use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::core::errors::SessionError;
use crate::domain::types::SessionPhase;
use crate::session::store::{Action, SessionStore};

const TICK: Duration = Duration::from_secs(1);

pub type ExpiryHook = Box<dyn FnOnce() + Send + 'static>;

/// Once-per-second countdown over the attempt's remaining time.
///
/// The task stops on its own when the attempt leaves `active`; reaching zero
/// runs the expiry hook exactly once and then stops as well.
pub struct CountdownTimer {
    store: SessionStore,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CountdownTimer {
    pub fn new(store: SessionStore) -> Self {
        Self { store, task: Mutex::new(None) }
    }

    /// Returns `Ok(false)` when a countdown is already running.
    pub fn start(&self, on_expire: ExpiryHook) -> Result<bool, SessionError> {
        let (phase, initialized) = self.store.read(|state| {
            (state.phase, state.attempt.as_ref().is_some_and(|attempt| attempt.timer_initialized))
        });
        if !initialized {
            return Err(SessionError::invalid_state("remaining time has not been loaded yet"));
        }
        if phase != SessionPhase::Active {
            return Err(SessionError::invalid_state("countdown only runs while the attempt is active"));
        }

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("Countdown already running");
            return Ok(false);
        }
        *slot = Some(tokio::spawn(run_countdown(self.store.clone(), on_expire)));
        Ok(true)
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_countdown(store: SessionStore, on_expire: ExpiryHook) {
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    loop {
        ticker.tick().await;
        let state = store.dispatch(Action::Tick);
        match state.phase {
            SessionPhase::Active => continue,
            SessionPhase::TimeExpired => {
                tracing::info!(attempt_id = state.attempt_id().unwrap_or_default(), "Time expired");
                on_expire();
                return;
            }
            other => {
                tracing::debug!(phase = ?other, "Countdown stopped");
                return;
            }
        }
    }
}
