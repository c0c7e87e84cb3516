/// Idle-timeout monitor for a supervised child.
///
/// A single background task sleeps until the current deadline. Every
/// [`Watchdog::arm`] replaces the deadline and bumps a generation counter;
/// the task only fires if the generation it slept on is still current when
/// it wakes, so an expiry that loses the race with a re-arm is ignored.
///
/// The expiry callback runs with the state lock held. Once [`Watchdog::cancel`]
/// returns, the callback cannot run again.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    generation: u64,
    deadline: Option<Instant>,
    cancelled: bool,
    fired: u32,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` once cancelled.
    fn snapshot(&self) -> Option<(u64, Option<Instant>)> {
        let state = self.lock();
        if state.cancelled {
            None
        } else {
            Some((state.generation, state.deadline))
        }
    }

    fn expire<F: FnMut()>(&self, generation: u64, on_expire: &mut F) {
        let mut state = self.lock();
        if state.cancelled || state.generation != generation {
            tracing::debug!(
                generation,
                current = state.generation,
                "ignoring stale watchdog expiry"
            );
            return;
        }
        state.deadline = None;
        state.fired += 1;
        on_expire();
    }
}

pub struct Watchdog {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Start the watchdog task, initially disarmed.
    ///
    /// `on_expire` must not call back into the watchdog.
    pub fn spawn<F>(on_expire: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
        });
        let task = tokio::spawn(run(Arc::clone(&shared), on_expire));
        Self { shared, task }
    }

    /// Set the deadline to `now + timeout`, replacing any pending one.
    ///
    /// No-op after [`cancel`](Self::cancel).
    pub fn arm(&self, timeout: Duration) {
        {
            let mut state = self.shared.lock();
            if state.cancelled {
                return;
            }
            state.generation += 1;
            state.deadline = Some(Instant::now() + timeout);
        }
        self.shared.wake.notify_one();
    }

    /// Permanently disarm.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.generation += 1;
            state.deadline = None;
        }
        self.shared.wake.notify_one();
    }

    pub fn has_fired(&self) -> bool {
        self.fire_count() > 0
    }

    pub fn fire_count(&self) -> u32 {
        self.shared.lock().fired
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.lock().deadline
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
        self.task.abort();
    }
}

async fn run<F: FnMut()>(shared: Arc<Shared>, mut on_expire: F) {
    while let Some((generation, deadline)) = shared.snapshot() {
        match deadline {
            None => shared.wake.notified().await,
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        shared.expire(generation, &mut on_expire);
                    }
                    () = shared.wake.notified() => {}
                }
            }
        }
    }
    tracing::debug!("watchdog stopped");
}
