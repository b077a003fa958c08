//! Wait group for ordering callback-driven steps
//!
//! Each step enters before it starts and leaves when it finishes, possibly
//! on another thread. `wait` blocks until every entered step has left;
//! `notify_on_drain` schedules work for that moment instead of blocking.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;

type DrainCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CounterState {
    outstanding: usize,
    pending: Vec<(Handle, DrainCallback)>,
}

#[derive(Clone, Default)]
pub struct SyncCounter {
    state: Arc<Mutex<CounterState>>,
    drained: Arc<Condvar>,
}

impl SyncCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.state.lock().outstanding += 1;
    }

    /// Balance a previous `enter`.
    ///
    /// # Panics
    ///
    /// In debug builds, when called without a matching `enter`.
    pub fn leave(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            debug_assert!(state.outstanding > 0, "SyncCounter::leave without enter");
            if state.outstanding == 0 {
                tracing::error!("SyncCounter::leave without matching enter");
                return;
            }
            state.outstanding -= 1;
            if state.outstanding > 0 {
                return;
            }
            std::mem::take(&mut state.pending)
        };

        self.drained.notify_all();
        for (handle, callback) in callbacks {
            handle.spawn(async move { callback() });
        }
    }

    /// Block the calling thread until the count returns to zero.
    ///
    /// Never call this from an async task; use `spawn_blocking`.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// Run `callback` on `handle` once the count drains, or right away if it already has
    pub fn notify_on_drain(&self, handle: &Handle, callback: impl FnOnce() + Send + 'static) {
        let callback: DrainCallback = Box::new(callback);
        let immediate = {
            let mut state = self.state.lock();
            if state.outstanding == 0 {
                Some(callback)
            } else {
                state.pending.push((handle.clone(), callback));
                None
            }
        };

        if let Some(callback) = immediate {
            handle.spawn(async move { callback() });
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

impl std::fmt::Debug for SyncCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCounter")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_wait_returns_when_drained() {
        let counter = SyncCounter::new();
        counter.wait();

        counter.enter();
        counter.enter();
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let counter = counter.clone();
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
                counter.leave();
                counter.leave();
            })
        };

        counter.wait();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(counter.outstanding(), 0);
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_notify_on_drain() {
        let handle = Handle::current();
        let counter = SyncCounter::new();
        counter.enter();

        let (tx, rx) = tokio::sync::oneshot::channel();
        counter.notify_on_drain(&handle, move || {
            let _ = tx.send(());
        });
        assert_eq!(counter.outstanding(), 1);

        counter.leave();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_when_already_drained() {
        let counter = SyncCounter::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        counter.notify_on_drain(&Handle::current(), move || {
            let _ = tx.send(7);
        });

        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "leave without enter")]
    #[cfg(debug_assertions)]
    fn test_unbalanced_leave_panics() {
        SyncCounter::new().leave();
    }
}
