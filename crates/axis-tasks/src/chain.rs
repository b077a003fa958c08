//! Sequential task chain
//!
//! ```text
//! run() -> unit[0] --succeeded--> unit[1] --succeeded--> ... --> Ok(())
//!              \--failed(e)----------\--failed(e)-----------> Err(e)
//! cancel(e) ---------------------------------------------------> Err(e)
//! ```
//!
//! At most one unit executes at a time. The terminal result is delivered to
//! the completion handler exactly once, and replayed to a handler that is
//! registered after the chain has already finished.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::UnitAbandoned;
use crate::guarded::Guarded;

pub type ChainResult<E> = std::result::Result<(), E>;

type CompletionHandler<E> = Box<dyn FnOnce(ChainResult<E>) + Send>;
type UnitWork<E> = Box<dyn FnOnce(TaskCompletion<E>) + Send>;
type SignalFn<E> = Box<dyn FnOnce(Signal<E>) + Send>;

enum Signal<E> {
    Succeeded,
    Failed(E),
    Abandoned(String),
}

/// A named unit of deferred work
pub struct TaskUnit<E> {
    name: String,
    work: UnitWork<E>,
}

impl<E: Send + 'static> TaskUnit<E> {
    /// The work must eventually consume its `TaskCompletion`, from any thread.
    pub fn new(
        name: impl Into<String>,
        work: impl FnOnce(TaskCompletion<E>) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            work: Box::new(work),
        }
    }

    /// A unit that spawns `future` on `handle` when executed.
    ///
    /// The future is not polled until the chain reaches this unit.
    pub fn from_future<F>(name: impl Into<String>, handle: &Handle, future: F) -> Self
    where
        F: Future<Output = ChainResult<E>> + Send + 'static,
    {
        let handle = handle.clone();
        Self::new(name, move |completion| {
            handle.spawn(async move {
                match future.await {
                    Ok(()) => completion.succeeded(),
                    Err(e) => completion.failed(e),
                }
            });
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Single-shot completion signal handed to a running unit.
///
/// Consuming `succeeded`/`failed` releases the chain reference; dropping the
/// completion unsignalled fails the chain with `UnitAbandoned`.
pub struct TaskCompletion<E> {
    unit: String,
    callback: Option<SignalFn<E>>,
}

impl<E> TaskCompletion<E> {
    pub fn unit_name(&self) -> &str {
        &self.unit
    }

    pub fn succeeded(mut self) {
        self.signal(Signal::Succeeded);
    }

    pub fn failed(mut self, reason: E) {
        self.signal(Signal::Failed(reason));
    }

    fn signal(&mut self, signal: Signal<E>) {
        if let Some(callback) = self.callback.take() {
            callback(signal);
        }
    }
}

impl<E> Drop for TaskCompletion<E> {
    fn drop(&mut self) {
        if self.callback.is_some() {
            tracing::warn!(unit = %self.unit, "Task unit dropped its completion");
            let unit = self.unit.clone();
            self.signal(Signal::Abandoned(unit));
        }
    }
}

struct ChainState<E> {
    name: String,
    units: VecDeque<TaskUnit<E>>,
    started: bool,
    running: bool,
    cancelled: bool,
    result: Option<ChainResult<E>>,
    handler: Option<CompletionHandler<E>>,
}

enum Step<E> {
    Idle,
    Execute(TaskUnit<E>),
    Finish,
}

pub struct TaskChain<E> {
    state: Arc<Guarded<ChainState<E>>>,
}

impl<E> Clone for TaskChain<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E> TaskChain<E>
where
    E: From<UnitAbandoned> + Clone + Display + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Guarded::new(ChainState {
                name: name.into(),
                units: VecDeque::new(),
                started: false,
                running: false,
                cancelled: false,
                result: None,
                handler: None,
            })),
        }
    }

    /// Append a unit. Ignored once the chain has been run.
    pub fn add(&self, unit: TaskUnit<E>) -> &Self {
        let rejected = self.state.update(|s| {
            if s.started {
                Some((s.name.clone(), unit.name))
            } else {
                s.units.push_back(unit);
                None
            }
        });

        if let Some((chain, unit)) = rejected {
            tracing::warn!(chain = %chain, unit = %unit, "Ignoring unit added after run");
        }
        self
    }

    pub fn add_all(&self, units: impl IntoIterator<Item = TaskUnit<E>>) -> &Self {
        for unit in units {
            self.add(unit);
        }
        self
    }

    /// Execute the next unit if none is running. Safe to call repeatedly.
    pub fn run(&self) -> &Self {
        let step = self.state.update(|s| {
            s.started = true;
            if s.cancelled || s.running || s.result.is_some() {
                return Step::Idle;
            }
            match s.units.pop_front() {
                Some(unit) => {
                    s.running = true;
                    Step::Execute(unit)
                }
                None => Step::Finish,
            }
        });

        match step {
            Step::Idle => {}
            Step::Finish => self.finish(Ok(())),
            Step::Execute(unit) => {
                tracing::debug!(chain = %self.name(), unit = %unit.name, "Running task unit");
                let chain = self.clone();
                let completion = TaskCompletion {
                    unit: unit.name,
                    callback: Some(Box::new(move |signal| chain.unit_finished(signal))),
                };
                (unit.work)(completion);
            }
        }
        self
    }

    /// Register the completion handler, replaying the result if already finished
    pub fn on_completion(&self, handler: impl FnOnce(ChainResult<E>) + Send + 'static) -> &Self {
        let replay = self.state.update(|s| match &s.result {
            Some(result) => Some((result.clone(), handler)),
            None => {
                s.handler = Some(Box::new(handler));
                None
            }
        });

        if let Some((result, handler)) = replay {
            handler(result);
        }
        self
    }

    /// Stop the chain; no further units run and the chain fails with `reason`
    pub fn cancel(&self, reason: E) {
        let first = self.state.update(|s| !std::mem::replace(&mut s.cancelled, true));
        if first {
            tracing::info!(chain = %self.name(), reason = %reason, "Cancelling task chain");
            self.finish(Err(reason));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.read(|s| s.cancelled)
    }

    pub fn is_finished(&self) -> bool {
        self.state.read(|s| s.result.is_some())
    }

    pub fn result(&self) -> Option<ChainResult<E>> {
        self.state.read(|s| s.result.clone())
    }

    pub fn name(&self) -> String {
        self.state.read(|s| s.name.clone())
    }

    fn unit_finished(&self, signal: Signal<E>) {
        self.state.update(|s| s.running = false);

        match signal {
            Signal::Succeeded => {
                self.run();
            }
            Signal::Failed(reason) => self.finish(Err(reason)),
            Signal::Abandoned(unit) => self.finish(Err(UnitAbandoned(unit).into())),
        }
    }

    fn finish(&self, result: ChainResult<E>) {
        let outcome = self.state.update(|s| {
            if s.result.is_some() {
                return None;
            }
            s.units.clear();
            s.result = Some(result.clone());
            Some((s.name.clone(), s.handler.take()))
        });

        let Some((name, handler)) = outcome else {
            return;
        };

        match &result {
            Ok(()) => tracing::debug!(chain = %name, "Task chain completed"),
            Err(e) => tracing::debug!(chain = %name, error = %e, "Task chain failed"),
        }

        if let Some(handler) = handler {
            handler(result);
        }
    }
}
