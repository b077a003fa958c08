//! Weighted download progress
//!
//! Fixed-weight tasks reserve their share of the total up front. Flexible
//! tasks split whatever budget remains equally, and are re-weighted every
//! time a task is added, so the pipeline can declare its known steps before
//! it knows how many assets a package references.

use std::sync::Arc;

use axis_tasks::Guarded;

const EPSILON: f64 = 1e-9;

type ProgressListener = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub url: String,
    pub weight: f64,
    pub is_fixed_weight: bool,
    pub is_completed: bool,
}

#[derive(Default)]
struct ProgressState {
    tasks: Vec<DownloadTask>,
    progress: f64,
    listener: Option<ProgressListener>,
}

impl ProgressState {
    fn fixed_total(&self) -> f64 {
        self.tasks
            .iter()
            .filter(|t| t.is_fixed_weight)
            .map(|t| t.weight)
            .sum()
    }

    fn accepts_tasks(&self) -> bool {
        self.progress < 1.0 - EPSILON && self.fixed_total() < 1.0 - EPSILON
    }

    /// Split the unreserved budget evenly over unfinished flexible tasks.
    /// Completed tasks keep the weight they finished with.
    fn redistribute(&mut self) {
        let budget = (1.0 - self.fixed_total()).max(0.0);

        let unfinished = self
            .tasks
            .iter()
            .filter(|t| !t.is_fixed_weight && !t.is_completed)
            .count();
        if unfinished == 0 {
            return;
        }

        let share = budget / unfinished as f64;
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| !t.is_fixed_weight && !t.is_completed)
        {
            task.weight = share;
        }
    }

    fn completed_total(&self) -> f64 {
        self.tasks
            .iter()
            .filter(|t| t.is_completed)
            .map(|t| t.weight)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

#[derive(Default)]
pub struct ProgressAggregator {
    state: Guarded<ProgressState>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task with a reserved share of the total.
    ///
    /// Weights outside `[0, 1]`, or that would push the reserved total past
    /// 1.0, demote the task to flexible. A zero weight is not added.
    pub fn add_fixed_weight(&self, url: &str, weight: f64) -> bool {
        if weight == 0.0 {
            return false;
        }
        self.add(url, Some(weight))
    }

    pub fn add_flexible_weight(&self, url: &str) -> bool {
        self.add(url, None)
    }

    /// Mark a task finished and notify the listener with the new total
    pub fn mark_completed(&self, url: &str) -> bool {
        let update = self.state.update(|s| {
            let task = s.tasks.iter_mut().find(|t| t.url == url && !t.is_completed)?;
            task.is_completed = true;
            s.progress = s.completed_total().max(s.progress);
            Some((s.progress, s.listener.clone()))
        });

        match update {
            Some((progress, listener)) => {
                if let Some(listener) = listener {
                    listener(progress);
                }
                true
            }
            None => false,
        }
    }

    /// Report full progress once the whole pipeline has succeeded
    pub fn finish(&self) {
        let listener = self.state.update(|s| {
            if s.progress >= 1.0 {
                return None;
            }
            s.progress = 1.0;
            s.listener.clone()
        });

        if let Some(listener) = listener {
            listener(1.0);
        }
    }

    pub fn current_progress(&self) -> f64 {
        self.state.read(|s| s.progress)
    }

    pub fn on_progress(&self, listener: impl Fn(f64) + Send + Sync + 'static) {
        let listener: ProgressListener = Arc::new(listener);
        self.state.update(|s| s.listener = Some(listener));
    }

    pub fn task(&self, url: &str) -> Option<DownloadTask> {
        self.state
            .read(|s| s.tasks.iter().find(|t| t.url == url).cloned())
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.state.read(|s| s.tasks.clone())
    }

    fn add(&self, url: &str, weight: Option<f64>) -> bool {
        self.state.update(|s| {
            if !s.accepts_tasks() || s.tasks.iter().any(|t| t.url == url) {
                return false;
            }

            let fixed = weight.filter(|w| {
                (0.0..=1.0).contains(w) && s.fixed_total() + w <= 1.0 + EPSILON
            });
            if weight.is_some() && fixed.is_none() {
                tracing::debug!(url = %url, weight = ?weight, "Demoting task to flexible weight");
            }

            s.tasks.push(DownloadTask {
                url: url.to_string(),
                weight: fixed.unwrap_or(0.0),
                is_fixed_weight: fixed.is_some(),
                is_completed: false,
            });
            s.redistribute();
            true
        })
    }
}
