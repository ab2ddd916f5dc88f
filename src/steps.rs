//! Step orchestration.
//!
//! Provisioning is expressed as an ordered list of labeled steps, each of
//! which is idempotent: it probes for existing state and only creates
//! what is missing, so the whole pipeline can be re-run after any
//! interruption. Steps are either global (run once) or per-node (run for
//! every node with bounded parallelism); a failing node step does not
//! stop its siblings, but the run as a whole reports the failure.
//!
//! Progress reporting goes through the injected [`StepRecorder`] rather
//! than a concrete UI type, so hosts can surface it however they like and
//! tests can observe exactly which steps ran.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tracing::{error, info};

use crate::retry::CancelFlag;
use crate::{Error, Result};

/// Observer for step lifecycle events
#[cfg_attr(test, mockall::automock)]
pub trait StepRecorder: Send + Sync {
    /// A global step began
    fn step_started(&self, label: &str);
    /// A global step finished successfully
    fn step_completed(&self, label: &str);
    /// A global step failed
    fn step_failed(&self, label: &str, error: &str);
    /// A node's share of a per-node step began
    fn node_step_started(&self, label: &str, node: &str);
    /// A node's share of a per-node step finished successfully
    fn node_step_completed(&self, label: &str, node: &str);
    /// A node's share of a per-node step failed
    fn node_step_failed(&self, label: &str, node: &str, error: &str);
}

/// Default recorder that reports through structured logging
#[derive(Default)]
pub struct LogRecorder;

impl StepRecorder for LogRecorder {
    fn step_started(&self, label: &str) {
        info!(step = label, "step started");
    }

    fn step_completed(&self, label: &str) {
        info!(step = label, "step completed");
    }

    fn step_failed(&self, label: &str, error: &str) {
        error!(step = label, error, "step failed");
    }

    fn node_step_started(&self, label: &str, node: &str) {
        info!(step = label, node, "node step started");
    }

    fn node_step_completed(&self, label: &str, node: &str) {
        info!(step = label, node, "node step completed");
    }

    fn node_step_failed(&self, label: &str, node: &str, error: &str) {
        error!(step = label, node, error, "node step failed");
    }
}

/// Deferred step body; invoked when the pipeline reaches the step
pub type StepFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

enum Step<'a> {
    Global {
        label: String,
        run: StepFn<'a>,
    },
    PerNode {
        label: String,
        runs: Vec<(String, StepFn<'a>)>,
    },
}

/// An ordered, resumable list of provisioning steps
pub struct Pipeline<'a> {
    recorder: Arc<dyn StepRecorder>,
    cancel: CancelFlag,
    node_parallelism: usize,
    steps: Vec<Step<'a>>,
}

impl<'a> Pipeline<'a> {
    /// Create an empty pipeline. `node_parallelism` bounds how many nodes
    /// a per-node step touches concurrently.
    pub fn new(
        recorder: Arc<dyn StepRecorder>,
        cancel: CancelFlag,
        node_parallelism: usize,
    ) -> Self {
        Self {
            recorder,
            cancel,
            node_parallelism: node_parallelism.max(1),
            steps: Vec::new(),
        }
    }

    /// Append a global step
    pub fn add_global<F, Fut>(&mut self, label: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: std::future::Future<Output = Result<()>> + Send + 'a,
    {
        self.steps.push(Step::Global {
            label: label.into(),
            run: Box::new(move || Box::pin(step())),
        });
    }

    /// Append a per-node step; `runs` pairs each node name with its body
    pub fn add_per_node(&mut self, label: impl Into<String>, runs: Vec<(String, StepFn<'a>)>) {
        self.steps.push(Step::PerNode {
            label: label.into(),
            runs,
        });
    }

    /// Run every step in order. A global failure or cancellation stops
    /// the pipeline; within a per-node step every node runs to completion
    /// before the first node failure is reported.
    pub async fn run(self) -> Result<()> {
        for step in self.steps {
            self.cancel.check()?;

            match step {
                Step::Global { label, run } => {
                    self.recorder.step_started(&label);
                    match run().await {
                        Ok(()) => self.recorder.step_completed(&label),
                        Err(e) => {
                            self.recorder.step_failed(&label, &e.to_string());
                            return Err(e);
                        }
                    }
                }
                Step::PerNode { label, runs } => {
                    self.recorder.step_started(&label);

                    let recorder = &self.recorder;
                    let label_ref = &label;
                    // The futures are built up front; streaming the boxed
                    // closures through a map adapter trips over their
                    // non-'static lifetime.
                    let jobs: Vec<_> = runs
                        .into_iter()
                        .map(|(node, run)| async move {
                            recorder.node_step_started(label_ref, &node);
                            let result = run().await;
                            match &result {
                                Ok(()) => recorder.node_step_completed(label_ref, &node),
                                Err(e) => {
                                    recorder.node_step_failed(label_ref, &node, &e.to_string())
                                }
                            }
                            (node, result)
                        })
                        .collect();
                    let results: Vec<(String, Result<()>)> = stream::iter(jobs)
                        .buffer_unordered(self.node_parallelism)
                        .collect()
                        .await;

                    let mut first_failure = None;
                    for (node, result) in results {
                        if let Err(e) = result {
                            let failure = match e {
                                e @ (Error::NodeFailure { .. } | Error::Canceled) => e,
                                other => Error::node_failure(node, other.to_string()),
                            };
                            if first_failure.is_none() {
                                first_failure = Some(failure);
                            }
                        }
                    }

                    if let Some(failure) = first_failure {
                        self.recorder.step_failed(&label, &failure.to_string());
                        return Err(failure);
                    }

                    self.recorder.step_completed(&label);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Recorder collecting event labels in order
    #[derive(Default)]
    struct TraceRecorder {
        events: Mutex<Vec<String>>,
    }

    impl TraceRecorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl StepRecorder for TraceRecorder {
        fn step_started(&self, label: &str) {
            self.push(format!("start {label}"));
        }
        fn step_completed(&self, label: &str) {
            self.push(format!("done {label}"));
        }
        fn step_failed(&self, label: &str, _error: &str) {
            self.push(format!("fail {label}"));
        }
        fn node_step_started(&self, _label: &str, _node: &str) {}
        fn node_step_completed(&self, label: &str, node: &str) {
            self.push(format!("done {label}/{node}"));
        }
        fn node_step_failed(&self, label: &str, node: &str, _error: &str) {
            self.push(format!("fail {label}/{node}"));
        }
    }

    fn node_run<'a, F, Fut>(name: &str, f: F) -> (String, StepFn<'a>)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: std::future::Future<Output = Result<()>> + Send + 'a,
    {
        (name.to_string(), Box::new(move || Box::pin(f())))
    }

    #[tokio::test]
    async fn global_steps_run_in_order() {
        let recorder = Arc::new(TraceRecorder::default());
        let mut pipeline = Pipeline::new(recorder.clone(), CancelFlag::new(), 4);

        pipeline.add_global("first", || async { Ok(()) });
        pipeline.add_global("second", || async { Ok(()) });
        pipeline.run().await.unwrap();

        assert_eq!(
            recorder.events(),
            ["start first", "done first", "start second", "done second"]
        );
    }

    #[tokio::test]
    async fn global_failure_stops_the_pipeline() {
        let recorder = Arc::new(TraceRecorder::default());
        let mut pipeline = Pipeline::new(recorder.clone(), CancelFlag::new(), 4);

        pipeline.add_global("boom", || async { Err(Error::provider("nope")) });
        pipeline.add_global("after", || async { Ok(()) });

        assert!(pipeline.run().await.is_err());
        assert_eq!(recorder.events(), ["start boom", "fail boom"]);
    }

    #[tokio::test]
    async fn failing_node_does_not_stop_siblings() {
        let recorder = Arc::new(TraceRecorder::default());
        let completed = Arc::new(AtomicU32::new(0));
        let mut pipeline = Pipeline::new(recorder.clone(), CancelFlag::new(), 4);

        let runs = vec![
            node_run("a", {
                let completed = completed.clone();
                move || async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            node_run("b", || async {
                Err(Error::node_failure("b", "instance vanished"))
            }),
            node_run("c", {
                let completed = completed.clone();
                move || async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ];
        pipeline.add_per_node("provision", runs);

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, Error::NodeFailure { node, .. } if node == "b"));
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert!(recorder.events().contains(&"fail provision/b".to_string()));
    }

    #[tokio::test]
    async fn node_parallelism_is_bounded() {
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let runs = (0..8)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                node_run(&format!("n{i}"), move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let mut pipeline = Pipeline::new(Arc::new(LogRecorder), CancelFlag::new(), 2);
        pipeline.add_per_node("work", runs);
        pipeline.run().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_preempts_remaining_steps() {
        let cancel = CancelFlag::new();
        let recorder = Arc::new(TraceRecorder::default());
        let mut pipeline = Pipeline::new(recorder.clone(), cancel.clone(), 4);

        pipeline.add_global("first", {
            let cancel = cancel.clone();
            move || async move {
                cancel.cancel();
                Ok(())
            }
        });
        pipeline.add_global("second", || async { Ok(()) });

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert_eq!(recorder.events(), ["start first", "done first"]);
    }

    #[tokio::test]
    async fn mock_recorder_observes_step_lifecycle() {
        let mut mock = MockStepRecorder::new();
        mock.expect_step_started().times(1).return_const(());
        mock.expect_step_completed().times(1).return_const(());

        let mut pipeline = Pipeline::new(Arc::new(mock), CancelFlag::new(), 1);
        pipeline.add_global("only", || async { Ok(()) });
        pipeline.run().await.unwrap();
    }
}
