//! At-most-once pipeline execution per component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::config::Config;
use crate::context::Context;
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::sink::Fillable;
use crate::solver::Solver;
use crate::value::{Constraint, Kind, Node, Path, Value};

type Outcome = Result<Node, EngineError>;

#[derive(Default)]
struct Entry {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Entry {
    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            outcome = self.done.wait(outcome).unwrap();
        }
    }
}

/// Publishes the outcome and wakes every waiter, also when the pipeline
/// unwinds.
struct Release<'a> {
    entry: &'a Entry,
    outcome: Option<Outcome>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| Err(EngineError::Panic(String::from("pipeline unwound"))));
        *self.entry.outcome.lock().unwrap() = Some(outcome);
        self.entry.done.notify_all();
    }
}

/// Runs pipelines keyed by the canonical path of their component.
///
/// The first caller for a path runs the pipeline; later and concurrent
/// callers block until it finishes and observe the same outcome. The map is
/// locked only to look up or register an entry, so distinct paths run in
/// parallel. Outcomes that only mean "not ready yet" are forgotten so the
/// component can be retried.
pub struct PipelineManager {
    solver: Arc<dyn Solver>,
    config: Arc<Config>,
    entries: Mutex<HashMap<Path, Arc<Entry>>>,
    runs: AtomicUsize,
}

impl PipelineManager {
    pub fn new(solver: Arc<dyn Solver>, config: Arc<Config>) -> Self {
        Self {
            solver,
            config,
            entries: Mutex::new(HashMap::new()),
            runs: AtomicUsize::new(0),
        }
    }

    /// Number of pipelines actually started.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs the component at `value`, or waits for the run already
    /// registered under its canonical path, then fills `sink` with the
    /// exported result.
    pub fn run(&self, ctx: &Context, value: &Value, sink: &dyn Fillable) -> Result<(), EngineError> {
        let key = value.canonical_path();

        let (entry, owner) = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry = Arc::new(Entry::default());
                    entries.insert(key.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        let outcome = match owner {
            true => {
                let mut release = Release {
                    entry: &entry,
                    outcome: None,
                };
                let outcome = self.execute(ctx, &key, value);
                if let Err(err) = &outcome
                    && (err.is_abort() || err.is_canceled())
                {
                    self.entries.lock().unwrap().remove(&key);
                }
                release.outcome = Some(outcome.clone());
                outcome
            }
            false => {
                tracing::trace!(component = %key, "waiting for running pipeline");
                entry.wait()
            }
        };

        let node = outcome?;
        if node.kind != Kind::Top(Constraint::Any) || !node.defs.is_empty() {
            sink.fill(node)?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &Context, key: &Path, value: &Value) -> Outcome {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let result = Value::empty();
        let mut pipeline = Pipeline::new(
            key.to_string(),
            Arc::clone(&self.solver),
            Arc::new(result.clone()),
            Arc::clone(&self.config),
        );
        pipeline.run(ctx, value)?;
        Ok(result.node_or_top())
    }
}
