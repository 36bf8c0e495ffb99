//! Dataflow scheduler.
//!
//! Components are discovered from data alone: every pass re-derives the
//! merged document, collects every node carrying a compute script and runs
//! those whose inputs are all concrete. A component depending on another
//! component's output is simply incomplete until the producer commits, so no
//! dependency graph is ever built. The loop ends at the first pass that
//! terminates nothing new.

mod diagnostics;
mod task;

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::Config;
use crate::context::Context;
use crate::error::EngineError;
use crate::manager::PipelineManager;
use crate::utils::{style_pass, style_task};
use crate::value::{Path, Value};

pub use diagnostics::{Diagnostics, TaskExecution};
pub use task::{Task, TaskState, discover};

type TaskResult = (Path, Result<(), EngineError>, Instant, Duration);

pub struct Scheduler<'a> {
    manager: &'a PipelineManager,
    config: &'a Config,
}

impl<'a> Scheduler<'a> {
    pub fn new(manager: &'a PipelineManager, config: &'a Config) -> Self {
        Self { manager, config }
    }

    /// Runs passes until a fixpoint. `derive` produces the merged document
    /// for a pass; results are committed into `output` at each component's
    /// path.
    ///
    /// A task rejected for its own shape does not stop its siblings; the
    /// first such error is returned once the run settles. Any other failure
    /// cancels the tasks still running and ends the run right after the
    /// current pass. Results already committed stay in `output` either way.
    pub fn run(
        &self,
        ctx: &Context,
        output: &Value,
        mut derive: impl FnMut() -> Result<Value, EngineError>,
    ) -> Result<Diagnostics, EngineError> {
        let pool = self.config.parallelism.and_then(|threads| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("sluice-{i}"))
                .build()
                .inspect_err(|e| tracing::warn!("falling back to the global thread pool: {e}"))
                .ok()
        });

        let mut tasks: BTreeMap<Path, Task> = BTreeMap::new();
        let mut diagnostics = Diagnostics::default();
        let mut rejected: Option<EngineError> = None;

        loop {
            ctx.check()?;

            if let Some(max) = self.config.max_passes
                && diagnostics.passes >= max
            {
                tracing::warn!(passes = max, "stopping before a fixpoint, pass limit reached");
                break;
            }

            let state = derive()?;
            for found in discover(&state) {
                match tasks.get_mut(found.path()) {
                    Some(task) if task.state() == TaskState::Pending => {
                        task.refresh(found.value().clone());
                    }
                    Some(_) => {}
                    None => {
                        tasks.insert(found.path().clone(), found);
                    }
                }
            }

            let ready: Vec<Task> = tasks
                .values()
                .filter(|task| task.state() == TaskState::Pending && task.is_ready())
                .cloned()
                .collect();

            if ready.is_empty() {
                break;
            }

            diagnostics.passes += 1;
            let pass = diagnostics.passes;
            for task in &ready {
                if let Some(task) = tasks.get_mut(task.path()) {
                    task.set_state(TaskState::Running);
                }
            }

            let results = self.run_pass(ctx, pass, ready, output, pool.as_ref());

            let mut terminated = 0;
            let mut failure: Option<EngineError> = None;
            for (path, result, start, duration) in results {
                let Some(task) = tasks.get_mut(&path) else {
                    continue;
                };

                match result {
                    Ok(()) => {
                        tracing::info!(task = %path, pass, ?duration, "completed");
                        task.set_state(TaskState::Terminated);
                        diagnostics
                            .execution_times
                            .insert(path, TaskExecution { start, duration, pass });
                        terminated += 1;
                    }
                    Err(err) if err.is_abort() => {
                        task.set_state(TaskState::Pending);
                    }
                    Err(err) if err.is_schema() => {
                        tracing::error!(task = %path, "{err}");
                        task.set_state(TaskState::Failed);
                        rejected.get_or_insert(err.in_task(&path));
                    }
                    Err(err) => {
                        task.set_state(TaskState::Failed);
                        let replace = match &failure {
                            None => true,
                            Some(current) => current.is_canceled() && !err.is_canceled(),
                        };
                        if replace {
                            failure = Some(err.in_task(&path));
                        }
                    }
                }
            }

            if let Some(err) = failure {
                return Err(err);
            }
            if terminated == 0 {
                break;
            }
        }

        diagnostics.pending = tasks
            .values()
            .filter(|task| task.state() == TaskState::Pending)
            .map(|task| task.path().clone())
            .collect();

        for path in &diagnostics.pending {
            tracing::debug!(task = %path, "left pending, inputs never became concrete");
        }

        match rejected {
            Some(err) => Err(err),
            None => Ok(diagnostics),
        }
    }

    /// Runs the ready tasks of one pass concurrently and collects every
    /// result. A hard failure cancels the rest of the pass.
    fn run_pass(
        &self,
        ctx: &Context,
        pass: usize,
        ready: Vec<Task>,
        output: &Value,
        pool: Option<&rayon::ThreadPool>,
    ) -> Vec<TaskResult> {
        let root_span = tracing::span!(Level::INFO, "pass", pass);
        root_span.pb_set_length(ready.len() as u64);
        root_span.pb_set_style(&style_pass());
        root_span.pb_set_message(&format!("Pass {pass}"));
        let _enter = root_span.enter();

        let pass_ctx = ctx.child();
        let (sender, receiver) = channel::<TaskResult>();
        let manager = self.manager;

        match pool {
            Some(pool) => pool.scope(|s| {
                spawn_tasks(s, ready, manager, output, &pass_ctx, &root_span, sender)
            }),
            None => rayon::scope(|s| {
                spawn_tasks(s, ready, manager, output, &pass_ctx, &root_span, sender)
            }),
        }

        receiver.into_iter().collect()
    }
}

fn spawn_tasks<'s>(
    s: &rayon::Scope<'s>,
    ready: Vec<Task>,
    manager: &'s PipelineManager,
    output: &'s Value,
    ctx: &'s Context,
    root_span: &'s tracing::Span,
    sender: Sender<TaskResult>,
) {
    for task in ready {
        let sender = sender.clone();
        let sink = output.lookup_path(task.path());

        s.spawn(move |_| {
            let span = tracing::span!(Level::INFO, "task", path = %task.path());
            span.pb_set_style(&style_task());
            span.pb_set_message(&format!("Running {}", task.path()));
            let _enter = span.enter();

            let start = Instant::now();
            let result = match catch_unwind(AssertUnwindSafe(|| {
                manager.run(ctx, task.value(), &sink)
            })) {
                Ok(result) => result,
                Err(panic) => Err(EngineError::Panic(panic_message(panic))),
            };
            let elapsed = start.elapsed();

            if let Err(err) = &result
                && !err.is_abort()
                && !err.is_schema()
            {
                ctx.cancel();
            }

            root_span.pb_inc(1);
            let _ = sender.send((task.path().clone(), result, start, elapsed));
        });
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
