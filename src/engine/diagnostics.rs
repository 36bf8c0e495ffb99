use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::value::Path;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    /// Scheduler pass the task ran in, starting at 1.
    pub pass: usize,
}

/// Outcome of one [`crate::Env::compute`] run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Number of passes that dispatched at least one task.
    pub passes: usize,
    /// Tasks that ran to completion, by component path.
    pub execution_times: BTreeMap<Path, TaskExecution>,
    /// Components still waiting for inputs when the run reached a fixpoint.
    pub pending: Vec<Path>,
}

impl Diagnostics {
    pub fn terminated(&self) -> usize {
        self.execution_times.len()
    }

    /// Plain text table, one task per line in execution order.
    pub fn render_summary(&self) -> String {
        let mut tasks: Vec<_> = self.execution_times.iter().collect();
        tasks.sort_by_key(|(_, t)| (t.pass, t.start));

        let mut f = String::new();
        let _ = writeln!(
            f,
            "{} task(s) in {} pass(es), {} pending",
            tasks.len(),
            self.passes,
            self.pending.len()
        );
        for (path, exec) in tasks {
            let _ = writeln!(f, "  [{}] {path} {:.2?}", exec.pass, exec.duration);
        }
        for path in &self.pending {
            let _ = writeln!(f, "  [-] {path} pending");
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostics() -> Diagnostics {
        let start = Instant::now();
        let mut execution_times = BTreeMap::new();
        execution_times.insert(
            Path::parse("build"),
            TaskExecution {
                start,
                duration: Duration::from_millis(2),
                pass: 1,
            },
        );
        execution_times.insert(
            Path::parse("a.\"<test>\""),
            TaskExecution {
                start: start + Duration::from_millis(2),
                duration: Duration::from_millis(1),
                pass: 2,
            },
        );
        Diagnostics {
            passes: 2,
            execution_times,
            pending: vec![Path::parse("deploy")],
        }
    }

    #[test]
    fn test_summary_orders_by_pass() {
        let summary = diagnostics().render_summary();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "2 task(s) in 2 pass(es), 1 pending");
        assert!(lines[1].starts_with("  [1] build "));
        assert!(lines[2].starts_with("  [2] a.\"<test>\" "));
        assert_eq!(lines[3], "  [-] deploy pending");
    }
}
