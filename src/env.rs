//! Layered state: plan, input and output merged into one document.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::context::Context;
use crate::engine::{Diagnostics, Scheduler, discover};
use crate::error::EngineError;
use crate::fs::FS;
use crate::llb::FileAction;
use crate::manager::PipelineManager;
use crate::op::Entitlement;
use crate::script;
use crate::solver::{Grants, Solver};
use crate::utils::as_overhead;
use crate::value::Value;

/// The three layers of a deployment and their merge.
///
/// Precedence is plan < input < output. Since merging never overrides a
/// concrete value, a disagreement between layers is a conflict rather than a
/// silent override.
pub struct Env {
    plan: Value,
    input: Value,
    output: Value,
    state: Value,
    solver: Arc<dyn Solver>,
    config: Arc<Config>,
}

fn derive(plan: &Value, input: &Value, output: &Value) -> Result<Value, EngineError> {
    let merged = plan.merge(input)?.merge(output)?;
    Ok(merged.resolved()?)
}

impl Env {
    pub fn new(plan: Value, solver: Arc<dyn Solver>, config: Config) -> Result<Self, EngineError> {
        let input = Value::empty();
        let output = Value::empty();
        let state = derive(&plan, &input, &output)?;
        Ok(Self {
            plan,
            input,
            output,
            state,
            solver,
            config: Arc::new(config),
        })
    }

    pub fn plan(&self) -> &Value {
        &self.plan
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn output(&self) -> &Value {
        &self.output
    }

    /// The merged document, as of the last change to any layer.
    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the plan layer.
    pub fn update(&mut self, plan: Value) -> Result<(), EngineError> {
        self.state = derive(&plan, &self.input, &self.output)?;
        self.plan = plan;
        Ok(())
    }

    pub fn set_input(&mut self, input: Value) -> Result<(), EngineError> {
        self.state = derive(&self.plan, &input, &self.output)?;
        self.input = input;
        Ok(())
    }

    /// Runs every component to a fixpoint, committing results into the
    /// output layer.
    ///
    /// Entitlements and local directories are collected up front and
    /// granted to the solver before anything runs.
    pub fn compute(&mut self, ctx: &Context) -> Result<Diagnostics, EngineError> {
        let start = Instant::now();

        let entitlements = self.entitlements();
        let denied: Vec<String> = entitlements
            .difference(&self.config.allow)
            .map(ToString::to_string)
            .collect();
        if !denied.is_empty() {
            return Err(EngineError::Entitlement(denied));
        }

        self.solver.grant(&Grants {
            entitlements,
            local_dirs: self.local_dirs(),
        });

        let manager = PipelineManager::new(Arc::clone(&self.solver), Arc::clone(&self.config));
        let result = {
            let (plan, input, output) = (&self.plan, &self.input, &self.output);
            Scheduler::new(&manager, &self.config).run(ctx, output, || derive(plan, input, output))
        };

        // Committed results are kept even when the run failed.
        self.state = derive(&self.plan, &self.input, &self.output)?;
        let diagnostics = result?;

        tracing::info!(
            "computed {} task(s) in {} pass(es) {}",
            diagnostics.terminated(),
            diagnostics.passes,
            as_overhead(start)
        );
        tracing::debug!("{}", diagnostics.render_summary());
        Ok(diagnostics)
    }

    /// Canonical JSON snapshot of the merged state. Incomplete fields are
    /// left out.
    pub fn export(&self) -> Result<String, EngineError> {
        Ok(self.state.merge(&self.output)?.json_partial()?)
    }

    /// Writes [`Env::export`] into a fresh filesystem as the configured
    /// state file.
    pub fn export_fs(&self, ctx: &Context) -> Result<FS, EngineError> {
        let snapshot = self.export()?;
        let path = format!("/{}", self.config.state_file.trim_start_matches('/'));

        let fs = FS::new(Arc::clone(&self.solver)).change(|st| {
            st.file(FileAction::Mkfile {
                path,
                mode: 0o600,
                content: snapshot,
            })
        });
        fs.solve(ctx)?;
        Ok(fs)
    }

    /// Elevated capabilities requested by any exec, nested scripts included.
    pub fn entitlements(&self) -> BTreeSet<Entitlement> {
        let mut found = BTreeSet::new();
        self.scan(|op, kind| {
            if kind != "exec" {
                return;
            }
            if op.lookup("network").as_str().is_ok_and(|n| n == "host") {
                found.insert(Entitlement::NetworkHost);
            }
            if op.lookup("privileged").as_bool().unwrap_or(false) {
                found.insert(Entitlement::SecurityInsecure);
            }
        });
        found
    }

    /// Host directories imported by any local operation.
    pub fn local_dirs(&self) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        self.scan(|op, kind| {
            if kind == "local"
                && let Ok(dir) = op.lookup("dir").as_str()
            {
                found.insert(dir);
            }
        });
        found
    }

    /// Calls `f` with every operation of every component, and its `do`.
    fn scan(&self, mut f: impl FnMut(&Value, &str)) {
        for task in discover(&self.state) {
            let _ = script::analyze(task.value(), &mut |op: &Value| {
                if let Ok(kind) = op.lookup("do").as_str() {
                    f(op, &kind);
                }
                Ok::<(), ()>(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::{Compiler, JsonCompiler};
    use crate::error::ValueError;
    use crate::solver::MemorySolver;
    use crate::solver::memory::Snapshot;
    use crate::value::Path;

    fn compile(source: &str) -> Value {
        JsonCompiler.compile("plan.json", source).unwrap()
    }

    fn counting_solver() -> Arc<MemorySolver> {
        Arc::new(MemorySolver::new().with_exec(|req| {
            let out = req.args.join(" ");
            req.root.write_file("/out", out, 0o644);
            Ok(())
        }))
    }

    const BUILD_TEST: &str = r##"{
        "build": {
            "$type": "string",
            "#up": [
                {"do": "exec", "args": ["make", "build"]},
                {"do": "export", "source": "/out"}
            ]
        },
        "test": {
            "$type": "string",
            "#up": [
                {"do": "exec", "args": ["make", "test"], "env": {"BUILD": {"$ref": "build"}}},
                {"do": "export", "source": "/out"}
            ]
        }
    }"##;

    #[test]
    fn test_dependent_task_runs_in_next_pass() {
        let solver = counting_solver();
        let mut env = Env::new(compile(BUILD_TEST), solver.clone(), Config::default()).unwrap();

        let diagnostics = env.compute(&Context::new()).unwrap();

        assert_eq!(diagnostics.passes, 2);
        assert_eq!(diagnostics.execution_times[&Path::parse("build")].pass, 1);
        assert_eq!(diagnostics.execution_times[&Path::parse("test")].pass, 2);
        assert!(diagnostics.pending.is_empty());
        assert_eq!(solver.exec_count(), 2);
        assert_eq!(
            env.output().json().unwrap(),
            r#"{"build":"make build","test":"make test"}"#
        );
        assert_eq!(env.state().lookup("test").as_str().unwrap(), "make test");
    }

    #[test]
    fn test_terminated_tasks_never_rerun() {
        let solver = Arc::new(MemorySolver::new().with_exec(|req| {
            req.root.write_file("/out", "x", 0o644);
            Ok(())
        }));
        let plan = compile(
            r##"{
                "a": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["a"], "always": true},
                    {"do": "export", "source": "/out"}
                ]},
                "b": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["b"], "always": true, "env": {"A": {"$ref": "a"}}},
                    {"do": "export", "source": "/out"}
                ]},
                "c": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["c"], "always": true, "env": {"B": {"$ref": "b"}}},
                    {"do": "export", "source": "/out"}
                ]}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        let diagnostics = env.compute(&Context::new()).unwrap();
        assert_eq!(diagnostics.passes, 3);
        assert_eq!(solver.exec_count(), 3);
        assert_eq!(
            solver.exec_log(),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_unresolvable_reference_stays_pending() {
        let solver = counting_solver();
        let plan = compile(
            r##"{
                "ok": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["ok"]},
                    {"do": "export", "source": "/out"}
                ]},
                "stuck": {"#up": [
                    {"do": "exec", "args": ["stuck"], "env": {"X": {"$ref": "nowhere.value"}}}
                ]}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        let diagnostics = env.compute(&Context::new()).unwrap();
        assert_eq!(diagnostics.passes, 1);
        assert_eq!(diagnostics.pending, vec![Path::parse("stuck")]);
        assert_eq!(solver.exec_log(), vec![vec!["ok".to_string()]]);
    }

    #[test]
    fn test_bogus_op_fails_only_its_task() {
        let solver = counting_solver();
        let plan = compile(
            r##"{
                "good": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["echo", "hi"]},
                    {"do": "export", "source": "/out"}
                ]},
                "bad": {"#up": [{"do": "bogus"}]}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        let err = env.compute(&Context::new()).unwrap_err();
        assert!(err.is_schema());
        assert_eq!(err.paths()[0].to_string(), "bad");
        assert_eq!(env.output().json().unwrap(), r#"{"good":"echo hi"}"#);
        assert_eq!(env.state().lookup("good").as_str().unwrap(), "echo hi");
    }

    #[test]
    fn test_misshapen_script_fails_only_its_task() {
        let solver = counting_solver();
        let plan = compile(
            r##"{
                "good": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["echo", "hi"]},
                    {"do": "export", "source": "/out"}
                ]},
                "bad": {"#up": {"do": "mkdir", "path": "/a"}}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        let err = env.compute(&Context::new()).unwrap_err();
        assert!(err.is_schema());
        assert_eq!(err.paths()[0].to_string(), "bad");
        assert_eq!(env.output().json().unwrap(), r#"{"good":"echo hi"}"#);
    }

    #[test]
    fn test_conflicting_export_fails_compute() {
        let plan = compile(
            r##"{
                "a": {"$type": "int", "#up": [
                    {"do": "mkfile", "dest": "/v", "content": "hi"},
                    {"do": "export", "source": "/v"}
                ]}
            }"##,
        );
        let mut env = Env::new(plan, counting_solver(), Config::default()).unwrap();

        let err = env.compute(&Context::new()).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            EngineError::Value(ValueError::Conflict { path, .. }) if path.to_string() == "a"
        ));
    }

    #[test]
    fn test_input_layer_unblocks_task() {
        let solver = counting_solver();
        let plan = compile(
            r##"{
                "name": {"$type": "string"},
                "greet": {"$type": "string", "#up": [
                    {"do": "exec", "args": ["hello", {"$ref": "name"}]},
                    {"do": "export", "source": "/out"}
                ]}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        let diagnostics = env.compute(&Context::new()).unwrap();
        assert_eq!(diagnostics.passes, 0);
        assert_eq!(diagnostics.pending, vec![Path::parse("greet")]);

        env.set_input(Value::from(serde_json::json!({"name": "world"})))
            .unwrap();
        env.compute(&Context::new()).unwrap();
        assert_eq!(env.state().lookup("greet").as_str().unwrap(), "hello world");

        let conflict = env.update(compile(r#"{"name": "moon"}"#));
        assert!(conflict.is_err());
        assert!(env.plan().lookup("greet").exists());
    }

    #[test]
    fn test_entitlements_nested_three_deep() {
        let plan = compile(
            r##"{
                "deploy": {"#up": [
                    {"do": "copy", "from": [
                        {"do": "copy", "from": [
                            {"do": "copy", "from": [
                                {"do": "exec", "args": ["curl"], "network": "host"}
                            ]}
                        ]}
                    ]}
                ]},
                "plain": {"#up": [{"do": "exec", "args": ["true"], "privileged": false}]}
            }"##,
        );
        let mut env = Env::new(plan, counting_solver(), Config::default()).unwrap();

        assert_eq!(env.entitlements(), BTreeSet::from([Entitlement::NetworkHost]));

        let err = env.compute(&Context::new()).unwrap_err();
        assert!(matches!(&err, EngineError::Entitlement(names) if names == &["network.host"]));
    }

    #[test]
    fn test_granted_entitlement_reaches_solver() {
        let solver = counting_solver();
        let plan = compile(
            r##"{"fetch": {"#up": [{"do": "exec", "args": ["curl"], "network": "host"}]}}"##,
        );
        let config = Config {
            allow: BTreeSet::from([Entitlement::NetworkHost]),
            ..Config::default()
        };
        let mut env = Env::new(plan, solver.clone(), config).unwrap();

        env.compute(&Context::new()).unwrap();
        assert!(solver.granted().entitlements.contains(&Entitlement::NetworkHost));
        assert_eq!(solver.exec_count(), 1);
    }

    #[test]
    fn test_local_dir_under_referenced_field() {
        let solver = Arc::new(
            MemorySolver::new()
                .with_local(".", Snapshot::new().with_file("/main.rs", "fn main() {}")),
        );
        let plan = compile(
            r##"{
                "repository": [{"do": "local", "dir": ".", "include": ["*.rs"]}],
                "build": {"$type": "string", "#up": [
                    {"do": "copy", "from": {"$ref": "repository"}, "dest": "/src"},
                    {"do": "export", "source": "/src/main.rs"}
                ]}
            }"##,
        );
        let mut env = Env::new(plan, solver.clone(), Config::default()).unwrap();

        assert_eq!(env.local_dirs(), BTreeSet::from([String::from(".")]));

        env.compute(&Context::new()).unwrap();
        assert!(solver.granted().local_dirs.contains("."));
        assert_eq!(env.state().lookup("build").as_str().unwrap(), "fn main() {}");
    }

    #[test]
    fn test_export_fs_writes_snapshot() {
        let mut env = Env::new(compile(BUILD_TEST), counting_solver(), Config::default()).unwrap();
        env.set_input(Value::from(serde_json::json!({"extra": [1, 2]})))
            .unwrap();
        env.compute(&Context::new()).unwrap();

        let expected = r#"{"build":"make build","extra":[1,2],"test":"make test"}"#;
        assert_eq!(env.export().unwrap(), expected);

        let fs = env.export_fs(&Context::new()).unwrap();
        let written = fs.read_file(&Context::new(), "/computed.json").unwrap();
        assert_eq!(String::from_utf8(written).unwrap(), expected);
    }

    #[test]
    fn test_canceled_compute() {
        let mut env = Env::new(compile(BUILD_TEST), counting_solver(), Config::default()).unwrap();
        let ctx = Context::new();
        ctx.cancel();

        let err = env.compute(&ctx).unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(env.output().json_partial().unwrap(), "{}");
    }
}
