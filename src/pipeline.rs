//! Sequential execution of a script over a lazy filesystem.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::context::Context;
use crate::error::EngineError;
use crate::fs::FS;
use crate::llb::{Def, ExecDef, FileAction, MountDef, MountSource, State, join_path};
use crate::op::{Exec, ExportFormat, FetchHttp, Mount, Op, normalize_image_ref, redact_url};
use crate::script::Script;
use crate::sink::{Discard, Fillable};
use crate::solver::Solver;
use crate::value::{Node, Path, Value};

/// Environment variable carrying the per-run cache buster of `always` execs.
pub const CACHE_BUSTER_ENV: &str = "SLUICE_CACHEBUSTER";

pub struct Pipeline {
    name: String,
    solver: Arc<dyn Solver>,
    sink: Arc<dyn Fillable>,
    config: Arc<Config>,
    fs: FS,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        solver: Arc<dyn Solver>,
        sink: Arc<dyn Fillable>,
        config: Arc<Config>,
    ) -> Self {
        let fs = FS::new(Arc::clone(&solver));
        Self {
            name: name.into(),
            solver,
            sink,
            config,
            fs,
        }
    }

    /// Child pipeline on an empty filesystem whose exports go nowhere.
    pub fn tmp(&self, name: impl Into<String>) -> Pipeline {
        Pipeline::new(
            name,
            Arc::clone(&self.solver),
            Arc::new(Discard),
            Arc::clone(&self.config),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem produced by the operations run so far.
    pub fn fs(&self) -> &FS {
        &self.fs
    }

    /// Runs every operation of the script found at `value`.
    ///
    /// Fails with [`EngineError::Abort`] as soon as an operation is not fully
    /// concrete; the operations before it stay applied to [`Pipeline::fs`].
    pub fn run(&mut self, ctx: &Context, value: &Value) -> Result<(), EngineError> {
        let start = Instant::now();
        tracing::debug!(pipeline = %self.name, state = "computing");

        let result = self.execute(ctx, value);
        let duration = start.elapsed();

        match &result {
            Ok(()) => {
                tracing::debug!(pipeline = %self.name, state = "completed", ?duration);
            }
            Err(err) if err.is_abort() => {}
            Err(err) if err.is_canceled() => {
                tracing::warn!(pipeline = %self.name, state = "canceled", ?duration);
            }
            Err(err) => {
                tracing::error!(pipeline = %self.name, state = "failed", ?duration, "{err}");
            }
        }

        result
    }

    fn execute(&mut self, ctx: &Context, value: &Value) -> Result<(), EngineError> {
        let script = Script::parse(value)?;
        let at = script.value().path().clone();

        for (index, op) in script.ops().iter().enumerate() {
            ctx.check()?;

            if let Err(err) = op.check_concrete() {
                tracing::debug!(
                    pipeline = %self.name,
                    op = index,
                    missing = %err.path(),
                    "pipeline was partially executed because of missing inputs"
                );
                return Err(EngineError::Abort);
            }

            let fs = self
                .dispatch(ctx, op)
                .map_err(|err| err.at_op(&at, index))?;

            // Solve right away so a failure points at this operation.
            fs.solve(ctx)
                .map_err(|err| EngineError::from(err).at_op(&at, index))?;

            self.fs = fs;
        }

        Ok(())
    }

    fn dispatch(&self, ctx: &Context, value: &Value) -> Result<FS, EngineError> {
        let op = Op::decode(value)?;
        tracing::trace!(pipeline = %self.name, op = op.name(), path = %value.path());

        let fs = &self.fs;
        match op {
            Op::Copy { from, src, dest } => {
                let from = self.sub(ctx, &from)?;
                Ok(fs.change(|st| {
                    st.file(FileAction::Copy {
                        src: Box::new(from.def),
                        src_path: src,
                        dest,
                        contents_only: true,
                        create_dest_path: true,
                        allow_wildcard: true,
                    })
                }))
            }
            Op::Exec(exec) => self.exec(ctx, value, exec),
            Op::Export { source, format } => self.export(ctx, &source, format),
            Op::FetchContainer { reference } => self.fetch_container(ctx, &reference),
            Op::FetchGit {
                remote,
                reference,
                keep_git_dir,
            } => {
                tracing::debug!(remote = %redact_url(&remote), reference = %reference, "fetch git");
                Ok(fs.set(State::from_def(Def::Git {
                    remote,
                    reference,
                    keep_git_dir,
                })))
            }
            Op::FetchHttp(FetchHttp {
                url,
                checksum,
                filename,
                mode,
            }) => {
                tracing::debug!(url = %redact_url(&url), "fetch http");
                Ok(fs.set(State::from_def(Def::Http {
                    url,
                    checksum,
                    filename,
                    mode,
                })))
            }
            Op::Local {
                dir,
                include,
                exclude,
            } => Ok(fs.change(|st| {
                st.merge(Def::Local {
                    dir,
                    include,
                    exclude,
                })
            })),
            Op::Load { from } => Ok(fs.set(self.sub(ctx, &from)?)),
            Op::Subdir { dir } => {
                let base = fs.state().def.clone();
                Ok(fs.set(State::scratch().file(FileAction::Copy {
                    src: Box::new(base),
                    src_path: dir,
                    dest: String::from("/"),
                    contents_only: true,
                    create_dest_path: true,
                    allow_wildcard: false,
                })))
            }
            Op::Workdir { path } => Ok(fs.change(|st| st.with_dir(path))),
            Op::Mkdir { path, dir, mode } => Ok(fs.change(|st| {
                let st = match dir {
                    Some(dir) => st.with_dir(dir),
                    None => st,
                };
                let path = join_path(&st.meta.dir, &path);
                st.file(FileAction::Mkdir {
                    path,
                    mode,
                    make_parents: true,
                })
            })),
            Op::Mkfile {
                dest,
                content,
                mode,
            } => Ok(fs.change(|st| {
                let path = join_path(&st.meta.dir, &dest);
                st.file(FileAction::Mkfile {
                    path,
                    mode,
                    content,
                })
            })),
            Op::Rm {
                path,
                allow_not_found,
            } => Ok(fs.change(|st| {
                let path = join_path(&st.meta.dir, &path);
                st.file(FileAction::Rm {
                    path,
                    allow_not_found,
                })
            })),
        }
    }

    /// Evaluates a nested script in isolation and returns its final state.
    fn sub(&self, ctx: &Context, from: &Value) -> Result<State, EngineError> {
        let mut tmp = self.tmp(format!("{}/{}", self.name, from.path()));
        tmp.run(ctx, from)?;
        Ok(tmp.fs.state().clone())
    }

    fn exec(&self, ctx: &Context, value: &Value, exec: Exec) -> Result<FS, EngineError> {
        let state = self.fs.state();

        let mut env = state.meta.env.clone();
        env.extend(exec.env);
        if exec.always || self.config.no_cache {
            env.insert(
                String::from(CACHE_BUSTER_ENV),
                ulid::Ulid::new().to_string(),
            );
        }

        let mut mounts = Vec::with_capacity(exec.mounts.len());
        for (dest, mount) in exec.mounts {
            let source = match mount {
                Mount::Cache => MountSource::Cache {
                    id: value
                        .lookup_path(&Path::root().child("mount").child(dest.as_str()))
                        .canonical_path()
                        .to_string(),
                },
                Mount::Tmpfs => MountSource::Tmpfs,
                Mount::From { from, path } => MountSource::State {
                    def: self.sub(ctx, &from)?.def,
                    path,
                },
            };
            mounts.push(MountDef { dest, source });
        }

        let def = ExecDef {
            root: state.def.clone(),
            args: exec.args,
            env,
            dir: match exec.dir {
                Some(dir) => join_path(&state.meta.dir, &dir),
                None => state.meta.dir.clone(),
            },
            user: exec.user.or_else(|| state.meta.user.clone()),
            hosts: exec.hosts,
            network: exec.network,
            privileged: exec.privileged,
            mounts,
        };

        Ok(self.fs.change(|st| st.run(def)))
    }

    fn export(&self, ctx: &Context, source: &str, format: ExportFormat) -> Result<FS, EngineError> {
        let contents = self.fs.read_file(ctx, source)?;

        let failed = |message: String| EngineError::Export {
            source_path: source.to_string(),
            message,
        };

        let node = match format {
            ExportFormat::String => Node::string(String::from_utf8_lossy(&contents)),
            ExportFormat::Json => {
                let data: serde_json::Value =
                    serde_json::from_slice(&contents).map_err(|e| failed(e.to_string()))?;
                Node::try_from_data(data, &Path::root()).map_err(|e| failed(e.to_string()))?
            }
            ExportFormat::Yaml => {
                let data: serde_json::Value =
                    serde_yaml::from_slice(&contents).map_err(|e| failed(e.to_string()))?;
                Node::try_from_data(data, &Path::root()).map_err(|e| failed(e.to_string()))?
            }
        };

        self.sink.fill(node)?;
        Ok(self.fs.clone())
    }

    fn fetch_container(&self, ctx: &Context, reference: &str) -> Result<FS, EngineError> {
        let reference = normalize_image_ref(reference);
        let config = self.solver.resolve_image_config(ctx, &reference)?;

        let mut state = State::image(reference.as_str());
        for (key, value) in config.env_pairs() {
            state = state.with_env(key, value);
        }
        if let Some(dir) = config.working_dir.filter(|dir| !dir.is_empty()) {
            state = state.with_dir(dir);
        }
        if let Some(user) = config.user.filter(|user| !user.is_empty()) {
            state = state.with_user(user);
        }

        tracing::debug!(reference = %reference, "fetch container");
        Ok(self.fs.set(state))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::{FsError, ValueError};
    use crate::solver::memory::Snapshot;
    use crate::solver::{ImageConfig, MemorySolver};

    /// Sink remembering every filled node.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<Node>>);

    impl Fillable for Recorder {
        fn fill(&self, node: Node) -> Result<(), ValueError> {
            self.0.lock().unwrap().push(node);
            Ok(())
        }
    }

    fn pipeline(solver: Arc<MemorySolver>, sink: Arc<dyn Fillable>) -> Pipeline {
        Pipeline::new("test", solver, sink, Arc::new(Config::default()))
    }

    fn script(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[test]
    fn test_export_json_and_string() {
        let solver = Arc::new(MemorySolver::new());
        let sink = Arc::new(Recorder::default());
        let mut p = pipeline(solver, sink.clone());

        let ops = script(serde_json::json!([
            {"do": "mkfile", "dest": "/out.json", "content": "{\"a\":1}"},
            {"do": "export", "source": "/out.json", "format": "json"},
            {"do": "mkfile", "dest": "/out.txt", "content": "hello"},
            {"do": "export", "source": "/out.txt", "format": "string"},
        ]));
        p.run(&Context::new(), &ops).unwrap();

        let filled = sink.0.lock().unwrap();
        assert_eq!(
            *filled,
            vec![
                Node::structure([("a", Node::int(1))]),
                Node::string("hello")
            ]
        );
    }

    #[test]
    fn test_export_yaml_scalar() {
        let solver = Arc::new(MemorySolver::new());
        let sink = Arc::new(Recorder::default());
        let mut p = pipeline(solver, sink.clone());

        let ops = script(serde_json::json!([
            {"do": "mkfile", "dest": "/v.yaml", "content": "42\n"},
            {"do": "export", "source": "/v.yaml", "format": "yaml"},
        ]));
        p.run(&Context::new(), &ops).unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![Node::int(42)]);
    }

    #[test]
    fn test_export_rejects_oversized_integer() {
        let solver = Arc::new(MemorySolver::new());
        let sink = Arc::new(Recorder::default());
        let mut p = pipeline(solver, sink.clone());

        let ops = script(serde_json::json!([
            {"do": "mkfile", "dest": "/n.json", "content": "{\"n\": [18446744073709551615]}"},
            {"do": "export", "source": "/n.json", "format": "json"},
        ]));
        let err = p.run(&Context::new(), &ops).unwrap_err();
        assert!(matches!(err.root_cause(), EngineError::Export { message, .. } if message.contains("n[0]")));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_export_on_scratch_is_not_exist() {
        let mut p = pipeline(Arc::new(MemorySolver::new()), Arc::new(Discard));
        let ops = script(serde_json::json!({"do": "export", "source": "/nope"}));

        let err = p.run(&Context::new(), &ops).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            EngineError::Fs(FsError::NotExist(_))
        ));
    }

    #[test]
    fn test_exec_dispatch() {
        let solver = Arc::new(MemorySolver::new().with_exec(|req| {
            req.root.write_file("/out", req.args.join(" "), 0o644);
            Ok(())
        }));
        let mut p = pipeline(solver.clone(), Arc::new(Discard));

        let ops = script(serde_json::json!({"do": "exec", "args": ["echo", "hi"]}));
        p.run(&Context::new(), &ops).unwrap();

        assert_eq!(solver.exec_log(), vec![vec!["echo".to_string(), "hi".to_string()]]);
        assert_eq!(p.fs().read_file(&Context::new(), "/out").unwrap(), b"echo hi");
    }

    #[test]
    fn test_always_busts_cache() {
        let solver = Arc::new(MemorySolver::new());
        let ops = script(serde_json::json!({"do": "exec", "args": ["date"], "always": true}));

        for _ in 0..2 {
            let mut p = pipeline(solver.clone(), Arc::new(Discard));
            p.run(&Context::new(), &ops).unwrap();
        }
        assert_eq!(solver.exec_count(), 2);

        let plain = script(serde_json::json!({"do": "exec", "args": ["date"]}));
        for _ in 0..2 {
            let mut p = pipeline(solver.clone(), Arc::new(Discard));
            p.run(&Context::new(), &plain).unwrap();
        }
        assert_eq!(solver.exec_count(), 3);
    }

    #[test]
    fn test_incomplete_op_aborts() {
        let solver = Arc::new(MemorySolver::new());
        let mut p = pipeline(solver.clone(), Arc::new(Discard));

        let ops = Value::new(Node::list([
            Node::structure([
                ("do", Node::string("mkfile")),
                ("dest", Node::string("/a")),
                ("content", Node::string("1")),
            ]),
            Node::structure([
                ("do", Node::string("mkfile")),
                ("dest", Node::string("/b")),
                ("content", Node::reference("missing")),
            ]),
        ]));

        let err = p.run(&Context::new(), &ops).unwrap_err();
        assert!(matches!(err, EngineError::Abort));
        assert_eq!(p.fs().read_file(&Context::new(), "/a").unwrap(), b"1");
    }

    #[test]
    fn test_bogus_op_is_schema_error() {
        let mut p = pipeline(Arc::new(MemorySolver::new()), Arc::new(Discard));
        let ops = script(serde_json::json!([{"do": "bogus"}]));

        let err = p.run(&Context::new(), &ops).unwrap_err();
        assert!(err.is_schema());
        assert!(matches!(err, EngineError::Op { index: 0, .. }));
    }

    #[test]
    fn test_fetch_container_applies_image_config() {
        let config = ImageConfig {
            env: vec!["PATH=/usr/bin".into()],
            working_dir: Some("/work".into()),
            user: Some("nobody".into()),
        };
        let solver = Arc::new(MemorySolver::new().with_image(
            "alpine",
            Snapshot::new().with_file("/etc/os-release", "alpine"),
            config,
        ));
        let mut p = pipeline(solver.clone(), Arc::new(Discard));

        let ops = script(serde_json::json!([
            {"do": "fetch-container", "ref": "alpine"},
            {"do": "exec", "args": ["true"]},
        ]));
        p.run(&Context::new(), &ops).unwrap();

        let Def::Exec(exec) = &p.fs().state().def else {
            panic!("expected exec");
        };
        assert_eq!(exec.dir, "/work");
        assert_eq!(exec.user.as_deref(), Some("nobody"));
        assert_eq!(exec.env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(
            exec.root,
            Def::Image {
                reference: "docker.io/library/alpine:latest".into()
            }
        );
    }

    #[test]
    fn test_copy_from_nested_script() {
        let solver = Arc::new(MemorySolver::new());
        let sink = Arc::new(Recorder::default());
        let mut p = pipeline(solver, sink.clone());

        let ops = script(serde_json::json!([
            {"do": "copy", "from": [
                {"do": "mkfile", "dest": "/lib.txt", "content": "lib"},
                {"do": "mkfile", "dest": "/x.json", "content": "1"},
                {"do": "export", "source": "/x.json", "format": "json"},
            ], "dest": "/vendor"},
        ]));
        p.run(&Context::new(), &ops).unwrap();

        assert_eq!(p.fs().read_file(&Context::new(), "/vendor/lib.txt").unwrap(), b"lib");
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nested_failure_keeps_outer_path() {
        let solver = Arc::new(MemorySolver::new().with_exec(|_| Err("exit code: 1".into())));
        let mut p = pipeline(solver, Arc::new(Discard));

        let ops = Value::new(Node::structure([(
            "build",
            Node::structure::<&str>([]).with_field(
                "#up",
                Node::from_data(serde_json::json!([
                    {"do": "load", "from": [{"do": "exec", "args": ["false"]}]},
                ])),
            ),
        )]));

        let err = p.run(&Context::new(), &ops.lookup("build")).unwrap_err();
        let paths: Vec<String> = err.paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["build", "build.#up[0].from"]);
        assert!(err.to_string().contains("exit code: 1"));
    }

    #[test]
    fn test_mkdir_relative_to_workdir() {
        let mut p = pipeline(Arc::new(MemorySolver::new()), Arc::new(Discard));
        let ops = script(serde_json::json!([
            {"do": "workdir", "path": "/src"},
            {"do": "mkdir", "path": "pkg", "dir": "app"},
            {"do": "mkfile", "dest": "/src/app/pkg/f", "content": "x"},
            {"do": "rm", "path": "missing", "allowNotFound": true},
        ]));
        p.run(&Context::new(), &ops).unwrap();

        assert_eq!(p.fs().state().meta.dir, "/src/app");
        assert_eq!(
            p.fs().read_file(&Context::new(), "/src/app/pkg/f").unwrap(),
            b"x"
        );
    }

    #[test]
    fn test_canceled() {
        let mut p = pipeline(Arc::new(MemorySolver::new()), Arc::new(Discard));
        let ctx = Context::new();
        ctx.cancel();
        let ops = script(serde_json::json!({"do": "mkdir", "path": "/a"}));
        assert!(p.run(&ctx, &ops).unwrap_err().is_canceled());
    }
}
