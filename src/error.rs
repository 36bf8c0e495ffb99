use std::sync::Arc;

use thiserror::Error;

use crate::value::Path;

fn at(path: &Path) -> String {
    if path.is_root() {
        String::from("<root>")
    } else {
        path.to_string()
    }
}

/// Errors raised by the document model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    /// Two concrete values disagree.
    #[error("{}: conflicting values {left} and {right}", at(.path))]
    Conflict {
        path: Path,
        left: String,
        right: String,
    },

    #[error("{}: incomplete value", at(.path))]
    Incomplete { path: Path },

    #[error("{}: not found", at(.path))]
    NotFound { path: Path },

    #[error("{}: expected {expected}, found {found}", at(.path))]
    WrongKind {
        path: Path,
        expected: &'static str,
        found: String,
    },

    #[error("{}: cannot decode value: {message}", at(.path))]
    Decode { path: Path, message: String },
}

impl ValueError {
    pub fn path(&self) -> &Path {
        match self {
            ValueError::Conflict { path, .. }
            | ValueError::Incomplete { path }
            | ValueError::NotFound { path }
            | ValueError::WrongKind { path, .. }
            | ValueError::Decode { path, .. } => path,
        }
    }
}

/// A value does not match the shape an operation or component requires.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{}: {message}", at(.path))]
pub struct SchemaError {
    pub path: Path,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: &Path, message: impl Into<String>) -> Self {
        Self {
            path: path.clone(),
            message: message.into(),
        }
    }
}

/// Failures reported by the external graph solver.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    /// The message is already stripped of transport noise.
    #[error("{0}")]
    Failed(String),

    #[error("solve canceled")]
    Canceled,

    #[error("not granted: {0}")]
    NotGranted(String),
}

/// Errors raised while reading a realized filesystem.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FsError {
    /// Legitimate absence, e.g. a read against a scratch filesystem.
    #[error("{0}: no such file or directory")]
    NotExist(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),

    #[error(transparent)]
    Solve(#[from] SolveError),
}

impl FsError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, FsError::NotExist(_))
    }
}

/// Errors surfaced by pipelines, the scheduler and the layered state.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// A script is not concrete yet; try again once dependencies settle.
    #[error("execution aborted: missing inputs")]
    Abort,

    #[error("execution canceled")]
    Canceled,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("export {source_path}: {message}")]
    Export {
        source_path: String,
        message: String,
    },

    #[error("entitlements not granted: {}", .0.join(", "))]
    Entitlement(Vec<String>),

    #[error("task panicked: {0}")]
    Panic(String),

    #[error("{}: op #{index}: {source}", at(.path))]
    Op {
        path: Path,
        index: usize,
        source: Box<EngineError>,
    },

    #[error("task {}:\n{source}", at(.path))]
    Task {
        path: Path,
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Shared(Arc<EngineError>),
}

impl EngineError {
    pub(crate) fn at_op(self, path: &Path, index: usize) -> Self {
        match self {
            EngineError::Abort | EngineError::Canceled => self,
            source => EngineError::Op {
                path: path.clone(),
                index,
                source: Box::new(source),
            },
        }
    }

    pub(crate) fn in_task(self, path: &Path) -> Self {
        match self {
            EngineError::Abort | EngineError::Canceled => self,
            source => EngineError::Task {
                path: path.clone(),
                source: Box::new(source),
            },
        }
    }

    /// The innermost error, with every path annotation peeled off.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::Op { source, .. } | EngineError::Task { source, .. } => {
                source.root_cause()
            }
            EngineError::Shared(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Incomplete inputs, never a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self.root_cause(), EngineError::Abort)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self.root_cause(),
            EngineError::Canceled
                | EngineError::Solve(SolveError::Canceled)
                | EngineError::Fs(FsError::Solve(SolveError::Canceled))
        )
    }

    pub fn is_schema(&self) -> bool {
        matches!(self.root_cause(), EngineError::Schema(_))
    }

    /// Every path annotation from the outermost to the innermost.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            EngineError::Op { path, source, .. } | EngineError::Task { path, source } => {
                let mut paths = vec![path];
                paths.extend(source.paths());
                paths
            }
            EngineError::Shared(inner) => inner.paths(),
            EngineError::Schema(err) => vec![&err.path],
            EngineError::Value(err) => vec![err.path()],
            _ => vec![],
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{name}: {source}")]
    Syntax {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{name}: {message}")]
    Invalid { name: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse config file.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_chain_through_nested_ops() {
        let inner = EngineError::Solve(SolveError::Failed("exit code 1".into()))
            .at_op(&Path::parse("build.#up[0].from.#up[1]"), 1);
        let outer = inner.at_op(&Path::parse("build.#up[0]"), 0);
        let task = outer.in_task(&Path::parse("build"));

        let paths: Vec<String> = task.paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            paths,
            vec!["build", "build.#up[0]", "build.#up[0].from.#up[1]"]
        );
        assert!(matches!(
            task.root_cause(),
            EngineError::Solve(SolveError::Failed(_))
        ));
    }

    #[test]
    fn test_abort_is_never_wrapped() {
        let err = EngineError::Abort.at_op(&Path::parse("a"), 0).in_task(&Path::parse("a"));
        assert!(matches!(err, EngineError::Abort));
        assert!(err.is_abort());
    }

    #[test]
    fn test_canceled_solve() {
        let err = EngineError::from(FsError::Solve(SolveError::Canceled));
        assert!(err.is_canceled());
    }
}
