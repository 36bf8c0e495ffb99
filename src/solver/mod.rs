//! The external collaborator realizing build graphs into filesystems.

pub mod memory;

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{FsError, SolveError};
use crate::llb::State;
use crate::op::Entitlement;

pub use memory::MemorySolver;

/// Entry returned by [`Reference::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub mode: u32,
    pub size: u64,
}

/// A realized filesystem.
pub trait Reference: Send + Sync + Debug {
    /// Reads a whole file, or only `range` of it.
    fn read_file(&self, path: &str, range: Option<Range<usize>>) -> Result<Vec<u8>, FsError>;

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
}

/// Process defaults shipped with a container image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl ImageConfig {
    /// `KEY=value` pairs; a bare `KEY` maps to the empty string.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .map(|entry| entry.split_once('=').unwrap_or((entry.as_str(), "")))
    }
}

/// Capabilities declared before evaluation starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grants {
    pub entitlements: BTreeSet<Entitlement>,
    pub local_dirs: BTreeSet<String>,
}

pub trait Solver: Send + Sync {
    /// Realizes a graph. Must abort promptly once `ctx` is canceled.
    fn solve(&self, ctx: &Context, state: &State) -> Result<Arc<dyn Reference>, SolveError>;

    fn resolve_image_config(&self, ctx: &Context, reference: &str)
    -> Result<ImageConfig, SolveError>;

    /// Upfront declaration of entitlements and host directories.
    fn grant(&self, _grants: &Grants) {}
}

const NOISE: &[&str] = &[
    "executor failed running ",
    "buildkit-runc did not terminate successfully",
    "rpc error: code = Unknown desc = ",
    "failed to solve: ",
];

/// Removes transport and runtime wrapper text from a solver message.
pub fn clean_error(message: &str) -> String {
    let mut out = message.to_string();
    for noise in NOISE {
        out = out.replace(noise, "");
    }
    out.trim().to_string()
}

impl SolveError {
    /// A failure with its message already cleaned.
    pub fn failed(message: impl AsRef<str>) -> Self {
        SolveError::Failed(clean_error(message.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_error() {
        let raw = "failed to solve: rpc error: code = Unknown desc = executor failed running [/bin/sh -c false]: exit code: 1";
        assert_eq!(clean_error(raw), "[/bin/sh -c false]: exit code: 1");
        assert_eq!(
            SolveError::failed("buildkit-runc did not terminate successfully"),
            SolveError::Failed(String::new())
        );
    }

    #[test]
    fn test_image_env_pairs() {
        let config = ImageConfig {
            env: vec!["PATH=/bin:/usr/bin".into(), "EMPTY".into(), "A=b=c".into()],
            ..Default::default()
        };
        let pairs: Vec<_> = config.env_pairs().collect();
        assert_eq!(pairs, vec![("PATH", "/bin:/usr/bin"), ("EMPTY", ""), ("A", "b=c")]);
    }
}
