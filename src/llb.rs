//! Build-graph descriptions.
//!
//! A [`State`] is an opaque, immutable description of a filesystem the solver
//! can realize. The engine only ever builds these incrementally and hands them
//! over; it never interprets them. Serialization is canonical: maps are
//! ordered and no field depends on hashing order or time, so identical graphs
//! always marshal to identical bytes.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::Hash32;
use crate::op::{Entitlement, Network};

/// One vertex of the build graph together with everything below it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Def {
    Scratch,
    Image {
        reference: String,
    },
    Git {
        remote: String,
        reference: String,
        keep_git_dir: bool,
    },
    Http {
        url: String,
        checksum: Option<String>,
        filename: Option<String>,
        mode: Option<u32>,
    },
    Local {
        dir: String,
        include: Vec<String>,
        exclude: Vec<String>,
    },
    Exec(Box<ExecDef>),
    File {
        base: Box<Def>,
        actions: Vec<FileAction>,
    },
    /// Layers applied in order, later ones winning.
    Merge {
        inputs: Vec<Def>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecDef {
    pub root: Def,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub dir: String,
    pub user: Option<String>,
    pub hosts: BTreeMap<String, String>,
    pub network: Network,
    pub privileged: bool,
    pub mounts: Vec<MountDef>,
}

impl ExecDef {
    pub fn entitlements(&self) -> Vec<Entitlement> {
        let mut out = Vec::new();
        if self.network == Network::Host {
            out.push(Entitlement::NetworkHost);
        }
        if self.privileged {
            out.push(Entitlement::SecurityInsecure);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MountDef {
    pub dest: String,
    pub source: MountSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MountSource {
    State { def: Def, path: Option<String> },
    /// Persistent across executions, shared by id.
    Cache { id: String },
    Tmpfs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum FileAction {
    Mkdir {
        path: String,
        mode: u32,
        make_parents: bool,
    },
    Mkfile {
        path: String,
        mode: u32,
        content: String,
    },
    Rm {
        path: String,
        allow_not_found: bool,
    },
    Copy {
        src: Box<Def>,
        src_path: String,
        dest: String,
        contents_only: bool,
        create_dest_path: bool,
        allow_wildcard: bool,
    },
}

/// Process metadata carried alongside a graph: defaults for later execs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    pub dir: String,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            dir: String::from("/"),
            env: BTreeMap::new(),
            user: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct State {
    pub def: Def,
    pub meta: Meta,
}

impl Default for Def {
    fn default() -> Self {
        Def::Scratch
    }
}

impl Def {
    /// Canonical bytes of the description.
    pub fn marshal(&self) -> Vec<u8> {
        // Only string-keyed maps and plain data: serialization is total.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn digest(&self) -> Hash32 {
        Hash32::hash(self.marshal())
    }
}

impl State {
    pub fn scratch() -> Self {
        Self::default()
    }

    pub fn from_def(def: Def) -> Self {
        Self {
            def,
            meta: Meta::default(),
        }
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self::from_def(Def::Image {
            reference: reference.into(),
        })
    }

    pub fn is_scratch(&self) -> bool {
        self.def == Def::Scratch
    }

    pub fn marshal(&self) -> Vec<u8> {
        self.def.marshal()
    }

    pub fn digest(&self) -> Hash32 {
        self.def.digest()
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.meta.dir = join_path(&self.meta.dir, &dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.env.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.meta.user = Some(user.into());
        self
    }

    /// Appends a file action, batching it onto an existing file vertex.
    pub fn file(self, action: FileAction) -> Self {
        let def = match self.def {
            Def::File { base, mut actions } => {
                actions.push(action);
                Def::File { base, actions }
            }
            other => Def::File {
                base: Box::new(other),
                actions: vec![action],
            },
        };
        Self {
            def,
            meta: self.meta,
        }
    }

    /// Layers `other` on top of this filesystem.
    pub fn merge(self, other: Def) -> Self {
        let def = match self.def {
            Def::Scratch => other,
            Def::Merge { mut inputs } => {
                inputs.push(other);
                Def::Merge { inputs }
            }
            base => Def::Merge {
                inputs: vec![base, other],
            },
        };
        Self {
            def,
            meta: self.meta,
        }
    }

    /// Runs a process on top of this state; the result is its root filesystem.
    pub fn run(self, exec: ExecDef) -> Self {
        Self {
            def: Def::Exec(Box::new(exec)),
            meta: self.meta,
        }
    }
}

/// Resolves `path` against `base` the way a working directory does.
pub fn join_path(base: &str, path: &str) -> String {
    let joined = match path.starts_with('/') {
        true => camino::Utf8PathBuf::from(path),
        false => camino::Utf8Path::new(base).join(path),
    };
    crate::utils::normalize_path(&joined)
}
