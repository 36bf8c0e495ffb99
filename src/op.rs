//! Operations: typed, schema-checked actions decoded from document nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, SchemaError, ValueError};
use crate::value::{FieldSchema, Schema, Value};

/// Elevated capability an operation needs from the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entitlement {
    #[serde(rename = "network.host")]
    NetworkHost,
    #[serde(rename = "security.insecure")]
    SecurityInsecure,
}

impl Display for Entitlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entitlement::NetworkHost => f.write_str("network.host"),
            Entitlement::SecurityInsecure => f.write_str("security.insecure"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Sandbox,
    Host,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    String,
    Json,
    Yaml,
}

#[derive(Clone, Debug)]
pub enum Mount {
    Cache,
    Tmpfs,
    /// Result of a nested script, optionally narrowed to a sub-path.
    From { from: Value, path: Option<String> },
}

#[derive(Clone, Debug)]
pub struct Exec {
    pub args: Vec<String>,
    /// Falls back to the working directory of the current state.
    pub dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub always: bool,
    pub hosts: BTreeMap<String, String>,
    pub user: Option<String>,
    pub network: Network,
    pub privileged: bool,
    pub mounts: Vec<(String, Mount)>,
}

impl Exec {
    pub fn entitlements(&self) -> BTreeSet<Entitlement> {
        let mut out = BTreeSet::new();
        if self.network == Network::Host {
            out.insert(Entitlement::NetworkHost);
        }
        if self.privileged {
            out.insert(Entitlement::SecurityInsecure);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchHttp {
    pub url: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Clone, Debug)]
pub enum Op {
    Copy {
        from: Value,
        src: String,
        dest: String,
    },
    Exec(Exec),
    Export {
        source: String,
        format: ExportFormat,
    },
    FetchContainer {
        reference: String,
    },
    FetchGit {
        remote: String,
        reference: String,
        keep_git_dir: bool,
    },
    FetchHttp(FetchHttp),
    Local {
        dir: String,
        include: Vec<String>,
        exclude: Vec<String>,
    },
    Load {
        from: Value,
    },
    Subdir {
        dir: String,
    },
    Workdir {
        path: String,
    },
    Mkdir {
        path: String,
        dir: Option<String>,
        mode: u32,
    },
    Mkfile {
        dest: String,
        content: String,
        mode: u32,
    },
    Rm {
        path: String,
        allow_not_found: bool,
    },
}

fn strings() -> Schema {
    Schema::list(Schema::String)
}

fn string_map() -> Schema {
    Schema::map(Schema::String)
}

fn variant(fields: Vec<FieldSchema>) -> Schema {
    let mut all = vec![FieldSchema::required("do", Schema::String)];
    all.extend(fields);
    Schema::closed(all)
}

/// Every operation variant, discriminated by `do`.
pub static OP_SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
    use FieldSchema as F;

    let mount = Schema::Either(vec![
        Schema::one_of(&["cache", "tmpfs"]),
        Schema::closed(vec![
            F::required("from", Schema::Script),
            F::optional("path", Schema::String),
        ]),
    ]);

    let variants = [
        (
            "copy",
            variant(vec![
                F::required("from", Schema::Script),
                F::optional("src", Schema::String),
                F::optional("dest", Schema::String),
            ]),
        ),
        (
            "exec",
            variant(vec![
                F::required("args", strings()),
                F::optional("dir", Schema::String),
                F::optional("env", string_map()),
                F::optional("always", Schema::Bool),
                F::optional("hosts", string_map()),
                F::optional("user", Schema::String),
                F::optional("network", Schema::one_of(&["sandbox", "host"])),
                F::optional("privileged", Schema::Bool),
                F::optional("mount", Schema::map(mount)),
            ]),
        ),
        (
            "export",
            variant(vec![
                F::required("source", Schema::String),
                F::optional("format", Schema::one_of(&["string", "json", "yaml"])),
            ]),
        ),
        ("fetch-container", variant(vec![F::required("ref", Schema::String)])),
        (
            "fetch-git",
            variant(vec![
                F::required("remote", Schema::String),
                F::required("ref", Schema::String),
                F::optional("keepGitDir", Schema::Bool),
            ]),
        ),
        (
            "fetch-http",
            variant(vec![
                F::required("url", Schema::String),
                F::optional("checksum", Schema::String),
                F::optional("filename", Schema::String),
                F::optional("mode", Schema::Int),
            ]),
        ),
        (
            "local",
            variant(vec![
                F::required("dir", Schema::String),
                F::optional("include", strings()),
                F::optional("exclude", strings()),
            ]),
        ),
        ("load", variant(vec![F::required("from", Schema::Script)])),
        ("subdir", variant(vec![F::required("dir", Schema::String)])),
        ("workdir", variant(vec![F::required("path", Schema::String)])),
        (
            "mkdir",
            variant(vec![
                F::required("path", Schema::String),
                F::optional("dir", Schema::String),
                F::optional("mode", Schema::Int),
            ]),
        ),
        (
            "mkfile",
            variant(vec![
                F::required("dest", Schema::String),
                F::required("content", Schema::String),
                F::optional("mode", Schema::Int),
            ]),
        ),
        (
            "rm",
            variant(vec![
                F::required("path", Schema::String),
                F::optional("allowNotFound", Schema::Bool),
            ]),
        ),
    ];

    Schema::Union {
        tag: String::from("do"),
        variants: variants
            .into_iter()
            .map(|(name, schema)| (name.to_string(), schema))
            .collect(),
    }
});

fn opt_str(op: &Value, field: &str) -> Result<Option<String>, ValueError> {
    let value = op.lookup(field);
    match value.exists() {
        true => value.as_str().map(Some),
        false => Ok(None),
    }
}

fn opt_bool(op: &Value, field: &str) -> Result<bool, ValueError> {
    let value = op.lookup(field);
    match value.exists() {
        true => value.as_bool(),
        false => Ok(false),
    }
}

fn opt_mode(op: &Value, default: u32) -> Result<u32, EngineError> {
    let value = op.lookup("mode");
    if !value.exists() {
        return Ok(default);
    }
    let mode = value.as_i64()?;
    u32::try_from(mode)
        .map_err(|_| SchemaError::new(value.path(), format!("invalid file mode {mode}")).into())
}

fn str_list(op: &Value, field: &str) -> Result<Vec<String>, ValueError> {
    let value = op.lookup(field);
    if !value.exists() {
        return Ok(Vec::new());
    }
    value.list()?.iter().map(Value::as_str).collect()
}

fn str_map(op: &Value, field: &str) -> Result<BTreeMap<String, String>, ValueError> {
    let value = op.lookup(field);
    if !value.exists() {
        return Ok(BTreeMap::new());
    }
    value
        .fields()?
        .into_iter()
        .map(|field| Ok((field.label, field.value.as_str()?)))
        .collect()
}

impl Op {
    /// Validates `value` against the operation schemas and decodes it.
    pub fn decode(value: &Value) -> Result<Op, EngineError> {
        value.validate(&[&OP_SCHEMA])?;

        let kind = value.lookup("do").as_str()?;
        let op = match kind.as_str() {
            "copy" => Op::Copy {
                from: value.lookup("from"),
                src: opt_str(value, "src")?.unwrap_or_else(|| String::from("/")),
                dest: opt_str(value, "dest")?.unwrap_or_else(|| String::from("/")),
            },
            "exec" => Op::Exec(Self::decode_exec(value)?),
            "export" => Op::Export {
                source: value.lookup("source").as_str()?,
                format: match opt_str(value, "format")?.as_deref() {
                    Some("json") => ExportFormat::Json,
                    Some("yaml") => ExportFormat::Yaml,
                    _ => ExportFormat::String,
                },
            },
            "fetch-container" => Op::FetchContainer {
                reference: value.lookup("ref").as_str()?,
            },
            "fetch-git" => Op::FetchGit {
                remote: value.lookup("remote").as_str()?,
                reference: value.lookup("ref").as_str()?,
                keep_git_dir: opt_bool(value, "keepGitDir")?,
            },
            "fetch-http" => Op::FetchHttp(value.decode()?),
            "local" => Op::Local {
                dir: value.lookup("dir").as_str()?,
                include: str_list(value, "include")?,
                exclude: str_list(value, "exclude")?,
            },
            "load" => Op::Load {
                from: value.lookup("from"),
            },
            "subdir" => Op::Subdir {
                dir: value.lookup("dir").as_str()?,
            },
            "workdir" => Op::Workdir {
                path: value.lookup("path").as_str()?,
            },
            "mkdir" => Op::Mkdir {
                path: value.lookup("path").as_str()?,
                dir: opt_str(value, "dir")?,
                mode: opt_mode(value, 0o755)?,
            },
            "mkfile" => Op::Mkfile {
                dest: value.lookup("dest").as_str()?,
                content: value.lookup("content").as_str()?,
                mode: opt_mode(value, 0o644)?,
            },
            "rm" => Op::Rm {
                path: value.lookup("path").as_str()?,
                allow_not_found: opt_bool(value, "allowNotFound")?,
            },
            other => {
                return Err(SchemaError::new(
                    &value.path().child("do"),
                    format!("unknown do {other:?}"),
                )
                .into());
            }
        };

        Ok(op)
    }

    fn decode_exec(value: &Value) -> Result<Exec, EngineError> {
        let mut mounts = Vec::new();
        let mount = value.lookup("mount");
        if mount.exists() {
            for field in mount.fields()? {
                let source = match field.value.as_str() {
                    Ok(kind) if kind == "cache" => Mount::Cache,
                    Ok(kind) if kind == "tmpfs" => Mount::Tmpfs,
                    Ok(kind) => {
                        return Err(SchemaError::new(
                            field.value.path(),
                            format!("invalid mount source {kind:?}"),
                        )
                        .into());
                    }
                    Err(_) => Mount::From {
                        from: field.value.lookup("from"),
                        path: opt_str(&field.value, "path")?,
                    },
                };
                mounts.push((field.label, source));
            }
        }

        Ok(Exec {
            args: str_list(value, "args")?,
            dir: opt_str(value, "dir")?,
            env: str_map(value, "env")?,
            always: opt_bool(value, "always")?,
            hosts: str_map(value, "hosts")?,
            user: opt_str(value, "user")?,
            network: match opt_str(value, "network")?.as_deref() {
                Some("host") => Network::Host,
                _ => Network::Sandbox,
            },
            privileged: opt_bool(value, "privileged")?,
            mounts,
        })
    }

    /// The `do` name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Copy { .. } => "copy",
            Op::Exec(_) => "exec",
            Op::Export { .. } => "export",
            Op::FetchContainer { .. } => "fetch-container",
            Op::FetchGit { .. } => "fetch-git",
            Op::FetchHttp(_) => "fetch-http",
            Op::Local { .. } => "local",
            Op::Load { .. } => "load",
            Op::Subdir { .. } => "subdir",
            Op::Workdir { .. } => "workdir",
            Op::Mkdir { .. } => "mkdir",
            Op::Mkfile { .. } => "mkfile",
            Op::Rm { .. } => "rm",
        }
    }
}

/// Strips userinfo from a URL before it is logged.
pub(crate) fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://xxxxx@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// Expands short image names the way registries resolve them:
/// `alpine` becomes `docker.io/library/alpine:latest`.
pub(crate) fn normalize_image_ref(reference: &str) -> String {
    let (name, digest) = match reference.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (reference, None),
    };

    let (domain, remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (String::from("docker.io"), name.to_string()),
        None => (String::from("docker.io"), format!("library/{name}")),
    };

    let last = remainder.rsplit('/').next().unwrap_or(&remainder);
    let tagged = if digest.is_none() && !last.contains(':') {
        format!("{remainder}:latest")
    } else {
        remainder
    };

    match digest {
        Some(digest) => format!("{domain}/{tagged}@{digest}"),
        None => format!("{domain}/{tagged}"),
    }
}
