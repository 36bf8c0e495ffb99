//! In-process solver realizing build graphs into in-memory snapshots.
//!
//! Images, git repositories and http blobs are registered up front; local
//! directories come from registrations or from the host filesystem. Exec
//! vertices run through a pluggable handler that edits the root snapshot and
//! the mounts directly.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::context::Context;
use crate::core::Hash32;
use crate::error::{FsError, SolveError};
use crate::llb::{Def, ExecDef, FileAction, MountSource, State};
use crate::op::normalize_image_ref;
use crate::solver::{DirEntry, Grants, ImageConfig, Reference, Solver};
use crate::utils::normalize_path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    File { content: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
}

/// A realized filesystem: absolute normalized paths to entries. The root
/// directory always exists implicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

fn norm(path: &str) -> String {
    normalize_path(Utf8Path::new(path))
}

fn parent_of(path: &str) -> Option<String> {
    Utf8Path::new(path).parent().map(|p| p.as_str().to_string())
}

fn child_of(dir: &str, path: &str) -> Option<String> {
    let rest = match dir {
        "/" => path.strip_prefix('/')?,
        _ => path.strip_prefix(dir)?.strip_prefix('/')?,
    };
    (!rest.is_empty()).then(|| rest.to_string())
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Snapshot::write_file`].
    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.write_file(path, content, 0o644);
        self
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(&norm(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = norm(path);
        path == "/" || matches!(self.entries.get(&path), Some(Entry::Dir { .. }))
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = norm(path);
        path == "/" || self.entries.contains_key(&path)
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        match self.get(path) {
            Some(Entry::File { content, .. }) => Some(content),
            _ => None,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn create_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(dir) = current {
            if dir == "/" || self.is_dir(&dir) {
                break;
            }
            current = parent_of(&dir);
            missing.push(dir);
        }
        for dir in missing {
            self.entries.insert(dir, Entry::Dir { mode: 0o755 });
        }
    }

    /// Writes a file, creating missing parent directories.
    pub fn write_file(&mut self, path: &str, content: impl Into<Vec<u8>>, mode: u32) {
        let path = norm(path);
        self.create_parents(&path);
        self.entries.insert(
            path,
            Entry::File {
                content: content.into(),
                mode,
            },
        );
    }

    pub fn mkdir(&mut self, path: &str, mode: u32, parents: bool) -> Result<(), String> {
        let path = norm(path);
        match self.entries.get(&path) {
            Some(Entry::Dir { .. }) => return Ok(()),
            Some(Entry::File { .. }) => return Err(format!("mkdir {path}: file exists")),
            None => {}
        }

        if parents {
            self.create_parents(&path);
        } else if let Some(parent) = parent_of(&path)
            && !self.is_dir(&parent)
        {
            return Err(format!("mkdir {path}: no such file or directory"));
        }

        self.entries.insert(path, Entry::Dir { mode });
        Ok(())
    }

    /// Removes an entry and everything below it.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = norm(path);
        if path == "/" {
            let had = !self.entries.is_empty();
            self.entries.clear();
            return had;
        }

        let prefix = format!("{path}/");
        let before = self.entries.len();
        self.entries
            .retain(|key, _| key != &path && !key.starts_with(&prefix));
        before != self.entries.len()
    }

    /// Entries strictly below `dir`, keyed relative to it.
    fn subtree(&self, dir: &str) -> Vec<(String, Entry)> {
        let dir = norm(dir);
        self.entries
            .iter()
            .filter_map(|(path, entry)| child_of(&dir, path).map(|rel| (rel, entry.clone())))
            .collect()
    }

    /// Copies the content of `other` on top of this snapshot.
    pub fn overlay(&mut self, other: &Snapshot) {
        for (path, entry) in &other.entries {
            if let Entry::File { .. } = entry {
                self.remove(path);
            }
            self.entries.insert(path.clone(), entry.clone());
        }
    }

    /// Snapshot of `dir` re-rooted at `/`.
    pub fn sub(&self, dir: &str) -> Snapshot {
        Snapshot {
            entries: self
                .subtree(dir)
                .into_iter()
                .map(|(rel, entry)| (format!("/{rel}"), entry))
                .collect(),
        }
    }

    fn graft(&mut self, dest: &str, other: &Snapshot) {
        let dest = norm(dest);
        for (path, entry) in &other.entries {
            let target = norm(&format!("{dest}/{path}"));
            self.create_parents(&target);
            self.entries.insert(target, entry.clone());
        }
    }
}

impl Reference for Snapshot {
    fn read_file(&self, path: &str, range: Option<Range<usize>>) -> Result<Vec<u8>, FsError> {
        match self.get(path) {
            Some(Entry::File { content, .. }) => Ok(match range {
                Some(range) => {
                    let end = range.end.min(content.len());
                    let start = range.start.min(end);
                    content[start..end].to_vec()
                }
                None => content.clone(),
            }),
            Some(Entry::Dir { .. }) => Err(FsError::IsADirectory(path.to_string())),
            None if self.is_dir(path) => Err(FsError::IsADirectory(path.to_string())),
            None => Err(FsError::NotExist(path.to_string())),
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        if !self.exists(path) {
            return Err(FsError::NotExist(path.to_string()));
        }
        if !self.is_dir(path) {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        Ok(self
            .subtree(path)
            .into_iter()
            .filter(|(rel, _)| !rel.contains('/'))
            .map(|(name, entry)| match entry {
                Entry::File { content, mode } => DirEntry {
                    name,
                    is_dir: false,
                    mode,
                    size: content.len() as u64,
                },
                Entry::Dir { mode } => DirEntry {
                    name,
                    is_dir: true,
                    mode,
                    size: 0,
                },
            })
            .collect())
    }
}

/// Process launched by an exec vertex.
pub struct ExecRequest<'a> {
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub dir: &'a str,
    pub user: Option<&'a str>,
    pub root: &'a mut Snapshot,
    /// Mounted filesystems by destination. Only cache mounts outlive the
    /// process.
    pub mounts: &'a mut BTreeMap<String, Snapshot>,
}

type ExecHandler = dyn Fn(&mut ExecRequest<'_>) -> Result<(), String> + Send + Sync;

type Memo = OnceLock<Result<Arc<Snapshot>, SolveError>>;

#[derive(Default)]
pub struct MemorySolver {
    images: HashMap<String, (Snapshot, ImageConfig)>,
    repos: HashMap<(String, String), Snapshot>,
    blobs: HashMap<String, Vec<u8>>,
    locals: HashMap<String, Snapshot>,
    host_root: Option<Utf8PathBuf>,
    handler: Option<Arc<ExecHandler>>,
    enforce_grants: bool,
    grants: RwLock<Grants>,
    memo: Mutex<HashMap<Hash32, Arc<Memo>>>,
    caches: Mutex<HashMap<String, Snapshot>>,
    log: Mutex<Vec<Vec<String>>>,
    solves: AtomicUsize,
    execs: AtomicUsize,
}

impl std::fmt::Debug for MemorySolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySolver")
            .field("images", &self.images.len())
            .field("solves", &self.solve_count())
            .field("execs", &self.exec_count())
            .finish_non_exhaustive()
    }
}

impl MemorySolver {
    pub fn new() -> Self {
        Self {
            enforce_grants: true,
            ..Default::default()
        }
    }

    pub fn with_image(mut self, reference: &str, fs: Snapshot, config: ImageConfig) -> Self {
        self.images.insert(normalize_image_ref(reference), (fs, config));
        self
    }

    pub fn with_git(mut self, remote: &str, reference: &str, fs: Snapshot) -> Self {
        self.repos
            .insert((remote.to_string(), reference.to_string()), fs);
        self
    }

    pub fn with_http(mut self, url: &str, content: impl Into<Vec<u8>>) -> Self {
        self.blobs.insert(url.to_string(), content.into());
        self
    }

    pub fn with_local(mut self, dir: &str, fs: Snapshot) -> Self {
        self.locals.insert(dir.to_string(), fs);
        self
    }

    /// Directory unregistered local imports are read from.
    pub fn with_host_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.host_root = Some(root.into());
        self
    }

    pub fn with_exec(
        mut self,
        handler: impl Fn(&mut ExecRequest<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Skips the entitlement and local directory checks.
    pub fn permissive(mut self) -> Self {
        self.enforce_grants = false;
        self
    }

    /// Number of `solve` calls, memoized ones included.
    pub fn solve_count(&self) -> usize {
        self.solves.load(Ordering::SeqCst)
    }

    /// Number of exec vertices actually run.
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Arguments of every exec run so far, in order.
    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    pub fn granted(&self) -> Grants {
        self.grants.read().unwrap().clone()
    }

    fn realize(&self, ctx: &Context, def: &Def) -> Result<Arc<Snapshot>, SolveError> {
        if ctx.is_canceled() {
            return Err(SolveError::Canceled);
        }

        // Concurrent solves of one digest wait on the same cell.
        let digest = def.digest();
        let cell = Arc::clone(self.memo.lock().unwrap().entry(digest).or_default());
        let result = cell.get_or_init(|| self.build(ctx, def).map(Arc::new)).clone();

        if result.is_err() {
            let mut memo = self.memo.lock().unwrap();
            if memo.get(&digest).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                memo.remove(&digest);
            }
        }
        result
    }

    fn build(&self, ctx: &Context, def: &Def) -> Result<Snapshot, SolveError> {
        match def {
            Def::Scratch => Ok(Snapshot::new()),
            Def::Image { reference } => self
                .images
                .get(reference)
                .map(|(fs, _)| fs.clone())
                .ok_or_else(|| image_not_found(reference)),
            Def::Git {
                remote,
                reference,
                keep_git_dir,
            } => {
                let key = (remote.clone(), reference.clone());
                let mut fs = self.repos.get(&key).cloned().ok_or_else(|| {
                    SolveError::failed(format!(
                        "failed to solve: repository {} at {reference} not found",
                        crate::op::redact_url(remote)
                    ))
                })?;
                if !keep_git_dir {
                    fs.remove("/.git");
                }
                Ok(fs)
            }
            Def::Http {
                url,
                checksum,
                filename,
                mode,
            } => {
                let content = self.blobs.get(url).ok_or_else(|| {
                    SolveError::failed(format!("GET {}: 404 Not Found", crate::op::redact_url(url)))
                })?;
                if let Some(expected) = checksum {
                    let actual = Hash32::hash(content).to_string();
                    if &actual != expected {
                        return Err(SolveError::failed(format!(
                            "digest mismatch {actual}: {expected}"
                        )));
                    }
                }
                let name = match filename {
                    Some(name) => name.clone(),
                    None => url
                        .rsplit('/')
                        .find(|s| !s.is_empty())
                        .unwrap_or("index")
                        .to_string(),
                };
                let mut fs = Snapshot::new();
                fs.write_file(&format!("/{name}"), content.clone(), mode.unwrap_or(0o600));
                Ok(fs)
            }
            Def::Local {
                dir,
                include,
                exclude,
            } => {
                if self.enforce_grants && !self.grants.read().unwrap().local_dirs.contains(dir) {
                    return Err(SolveError::NotGranted(format!("local directory {dir:?}")));
                }
                let fs = match self.locals.get(dir) {
                    Some(fs) => fs.clone(),
                    None => self.read_host(dir)?,
                };
                Ok(filter_patterns(&fs, include, exclude))
            }
            Def::Exec(exec) => self.exec(ctx, exec),
            Def::File { base, actions } => {
                let mut fs = self.realize(ctx, base)?.as_ref().clone();
                for action in actions {
                    self.apply(ctx, &mut fs, action)?;
                }
                Ok(fs)
            }
            Def::Merge { inputs } => {
                let mut fs = Snapshot::new();
                for input in inputs {
                    let layer = self.realize(ctx, input)?;
                    fs.overlay(&layer);
                }
                Ok(fs)
            }
        }
    }

    fn read_host(&self, dir: &str) -> Result<Snapshot, SolveError> {
        let base = match &self.host_root {
            Some(root) => root.join(dir),
            None => Utf8PathBuf::from(dir),
        };
        if !base.is_dir() {
            return Err(SolveError::failed(format!(
                "local directory {base}: no such file or directory"
            )));
        }

        let pattern = format!("{}/**/*", glob::Pattern::escape(base.as_str()));
        let paths = glob::glob(&pattern).map_err(|e| SolveError::failed(e.to_string()))?;

        let mut fs = Snapshot::new();
        for path in paths {
            let path = path.map_err(|e| SolveError::failed(e.to_string()))?;
            let path = Utf8PathBuf::try_from(path).map_err(|e| SolveError::failed(e.to_string()))?;
            let Ok(rel) = path.strip_prefix(&base) else {
                continue;
            };
            let target = format!("/{rel}");
            if path.is_dir() {
                let _ = fs.mkdir(&target, 0o755, true);
            } else {
                let content =
                    std::fs::read(&path).map_err(|e| SolveError::failed(format!("{path}: {e}")))?;
                fs.write_file(&target, content, 0o644);
            }
        }
        Ok(fs)
    }

    fn apply(&self, ctx: &Context, fs: &mut Snapshot, action: &FileAction) -> Result<(), SolveError> {
        match action {
            FileAction::Mkdir {
                path,
                mode,
                make_parents,
            } => fs.mkdir(path, *mode, *make_parents).map_err(SolveError::failed),
            FileAction::Mkfile {
                path,
                mode,
                content,
            } => {
                let path = norm(path);
                if let Some(parent) = parent_of(&path)
                    && !fs.is_dir(&parent)
                {
                    return Err(SolveError::failed(format!(
                        "mkfile {path}: no such file or directory"
                    )));
                }
                fs.write_file(&path, content.as_bytes(), *mode);
                Ok(())
            }
            FileAction::Rm {
                path,
                allow_not_found,
            } => match fs.remove(path) || *allow_not_found {
                true => Ok(()),
                false => Err(SolveError::failed(format!(
                    "rm {path}: no such file or directory"
                ))),
            },
            FileAction::Copy {
                src,
                src_path,
                dest,
                contents_only,
                create_dest_path,
                allow_wildcard,
            } => {
                let source = self.realize(ctx, src)?;
                copy(
                    &source,
                    fs,
                    src_path,
                    dest,
                    *contents_only,
                    *create_dest_path,
                    *allow_wildcard,
                )
                .map_err(SolveError::failed)
            }
        }
    }

    fn exec(&self, ctx: &Context, exec: &ExecDef) -> Result<Snapshot, SolveError> {
        if self.enforce_grants {
            let grants = self.grants.read().unwrap();
            for entitlement in exec.entitlements() {
                if !grants.entitlements.contains(&entitlement) {
                    return Err(SolveError::NotGranted(format!("entitlement {entitlement}")));
                }
            }
        }

        let mut root = self.realize(ctx, &exec.root)?.as_ref().clone();
        let mut mounts = BTreeMap::new();
        for mount in &exec.mounts {
            let fs = match &mount.source {
                MountSource::State { def, path } => {
                    let fs = self.realize(ctx, def)?;
                    match path {
                        Some(path) => fs.sub(path),
                        None => fs.as_ref().clone(),
                    }
                }
                MountSource::Cache { id } => self
                    .caches
                    .lock()
                    .unwrap()
                    .get(id)
                    .cloned()
                    .unwrap_or_default(),
                MountSource::Tmpfs => Snapshot::new(),
            };
            mounts.insert(mount.dest.clone(), fs);
        }

        if ctx.is_canceled() {
            return Err(SolveError::Canceled);
        }

        let _ = root.mkdir(&exec.dir, 0o755, true);
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(exec.args.clone());
        tracing::debug!(args = ?exec.args, dir = %exec.dir, "exec");

        if let Some(handler) = &self.handler {
            let mut request = ExecRequest {
                args: &exec.args,
                env: &exec.env,
                dir: &exec.dir,
                user: exec.user.as_deref(),
                root: &mut root,
                mounts: &mut mounts,
            };
            handler(&mut request).map_err(|message| {
                SolveError::failed(format!(
                    "executor failed running {:?}: {message}",
                    exec.args
                ))
            })?;
        }

        let mut caches = self.caches.lock().unwrap();
        for mount in &exec.mounts {
            if let MountSource::Cache { id } = &mount.source
                && let Some(fs) = mounts.remove(&mount.dest)
            {
                caches.insert(id.clone(), fs);
            }
        }

        Ok(root)
    }
}

fn image_not_found(reference: &str) -> SolveError {
    SolveError::failed(format!(
        "failed to solve: rpc error: code = Unknown desc = {reference}: not found"
    ))
}

fn filter_patterns(fs: &Snapshot, include: &[String], exclude: &[String]) -> Snapshot {
    if include.is_empty() && exclude.is_empty() {
        return fs.clone();
    }

    let compile = |patterns: &[String]| -> Vec<glob::Pattern> {
        patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p.trim_matches('/')).ok())
            .collect()
    };
    let include = compile(include);
    let exclude = compile(exclude);

    let matches = |patterns: &[glob::Pattern], rel: &str| {
        let mut prefix = String::new();
        rel.split('/').any(|part| {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            patterns.iter().any(|p| p.matches(&prefix))
        })
    };

    let mut out = Snapshot::new();
    for (path, entry) in &fs.entries {
        let rel = path.trim_start_matches('/');
        if !include.is_empty() && !matches(&include, rel) {
            continue;
        }
        if matches(&exclude, rel) {
            continue;
        }
        out.create_parents(path);
        out.entries.insert(path.clone(), entry.clone());
    }
    out
}

fn copy(
    source: &Snapshot,
    fs: &mut Snapshot,
    src_path: &str,
    dest: &str,
    contents_only: bool,
    create_dest_path: bool,
    allow_wildcard: bool,
) -> Result<(), String> {
    let src_norm = norm(src_path);
    let dest_norm = norm(dest);
    let dest_is_dir = dest.ends_with('/') || fs.is_dir(&dest_norm);

    let ensure_parent = |fs: &mut Snapshot, target: &str| -> Result<(), String> {
        if let Some(parent) = parent_of(target)
            && !fs.is_dir(&parent)
        {
            match create_dest_path {
                true => fs.mkdir(&parent, 0o755, true)?,
                false => return Err(format!("copy {target}: no such file or directory")),
            }
        }
        Ok(())
    };

    let wildcard = allow_wildcard && src_path.contains(['*', '?', '[']);
    let sources: Vec<String> = match wildcard {
        true => {
            let pattern = glob::Pattern::new(&src_norm).map_err(|e| e.to_string())?;
            source
                .paths()
                .filter(|p| pattern.matches(p))
                .map(str::to_string)
                .collect()
        }
        false => vec![src_norm.clone()],
    };

    if sources.is_empty() || !sources.iter().all(|s| source.exists(s)) {
        return Err(format!("copy {src_path}: no such file or directory"));
    }

    for src in sources {
        let name = Utf8Path::new(&src).file_name().unwrap_or("").to_string();
        if source.is_dir(&src) {
            let target = match contents_only && !wildcard {
                true => dest_norm.clone(),
                false => norm(&format!("{dest_norm}/{name}")),
            };
            ensure_parent(fs, &target)?;
            fs.mkdir(&target, 0o755, true)?;
            fs.graft(&target, &source.sub(&src));
        } else {
            let target = match dest_is_dir || wildcard {
                true => norm(&format!("{dest_norm}/{name}")),
                false => dest_norm.clone(),
            };
            ensure_parent(fs, &target)?;
            if let Some(entry) = source.get(&src) {
                fs.remove(&target);
                fs.entries.insert(target, entry.clone());
            }
        }
    }

    Ok(())
}

impl Solver for MemorySolver {
    fn solve(&self, ctx: &Context, state: &State) -> Result<Arc<dyn Reference>, SolveError> {
        self.solves.fetch_add(1, Ordering::SeqCst);
        let fs: Arc<dyn Reference> = self.realize(ctx, &state.def)?;
        Ok(fs)
    }

    fn resolve_image_config(&self, ctx: &Context, reference: &str) -> Result<ImageConfig, SolveError> {
        if ctx.is_canceled() {
            return Err(SolveError::Canceled);
        }
        self.images
            .get(&normalize_image_ref(reference))
            .map(|(_, config)| config.clone())
            .ok_or_else(|| image_not_found(reference))
    }

    fn grant(&self, grants: &Grants) {
        let mut current = self.grants.write().unwrap();
        current.entitlements.extend(grants.entitlements.iter().copied());
        current.local_dirs.extend(grants.local_dirs.iter().cloned());
    }
}
