//! Lazy filesystem handles.
//!
//! An [`FS`] pairs a build-graph description with its realized output. The
//! output is computed on first access and shared by every clone of the same
//! handle; deriving a new handle always starts with the output unset.

use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{FsError, SolveError};
use crate::llb::State;
use crate::solver::{DirEntry, Reference, Solver};
use crate::utils::normalize_path;

#[derive(Clone)]
enum Output {
    /// Scratch state: nothing to realize, every read misses.
    Empty,
    Ref(Arc<dyn Reference>),
}

#[derive(Clone)]
pub struct FS {
    input: State,
    output: Arc<Mutex<Option<Output>>>,
    solver: Arc<dyn Solver>,
}

impl FS {
    /// An empty filesystem.
    pub fn new(solver: Arc<dyn Solver>) -> Self {
        Self::from_state(State::scratch(), solver)
    }

    pub fn from_state(input: State, solver: Arc<dyn Solver>) -> Self {
        Self {
            input,
            output: Arc::new(Mutex::new(None)),
            solver,
        }
    }

    pub fn state(&self) -> &State {
        &self.input
    }

    pub fn solver(&self) -> &Arc<dyn Solver> {
        &self.solver
    }

    pub fn change(&self, f: impl FnOnce(State) -> State) -> FS {
        self.set(f(self.input.clone()))
    }

    pub fn set(&self, input: State) -> FS {
        FS::from_state(input, Arc::clone(&self.solver))
    }

    pub fn is_solved(&self) -> bool {
        self.output.lock().unwrap().is_some()
    }

    /// Realizes the input unless that already happened.
    pub fn solve(&self, ctx: &Context) -> Result<(), SolveError> {
        self.realized(ctx).map(|_| ())
    }

    fn realized(&self, ctx: &Context) -> Result<Output, SolveError> {
        let mut output = self.output.lock().unwrap();
        if let Some(output) = output.as_ref() {
            return Ok(output.clone());
        }

        let realized = match self.input.is_scratch() {
            true => Output::Empty,
            false => Output::Ref(self.solver.solve(ctx, &self.input)?),
        };
        *output = Some(realized.clone());
        Ok(realized)
    }

    pub fn read_file(&self, ctx: &Context, path: &str) -> Result<Vec<u8>, FsError> {
        match self.realized(ctx)? {
            Output::Empty => Err(FsError::NotExist(path.to_string())),
            Output::Ref(reference) => reference.read_file(path, None),
        }
    }

    pub fn read_file_range(
        &self,
        ctx: &Context,
        path: &str,
        range: std::ops::Range<usize>,
    ) -> Result<Vec<u8>, FsError> {
        match self.realized(ctx)? {
            Output::Empty => Err(FsError::NotExist(path.to_string())),
            Output::Ref(reference) => reference.read_file(path, Some(range)),
        }
    }

    pub fn read_dir(&self, ctx: &Context, path: &str) -> Result<Vec<DirEntry>, FsError> {
        match self.realized(ctx)? {
            Output::Empty => Err(FsError::NotExist(path.to_string())),
            Output::Ref(reference) => reference.read_dir(path),
        }
    }

    /// Visits every entry below `/`, a directory's entries before anything
    /// nested deeper. An empty filesystem has nothing to visit.
    pub fn walk(
        &self,
        ctx: &Context,
        mut f: impl FnMut(&str, &DirEntry) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        let reference = match self.realized(ctx)? {
            Output::Empty => return Ok(()),
            Output::Ref(reference) => reference,
        };

        let mut stack = vec![String::from("/")];
        while let Some(dir) = stack.pop() {
            let mut entries = reference.read_dir(&dir)?;
            entries.sort();
            for entry in entries.iter().rev() {
                if entry.is_dir {
                    stack.push(normalize_path(camino::Utf8Path::new(&format!(
                        "{dir}/{}",
                        entry.name
                    ))));
                }
            }
            for entry in &entries {
                let path = normalize_path(camino::Utf8Path::new(&format!("{dir}/{}", entry.name)));
                f(&path, entry)?;
            }
        }
        Ok(())
    }
}

impl Debug for FS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FS")
            .field("input", &self.input.digest())
            .field("solved", &self.is_solved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::FileAction;
    use crate::solver::MemorySolver;

    fn solver() -> Arc<MemorySolver> {
        Arc::new(MemorySolver::new())
    }

    #[test]
    fn test_scratch_reads_not_exist() {
        let solver = solver();
        let fs = FS::new(solver.clone());
        let ctx = Context::new();

        assert!(fs.read_file(&ctx, "/a").unwrap_err().is_not_exist());
        assert!(fs.read_dir(&ctx, "/").unwrap_err().is_not_exist());
        assert_eq!(solver.solve_count(), 0);
    }

    #[test]
    fn test_solve_is_memoized_and_change_invalidates() {
        let solver = solver();
        let ctx = Context::new();
        let fs = FS::new(solver.clone()).change(|st| {
            st.file(FileAction::Mkfile {
                path: "/a".into(),
                mode: 0o644,
                content: "1".into(),
            })
        });

        fs.solve(&ctx).unwrap();
        fs.solve(&ctx).unwrap();
        assert_eq!(fs.read_file(&ctx, "/a").unwrap(), b"1");
        assert_eq!(solver.solve_count(), 1);

        let next = fs.change(|st| {
            st.file(FileAction::Rm {
                path: "/a".into(),
                allow_not_found: false,
            })
        });
        assert!(!next.is_solved());
        assert!(next.read_file(&ctx, "/a").unwrap_err().is_not_exist());
        assert_eq!(solver.solve_count(), 2);
    }

    #[test]
    fn test_walk() {
        let ctx = Context::new();
        let fs = FS::new(solver()).change(|st| {
            st.file(FileAction::Mkfile {
                path: "/b".into(),
                mode: 0o644,
                content: String::new(),
            })
            .file(FileAction::Mkdir {
                path: "/a/x".into(),
                mode: 0o755,
                make_parents: true,
            })
        });

        let mut seen = Vec::new();
        fs.walk(&ctx, |path, _| {
            seen.push(path.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["/a", "/b", "/a/x"]);
    }
}
