//! Partially specified documents.
//!
//! A [`Value`] is a handle to a location inside a shared document tree. The
//! tree sits behind one reader/writer lock: every structural mutation takes
//! the write half, every lookup the read half, and no user callback ever runs
//! while the lock is held.

mod node;
mod path;
mod schema;

use std::fmt::{self, Debug};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;

use crate::error::{SchemaError, ValueError};

pub use node::{Constraint, Kind, Node};
pub use path::{Path, Selector};
pub use schema::{FieldSchema, Schema};

#[derive(Clone)]
pub struct Value {
    root: Arc<RwLock<Node>>,
    path: Path,
}

/// A regular field of a struct value.
#[derive(Clone, Debug)]
pub struct Field {
    pub label: String,
    pub value: Value,
}

impl Value {
    pub fn new(node: Node) -> Self {
        Self {
            root: Arc::new(RwLock::new(node)),
            path: Path::root(),
        }
    }

    /// An open placeholder, the neutral element of merge.
    pub fn empty() -> Self {
        Self::new(Node::top())
    }

    fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.root.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.root.write().unwrap()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the node this handle points at.
    pub fn node(&self) -> Option<Node> {
        self.read().get_path(&self.path).cloned()
    }

    /// Copy of the node, or an open placeholder when the path is missing.
    pub fn node_or_top(&self) -> Node {
        self.node().unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.read().get_path(&self.path).is_some()
    }

    /// Never fails: a missing location is reported by [`Value::exists`].
    pub fn lookup(&self, path: &str) -> Value {
        self.lookup_path(&Path::parse(path))
    }

    pub fn lookup_path(&self, path: &Path) -> Value {
        Value {
            root: Arc::clone(&self.root),
            path: self.path.join(path),
        }
    }

    /// Location this value was copied from when it was reached through a
    /// reference, its own path otherwise.
    pub fn canonical_path(&self) -> Path {
        let root = self.read();
        let selectors = self.path.selectors();
        for depth in (0..=selectors.len()).rev() {
            let prefix = Path::from(selectors[..depth].to_vec());
            if let Some(origin) = root.get_path(&prefix).and_then(|node| node.origin.as_ref()) {
                return origin.join(&Path::from(selectors[depth..].to_vec()));
            }
        }
        self.path.clone()
    }

    pub fn kind_name(&self) -> &'static str {
        match self.read().get_path(&self.path) {
            Some(node) => node.kind.name(),
            None => "missing",
        }
    }

    pub fn is_concrete_recursive(&self) -> bool {
        self.check_concrete().is_ok()
    }

    /// Fails with the full path of the first incomplete location.
    pub fn check_concrete(&self) -> Result<(), ValueError> {
        match self.read().get_path(&self.path) {
            Some(node) => match node.first_incomplete(&self.path) {
                Some(path) => Err(ValueError::Incomplete { path }),
                None => Ok(()),
            },
            None => Err(ValueError::Incomplete {
                path: self.path.clone(),
            }),
        }
    }

    fn scalar<T>(
        &self,
        expected: &'static str,
        f: impl FnOnce(&Kind) -> Option<T>,
    ) -> Result<T, ValueError> {
        let guard = self.read();
        let node = guard.get_path(&self.path).ok_or_else(|| ValueError::NotFound {
            path: self.path.clone(),
        })?;

        match f(&node.kind) {
            Some(value) => Ok(value),
            None if matches!(node.kind, Kind::Top(_) | Kind::Ref { .. }) => {
                Err(ValueError::Incomplete {
                    path: self.path.clone(),
                })
            }
            None => Err(ValueError::WrongKind {
                path: self.path.clone(),
                expected,
                found: node.kind.name().to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> Result<String, ValueError> {
        self.scalar("string", |kind| match kind {
            Kind::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        self.scalar("bool", |kind| match kind {
            Kind::Bool(b) => Some(*b),
            _ => None,
        })
    }

    pub fn as_i64(&self) -> Result<i64, ValueError> {
        self.scalar("int", |kind| match kind {
            Kind::Int(i) => Some(*i),
            _ => None,
        })
    }

    pub fn list(&self) -> Result<Vec<Value>, ValueError> {
        let len = self.scalar("list", |kind| match kind {
            Kind::List(items) => Some(items.len()),
            _ => None,
        })?;
        Ok((0..len).map(|i| self.lookup_path(&Path::root().child(i))).collect())
    }

    /// Regular fields, definitions excluded, sorted by label.
    pub fn fields(&self) -> Result<Vec<Field>, ValueError> {
        let labels = self.scalar("struct", |kind| match kind {
            Kind::Struct(fields) => Some(fields.keys().cloned().collect::<Vec<_>>()),
            _ => None,
        })?;
        Ok(labels
            .into_iter()
            .map(|label| Field {
                value: self.lookup_path(&Path::root().child(label.as_str())),
                label,
            })
            .collect())
    }

    /// Unifies two values into a new, independent document.
    pub fn merge(&self, other: &Value) -> Result<Value, ValueError> {
        let left = self.node_or_top();
        let right = other.node_or_top();
        Ok(Value::new(left.merge_at(&right, &Path::root())?))
    }

    /// Merges `node` into this location, creating missing parents.
    ///
    /// On conflict the document is left untouched.
    pub fn fill(&self, node: Node) -> Result<(), ValueError> {
        let mut root = self.write();

        let merged = match root.get_path(&self.path) {
            Some(existing) => existing.merge_at(&node, &self.path)?,
            None => node,
        };

        let mut target = &mut *root;
        let mut at = Path::root();
        for selector in self.path.selectors() {
            target = target.entry_mut(selector, &at)?;
            at = at.child(selector.clone());
        }
        *target = merged;

        Ok(())
    }

    pub fn fill_value(&self, other: &Value) -> Result<(), ValueError> {
        self.fill(other.node_or_top())
    }

    /// Replaces the whole document this handle belongs to.
    pub(crate) fn replace_root(&self, node: Node) {
        *self.write() = node;
    }

    /// New document with every resolvable reference substituted.
    pub fn resolved(&self) -> Result<Value, ValueError> {
        let node = self.node_or_top();
        Ok(Value::new(node.resolve()?))
    }

    /// Checks the value against every given schema.
    pub fn validate(&self, schemas: &[&Schema]) -> Result<(), SchemaError> {
        let node = self.node().ok_or_else(|| SchemaError::new(&self.path, "value is missing"))?;
        for schema in schemas {
            schema.check(&node, &self.path)?;
        }
        Ok(())
    }

    /// Depth-first walk over regular fields and list items.
    ///
    /// `before` decides whether to descend into a location; `after` runs once
    /// its children are done. Definitions are never descended into.
    pub fn walk(&self, mut before: impl FnMut(&Value) -> bool, mut after: impl FnMut(&Value)) {
        let Some(snapshot) = self.node() else {
            return;
        };
        self.walk_node(&snapshot, &Path::root(), &mut before, &mut after);
    }

    fn walk_node(
        &self,
        node: &Node,
        at: &Path,
        before: &mut impl FnMut(&Value) -> bool,
        after: &mut impl FnMut(&Value),
    ) {
        let value = self.lookup_path(at);
        if !before(&value) {
            return;
        }

        match &node.kind {
            Kind::Struct(fields) => {
                for (label, child) in fields {
                    self.walk_node(child, &at.child(label.as_str()), before, after);
                }
            }
            Kind::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.walk_node(child, &at.child(i), before, after);
                }
            }
            _ => {}
        }

        after(&value);
    }

    /// Canonical JSON: sorted keys, no whitespace, no definitions.
    pub fn json(&self) -> Result<String, ValueError> {
        let node = self.node().ok_or_else(|| ValueError::NotFound {
            path: self.path.clone(),
        })?;
        let data = node.to_data(&self.path, false)?.unwrap_or(serde_json::Value::Null);
        Ok(data.to_string())
    }

    /// Like [`Value::json`], dropping incomplete fields instead of failing.
    pub fn json_partial(&self) -> Result<String, ValueError> {
        let node = self.node_or_top();
        let data = node
            .to_data(&self.path, true)?
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        Ok(data.to_string())
    }

    /// Deterministic textual rendering, definitions and placeholders included.
    pub fn source(&self) -> String {
        let mut out = String::new();
        match self.node() {
            Some(node) => node.write_source(&mut out, 0),
            None => out.push_str("_|_"),
        }
        out
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        let node = self.node().ok_or_else(|| ValueError::NotFound {
            path: self.path.clone(),
        })?;
        let data = node.to_data(&self.path, false)?.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| ValueError::Decode {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::empty()
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        Value::new(node)
    }
}

impl From<serde_json::Value> for Value {
    fn from(data: serde_json::Value) -> Self {
        Value::new(Node::from_data(data))
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("path", &self.path.to_string())
            .field("source", &self.source())
            .finish()
    }
}
