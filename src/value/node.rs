use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::ValueError;
use crate::value::path::{Path, Selector, fmt_label};

/// Type tag carried by an unresolved placeholder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Constraint {
    Any,
    String,
    Number,
    Int,
    Bool,
    List,
    Struct,
}

impl Constraint {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "_" => Constraint::Any,
            "string" => Constraint::String,
            "number" => Constraint::Number,
            "int" => Constraint::Int,
            "bool" => Constraint::Bool,
            "list" => Constraint::List,
            "struct" => Constraint::Struct,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Constraint::Any => "_",
            Constraint::String => "string",
            Constraint::Number => "number",
            Constraint::Int => "int",
            Constraint::Bool => "bool",
            Constraint::List => "list",
            Constraint::Struct => "struct",
        }
    }

    fn intersect(self, other: Constraint) -> Option<Constraint> {
        match (self, other) {
            (Constraint::Any, c) | (c, Constraint::Any) => Some(c),
            (a, b) if a == b => Some(a),
            (Constraint::Number, Constraint::Int) | (Constraint::Int, Constraint::Number) => {
                Some(Constraint::Int)
            }
            _ => None,
        }
    }

    /// Whether a concrete kind can ever satisfy this placeholder.
    pub(crate) fn admits(self, kind: &Kind) -> bool {
        match (self, kind) {
            (Constraint::Any, _) => true,
            (Constraint::String, Kind::String(_)) => true,
            (Constraint::Number, Kind::Int(_) | Kind::Float(_)) => true,
            (Constraint::Int, Kind::Int(_)) => true,
            (Constraint::Bool, Kind::Bool(_)) => true,
            (Constraint::List, Kind::List(_)) => true,
            (Constraint::Struct, Kind::Struct(_)) => true,
            (c, Kind::Top(other)) => c.intersect(*other).is_some(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Kind {
    /// Unresolved placeholder, optionally constrained to a type.
    Top(Constraint),
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Node>),
    Struct(BTreeMap<String, Node>),
    /// Reference to another absolute location, unified with `with`.
    Ref { target: Path, with: Box<Node> },
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Top(_) => "placeholder",
            Kind::Null => "null",
            Kind::Bool(_) => "bool",
            Kind::Int(_) => "int",
            Kind::Float(_) => "float",
            Kind::String(_) => "string",
            Kind::List(_) => "list",
            Kind::Struct(_) => "struct",
            Kind::Ref { .. } => "reference",
        }
    }
}

/// One node of a partially specified document.
///
/// Definitions (labels starting with `#`) live next to the node's kind so a
/// scalar or a list can still carry an attached compute script.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: Kind,
    pub defs: BTreeMap<String, Node>,
    /// Canonical location this node was copied from by reference resolution.
    pub origin: Option<Path>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.defs == other.defs
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::top()
    }
}

impl From<Kind> for Node {
    fn from(kind: Kind) -> Self {
        Self {
            kind,
            defs: BTreeMap::new(),
            origin: None,
        }
    }
}

impl Node {
    pub fn top() -> Self {
        Kind::Top(Constraint::Any).into()
    }

    pub fn typed(constraint: Constraint) -> Self {
        Kind::Top(constraint).into()
    }

    pub fn null() -> Self {
        Kind::Null.into()
    }

    pub fn bool(value: bool) -> Self {
        Kind::Bool(value).into()
    }

    pub fn int(value: i64) -> Self {
        Kind::Int(value).into()
    }

    pub fn float(value: f64) -> Self {
        Kind::Float(value).into()
    }

    pub fn string(value: impl Into<String>) -> Self {
        Kind::String(value.into()).into()
    }

    pub fn list(items: impl IntoIterator<Item = Node>) -> Self {
        Kind::List(items.into_iter().collect()).into()
    }

    pub fn structure<K: Into<String>>(fields: impl IntoIterator<Item = (K, Node)>) -> Self {
        Kind::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect()).into()
    }

    pub fn reference(target: impl Into<Path>) -> Self {
        Kind::Ref {
            target: target.into(),
            with: Box::new(Node::top()),
        }
        .into()
    }

    /// Adds a field, routing `#` labels to the definitions.
    pub fn with_field(mut self, label: impl Into<String>, node: Node) -> Self {
        let label = label.into();
        if label.starts_with('#') {
            self.defs.insert(label, node);
        } else {
            match &mut self.kind {
                Kind::Struct(fields) => {
                    fields.insert(label, node);
                }
                Kind::Top(Constraint::Any | Constraint::Struct) => {
                    self.kind = Kind::Struct(BTreeMap::from([(label, node)]));
                }
                _ => {}
            }
        }
        self
    }

    /// Like [`Node::from_data`], but rejects integers outside the `i64`
    /// range instead of rounding them to a float.
    pub fn try_from_data(data: serde_json::Value, at: &Path) -> Result<Self, ValueError> {
        Ok(match data {
            serde_json::Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
                return Err(ValueError::Decode {
                    path: at.clone(),
                    message: format!("integer {n} out of range"),
                });
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    out.push(Node::try_from_data(item, &at.child(i))?);
                }
                Node::list(out)
            }
            serde_json::Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (label, item) in map {
                    let node = Node::try_from_data(item, &at.child(label.as_str()))?;
                    fields.push((label, node));
                }
                Node::structure(fields)
            }
            scalar => Node::from_data(scalar),
        })
    }

    /// Converts literal data. No document conventions are applied.
    ///
    /// Integers beyond `i64` become floats; see [`Node::try_from_data`].
    pub fn from_data(data: serde_json::Value) -> Self {
        match data {
            serde_json::Value::Null => Node::null(),
            serde_json::Value::Bool(b) => Node::bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Node::int(i),
                None => Node::float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Node::string(s),
            serde_json::Value::Array(items) => Node::list(items.into_iter().map(Node::from_data)),
            serde_json::Value::Object(map) => {
                Node::structure(map.into_iter().map(|(k, v)| (k, Node::from_data(v))))
            }
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, Kind::Struct(_))
    }

    /// Child by selector. References are looked through.
    pub fn get(&self, selector: &Selector) -> Option<&Node> {
        match selector {
            Selector::Field(label) if label.starts_with('#') => match self.defs.get(label) {
                Some(node) => Some(node),
                None => match &self.kind {
                    Kind::Ref { with, .. } => with.get(selector),
                    _ => None,
                },
            },
            Selector::Field(label) => match &self.kind {
                Kind::Struct(fields) => fields.get(label),
                Kind::Ref { with, .. } => with.get(selector),
                _ => None,
            },
            Selector::Index(index) => match &self.kind {
                Kind::List(items) => items.get(*index),
                Kind::Ref { with, .. } => with.get(selector),
                _ => None,
            },
        }
    }

    pub fn get_path(&self, path: &Path) -> Option<&Node> {
        path.selectors()
            .iter()
            .try_fold(self, |node, selector| node.get(selector))
    }

    /// Child by selector, created as an open placeholder when absent.
    pub(crate) fn entry_mut(&mut self, selector: &Selector, at: &Path) -> Result<&mut Node, ValueError> {
        match selector {
            Selector::Field(label) if label.starts_with('#') => {
                Ok(self.defs.entry(label.clone()).or_default())
            }
            Selector::Field(label) => {
                if let Kind::Top(Constraint::Any | Constraint::Struct) = self.kind {
                    self.kind = Kind::Struct(BTreeMap::new());
                }
                match &mut self.kind {
                    Kind::Struct(fields) => Ok(fields.entry(label.clone()).or_default()),
                    Kind::Ref { with, .. } => with.entry_mut(selector, at),
                    other => Err(ValueError::WrongKind {
                        path: at.clone(),
                        expected: "struct",
                        found: other.name().to_string(),
                    }),
                }
            }
            Selector::Index(index) => match &mut self.kind {
                Kind::List(items) => items.get_mut(*index).ok_or_else(|| ValueError::NotFound {
                    path: at.child(*index),
                }),
                Kind::Ref { with, .. } => with.entry_mut(selector, at),
                other => Err(ValueError::WrongKind {
                    path: at.clone(),
                    expected: "list",
                    found: other.name().to_string(),
                }),
            },
        }
    }

    /// Unifies two nodes. Concrete values that disagree are a conflict.
    pub fn merge(&self, other: &Node) -> Result<Node, ValueError> {
        self.merge_at(other, &Path::root())
    }

    pub(crate) fn merge_at(&self, other: &Node, path: &Path) -> Result<Node, ValueError> {
        let kind = merge_kind(&self.kind, &other.kind, path)?;

        let mut defs = self.defs.clone();
        for (label, node) in &other.defs {
            let merged = match defs.get(label) {
                Some(existing) => existing.merge_at(node, &path.child(label.as_str()))?,
                None => node.clone(),
            };
            defs.insert(label.clone(), merged);
        }

        Ok(Node {
            kind,
            defs,
            origin: self.origin.clone().or_else(|| other.origin.clone()),
        })
    }

    /// True when no placeholder or reference remains outside definitions.
    pub fn is_concrete(&self) -> bool {
        self.first_incomplete(&Path::root()).is_none()
    }

    pub fn first_incomplete(&self, at: &Path) -> Option<Path> {
        match &self.kind {
            Kind::Top(_) | Kind::Ref { .. } => Some(at.clone()),
            Kind::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.first_incomplete(&at.child(i))),
            Kind::Struct(fields) => fields
                .iter()
                .find_map(|(label, field)| field.first_incomplete(&at.child(label.as_str()))),
            _ => None,
        }
    }

    /// Replaces every resolvable reference with a copy of its target.
    ///
    /// Missing targets and cycles are left in place, so the result simply
    /// stays incomplete at those locations.
    pub fn resolve(&self) -> Result<Node, ValueError> {
        Resolver {
            root: self,
            visiting: Vec::new(),
        }
        .resolve(self, &Path::root())
    }

    /// Renders the node as data. Incomplete values are an error unless
    /// `partial` is set, in which case they are dropped from structs and
    /// rendered as `null` inside lists.
    pub(crate) fn to_data(
        &self,
        at: &Path,
        partial: bool,
    ) -> Result<Option<serde_json::Value>, ValueError> {
        use serde_json::Value as Json;

        Ok(Some(match &self.kind {
            Kind::Top(_) | Kind::Ref { .. } => {
                return match partial {
                    true => Ok(None),
                    false => Err(ValueError::Incomplete { path: at.clone() }),
                };
            }
            Kind::Null => Json::Null,
            Kind::Bool(b) => Json::Bool(*b),
            Kind::Int(i) => Json::from(*i),
            Kind::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Kind::String(s) => Json::String(s.clone()),
            Kind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(item.to_data(&at.child(i), partial)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Kind::Struct(fields) => {
                let mut out = serde_json::Map::new();
                for (label, field) in fields {
                    if let Some(data) = field.to_data(&at.child(label.as_str()), partial)? {
                        out.insert(label.clone(), data);
                    }
                }
                Json::Object(out)
            }
        }))
    }

    /// Short description used in conflict messages.
    pub(crate) fn summary(&self) -> String {
        match &self.kind {
            Kind::List(items) => format!("list of {}", items.len()),
            Kind::Struct(_) => String::from("struct"),
            Kind::Ref { target, .. } => format!("reference to {target}"),
            _ => {
                let mut out = String::new();
                self.write_source(&mut out, 0);
                out
            }
        }
    }

    pub(crate) fn write_source(&self, out: &mut String, indent: usize) {
        match &self.kind {
            Kind::Top(constraint) => out.push_str(constraint.name()),
            Kind::Null => out.push_str("null"),
            Kind::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Kind::Int(i) => out.push_str(&i.to_string()),
            Kind::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => out.push_str(&n.to_string()),
                None => out.push_str("null"),
            },
            Kind::String(s) => out.push_str(&serde_json::Value::from(s.as_str()).to_string()),
            Kind::List(items) => {
                if items.is_empty() {
                    out.push_str("[]");
                } else {
                    out.push_str("[\n");
                    for item in items {
                        pad(out, indent + 1);
                        item.write_source(out, indent + 1);
                        out.push_str(",\n");
                    }
                    pad(out, indent);
                    out.push(']');
                }
            }
            Kind::Struct(fields) => {
                write_struct(out, indent, fields.iter().chain(self.defs.iter()));
                return;
            }
            Kind::Ref { target, with } => {
                let _ = write!(out, "{target}");
                if *with.as_ref() != Node::top() {
                    out.push_str(" & ");
                    with.write_source(out, indent);
                }
            }
        }

        if !self.defs.is_empty() {
            out.push_str(" & ");
            write_struct(out, indent, self.defs.iter());
        }
    }
}

fn pad(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push('\t');
    }
}

fn write_struct<'a>(out: &mut String, indent: usize, fields: impl Iterator<Item = (&'a String, &'a Node)>) {
    let mut fields = fields.peekable();
    if fields.peek().is_none() {
        out.push_str("{}");
        return;
    }

    out.push_str("{\n");
    for (label, node) in fields {
        pad(out, indent + 1);
        let _ = fmt_label(out, label);
        out.push_str(": ");
        node.write_source(out, indent + 1);
        out.push('\n');
    }
    pad(out, indent);
    out.push('}');
}

fn conflict(left: &Kind, right: &Kind, path: &Path) -> ValueError {
    ValueError::Conflict {
        path: path.clone(),
        left: Node::from(left.clone()).summary(),
        right: Node::from(right.clone()).summary(),
    }
}

fn merge_kind(left: &Kind, right: &Kind, path: &Path) -> Result<Kind, ValueError> {
    Ok(match (left, right) {
        (
            Kind::Ref { target, with },
            Kind::Ref {
                target: other,
                with: other_with,
            },
        ) if target == other => Kind::Ref {
            target: target.clone(),
            with: Box::new(with.merge_at(other_with, path)?),
        },
        (Kind::Ref { target, with }, other) | (other, Kind::Ref { target, with }) => Kind::Ref {
            target: target.clone(),
            with: Box::new(with.merge_at(&Node::from(other.clone()), path)?),
        },
        (Kind::Top(a), Kind::Top(b)) => match a.intersect(*b) {
            Some(c) => Kind::Top(c),
            None => return Err(conflict(left, right, path)),
        },
        (Kind::Top(c), other) | (other, Kind::Top(c)) => {
            if !c.admits(other) {
                return Err(conflict(left, right, path));
            }
            other.clone()
        }
        (Kind::Null, Kind::Null) => Kind::Null,
        (Kind::Bool(a), Kind::Bool(b)) if a == b => Kind::Bool(*a),
        (Kind::Int(a), Kind::Int(b)) if a == b => Kind::Int(*a),
        (Kind::Float(a), Kind::Float(b)) if a == b => Kind::Float(*a),
        (Kind::Int(a), Kind::Float(b)) | (Kind::Float(b), Kind::Int(a)) if *a as f64 == *b => {
            Kind::Int(*a)
        }
        (Kind::String(a), Kind::String(b)) if a == b => Kind::String(a.clone()),
        (Kind::List(a), Kind::List(b)) if a.len() == b.len() => Kind::List(
            a.iter()
                .zip(b)
                .enumerate()
                .map(|(i, (x, y))| x.merge_at(y, &path.child(i)))
                .collect::<Result<_, _>>()?,
        ),
        (Kind::Struct(a), Kind::Struct(b)) => {
            let mut fields = a.clone();
            for (label, node) in b {
                let merged = match fields.get(label) {
                    Some(existing) => existing.merge_at(node, &path.child(label.as_str()))?,
                    None => node.clone(),
                };
                fields.insert(label.clone(), merged);
            }
            Kind::Struct(fields)
        }
        _ => return Err(conflict(left, right, path)),
    })
}

struct Resolver<'a> {
    root: &'a Node,
    visiting: Vec<Path>,
}

impl<'a> Resolver<'a> {
    fn resolve(&mut self, node: &Node, at: &Path) -> Result<Node, ValueError> {
        let mut defs = BTreeMap::new();
        for (label, def) in &node.defs {
            defs.insert(label.clone(), self.resolve(def, &at.child(label.as_str()))?);
        }

        let kind = match &node.kind {
            Kind::Ref { target, with } => {
                let with = self.resolve(with, at)?;
                let Some(resolved) = self.follow(target)? else {
                    return Ok(Node {
                        kind: Kind::Ref {
                            target: target.clone(),
                            with: Box::new(with),
                        },
                        defs,
                        origin: node.origin.clone(),
                    });
                };

                let mut out = resolved.merge_at(&with, at)?;
                out = out.merge_at(
                    &Node {
                        kind: Kind::Top(Constraint::Any),
                        defs,
                        origin: None,
                    },
                    at,
                )?;
                out.origin = resolved.origin.or_else(|| Some(target.clone()));
                return Ok(out);
            }
            Kind::List(items) => Kind::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.resolve(item, &at.child(i)))
                    .collect::<Result<_, _>>()?,
            ),
            Kind::Struct(fields) => {
                let mut out = BTreeMap::new();
                for (label, field) in fields {
                    out.insert(label.clone(), self.resolve(field, &at.child(label.as_str()))?);
                }
                Kind::Struct(out)
            }
            other => other.clone(),
        };

        Ok(Node {
            kind,
            defs,
            origin: node.origin.clone(),
        })
    }

    /// Locates and resolves a reference target, looking through any
    /// references met on the way.
    fn follow(&mut self, target: &Path) -> Result<Option<Node>, ValueError> {
        if self.visiting.contains(target) {
            return Ok(None);
        }

        let mut current = Cow::Borrowed(self.root);
        let mut at = Path::root();

        for selector in target.selectors() {
            let own_def = selector.is_definition()
                && matches!(selector, Selector::Field(label) if current.defs.contains_key(label));
            if matches!(current.kind, Kind::Ref { .. }) && !own_def {
                self.visiting.push(target.clone());
                let resolved = self.resolve(&current, &at);
                self.visiting.pop();
                let resolved = resolved?;
                if let Some(origin) = &resolved.origin {
                    at = origin.clone();
                }
                current = Cow::Owned(resolved);
            }

            current = match current {
                Cow::Borrowed(node) => match node.get(selector) {
                    Some(next) => Cow::Borrowed(next),
                    None => return Ok(None),
                },
                Cow::Owned(node) => match node.get(selector) {
                    Some(next) => Cow::Owned(next.clone()),
                    None => return Ok(None),
                },
            };
            at = at.child(selector.clone());
        }

        self.visiting.push(target.clone());
        let resolved = self.resolve(&current, target);
        self.visiting.pop();

        let mut resolved = resolved?;
        if resolved.origin.is_none() {
            resolved.origin = Some(at);
        }
        Ok(Some(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(fields: Vec<(&str, Node)>) -> Node {
        Node::structure(fields)
    }

    #[test]
    fn test_merge_union_of_fields() {
        let a = s(vec![("a", Node::int(1)), ("b", Node::typed(Constraint::String))]);
        let b = s(vec![("b", Node::string("x")), ("c", Node::bool(true))]);

        let merged = a.merge(&b).unwrap();
        assert_eq!(
            merged,
            s(vec![
                ("a", Node::int(1)),
                ("b", Node::string("x")),
                ("c", Node::bool(true)),
            ])
        );
        assert!(merged.is_concrete());
    }

    #[test]
    fn test_merge_idempotent() {
        let a = s(vec![
            ("a", Node::list([Node::int(1), Node::top()])),
            ("r", Node::reference("a")),
        ])
        .with_field("#up", Node::list([s(vec![("do", Node::string("exec"))])]));

        assert_eq!(a.merge(&a).unwrap(), a);
    }

    #[test]
    fn test_merge_conflict() {
        let a = s(vec![("x", s(vec![("y", Node::string("one"))]))]);
        let b = s(vec![("x", s(vec![("y", Node::string("two"))]))]);

        let err = a.merge(&b).unwrap_err();
        assert_eq!(err.path(), &Path::parse("x.y"));
        assert!(err.to_string().contains("\"one\""));
    }

    #[test]
    fn test_merge_constraint() {
        assert!(Node::typed(Constraint::String).merge(&Node::int(1)).is_err());
        assert_eq!(
            Node::typed(Constraint::Number).merge(&Node::typed(Constraint::Int)).unwrap(),
            Node::typed(Constraint::Int)
        );
        assert_eq!(Node::int(2).merge(&Node::float(2.0)).unwrap(), Node::int(2));
    }

    #[test]
    fn test_resolve_reference() {
        let root = s(vec![
            ("a", s(vec![("b", Node::string("hi"))])),
            ("c", Node::reference("a")),
            ("d", Node::reference("c.b")),
        ]);

        let resolved = root.resolve().unwrap();
        assert!(resolved.is_concrete());

        let c = resolved.get_path(&Path::parse("c")).unwrap();
        assert_eq!(c.origin, Some(Path::parse("a")));
        let d = resolved.get_path(&Path::parse("d")).unwrap();
        assert_eq!(d, &Node::string("hi"));
        assert_eq!(d.origin, Some(Path::parse("a.b")));
    }

    #[test]
    fn test_resolve_missing_and_cycle() {
        let root = s(vec![
            ("a", Node::reference("missing.field")),
            ("b", Node::reference("c")),
            ("c", Node::reference("b")),
        ]);

        let resolved = root.resolve().unwrap();
        assert_eq!(resolved.first_incomplete(&Path::root()), Some(Path::parse("a")));
        assert!(!resolved.get_path(&Path::parse("b")).unwrap().is_concrete());
    }

    #[test]
    fn test_definitions_do_not_affect_concreteness() {
        let node = Node::string("x").with_field("#up", Node::list([Node::top()]));
        assert!(node.is_concrete());
        assert_eq!(node.to_data(&Path::root(), false).unwrap(), Some(serde_json::json!("x")));
    }

    #[test]
    fn test_partial_data() {
        let node = s(vec![
            ("a", Node::int(1)),
            ("b", Node::top()),
            ("c", Node::list([Node::top(), Node::bool(false)])),
        ]);

        assert!(node.to_data(&Path::root(), false).is_err());
        assert_eq!(
            node.to_data(&Path::root(), true).unwrap(),
            Some(serde_json::json!({"a": 1, "c": [null, false]}))
        );
    }
}
