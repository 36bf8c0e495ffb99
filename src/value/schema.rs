use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::value::node::{Constraint, Kind, Node};
use crate::value::path::Path;

/// Shape a document node must have.
///
/// Incomplete nodes (placeholders and references) pass as long as they could
/// still become something the schema accepts.
#[derive(Clone, Debug)]
pub enum Schema {
    Any,
    String,
    Int,
    Number,
    Bool,
    /// One of a fixed set of strings.
    OneOf(Vec<String>),
    List(Box<Schema>),
    /// Struct with arbitrary labels, every value matching one schema.
    Map(Box<Schema>),
    Struct {
        fields: Vec<FieldSchema>,
        closed: bool,
    },
    Either(Vec<Schema>),
    /// Struct discriminated by the string field `tag`.
    Union {
        tag: String,
        variants: BTreeMap<String, Schema>,
    },
    /// An executable script: one operation, a list of them, or a node with
    /// an attached `#up` script.
    Script,
}

#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

impl FieldSchema {
    pub fn required(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: true,
        }
    }

    pub fn optional(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: false,
        }
    }
}

impl Schema {
    pub fn closed(fields: Vec<FieldSchema>) -> Self {
        Schema::Struct {
            fields,
            closed: true,
        }
    }

    pub fn list(item: Schema) -> Self {
        Schema::List(Box::new(item))
    }

    pub fn map(value: Schema) -> Self {
        Schema::Map(Box::new(value))
    }

    pub fn one_of(values: &[&str]) -> Self {
        Schema::OneOf(values.iter().map(|v| v.to_string()).collect())
    }

    fn constraint(&self) -> Option<Constraint> {
        Some(match self {
            Schema::String | Schema::OneOf(_) => Constraint::String,
            Schema::Int => Constraint::Int,
            Schema::Number => Constraint::Number,
            Schema::Bool => Constraint::Bool,
            Schema::List(_) => Constraint::List,
            Schema::Map(_) | Schema::Struct { .. } | Schema::Union { .. } => Constraint::Struct,
            Schema::Any | Schema::Either(_) | Schema::Script => return None,
        })
    }

    pub fn check(&self, node: &Node, at: &Path) -> Result<(), SchemaError> {
        match &node.kind {
            Kind::Ref { .. } => return Ok(()),
            Kind::Top(constraint) => {
                return match self.constraint() {
                    Some(expected) if !expected.admits(&node.kind) => Err(SchemaError::new(
                        at,
                        format!("expected {}, found {}", expected.name(), constraint.name()),
                    )),
                    _ => Ok(()),
                };
            }
            _ => {}
        }

        match self {
            Schema::Any => Ok(()),
            Schema::String => expect(matches!(node.kind, Kind::String(_)), "string", node, at),
            Schema::Int => expect(matches!(node.kind, Kind::Int(_)), "int", node, at),
            Schema::Number => expect(
                matches!(node.kind, Kind::Int(_) | Kind::Float(_)),
                "number",
                node,
                at,
            ),
            Schema::Bool => expect(matches!(node.kind, Kind::Bool(_)), "bool", node, at),
            Schema::OneOf(values) => match &node.kind {
                Kind::String(s) if values.contains(s) => Ok(()),
                Kind::String(s) => Err(SchemaError::new(
                    at,
                    format!("{s:?} is not one of {}", values.join(", ")),
                )),
                _ => expect(false, "string", node, at),
            },
            Schema::List(item) => match &node.kind {
                Kind::List(items) => items
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, child)| item.check(child, &at.child(i))),
                _ => expect(false, "list", node, at),
            },
            Schema::Map(value) => match &node.kind {
                Kind::Struct(fields) => fields
                    .iter()
                    .try_for_each(|(label, child)| value.check(child, &at.child(label.as_str()))),
                _ => expect(false, "struct", node, at),
            },
            Schema::Struct { fields, closed } => {
                let Kind::Struct(present) = &node.kind else {
                    return expect(false, "struct", node, at);
                };

                for field in fields {
                    match present.get(&field.name) {
                        Some(child) => field.schema.check(child, &at.child(field.name.as_str()))?,
                        None if field.required => {
                            return Err(SchemaError::new(
                                at,
                                format!("field {:?} is required", field.name),
                            ));
                        }
                        None => {}
                    }
                }

                if *closed {
                    for label in present.keys() {
                        if !fields.iter().any(|f| &f.name == label) {
                            return Err(SchemaError::new(
                                at,
                                format!("field {label:?} not allowed"),
                            ));
                        }
                    }
                }

                Ok(())
            }
            Schema::Either(options) => {
                let mut errors = Vec::new();
                for option in options {
                    match option.check(node, at) {
                        Ok(()) => return Ok(()),
                        Err(e) => errors.push(e.message),
                    }
                }
                Err(SchemaError::new(at, errors.join("; or ")))
            }
            Schema::Union { tag, variants } => {
                let Kind::Struct(present) = &node.kind else {
                    return expect(false, "struct", node, at);
                };

                let Some(discriminant) = present.get(tag) else {
                    return Err(SchemaError::new(at, format!("field {tag:?} is required")));
                };

                match &discriminant.kind {
                    Kind::String(name) => match variants.get(name) {
                        Some(variant) => variant.check(node, at),
                        None => Err(SchemaError::new(
                            &at.child(tag.as_str()),
                            format!("unknown {tag} {name:?}"),
                        )),
                    },
                    Kind::Top(_) | Kind::Ref { .. } => Ok(()),
                    other => Err(SchemaError::new(
                        &at.child(tag.as_str()),
                        format!("expected string, found {}", other.name()),
                    )),
                }
            }
            Schema::Script => crate::script::check(node, at),
        }
    }
}

fn expect(ok: bool, expected: &str, node: &Node, at: &Path) -> Result<(), SchemaError> {
    match ok {
        true => Ok(()),
        false => Err(SchemaError::new(
            at,
            format!("expected {expected}, found {}", node.kind.name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> Schema {
        Schema::Union {
            tag: "do".into(),
            variants: BTreeMap::from([(
                "exec".to_string(),
                Schema::closed(vec![
                    FieldSchema::required("do", Schema::String),
                    FieldSchema::required("args", Schema::list(Schema::String)),
                    FieldSchema::optional("network", Schema::one_of(&["sandbox", "host"])),
                ]),
            )]),
        }
    }

    #[test]
    fn test_union_dispatch() {
        let ok = Node::structure([
            ("do", Node::string("exec")),
            ("args", Node::list([Node::string("echo")])),
        ]);
        assert!(op().check(&ok, &Path::root()).is_ok());

        let bogus = Node::structure([("do", Node::string("bogus"))]);
        let err = op().check(&bogus, &Path::root()).unwrap_err();
        assert_eq!(err.path, Path::parse("do"));
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn test_closed_struct() {
        let node = Node::structure([
            ("do", Node::string("exec")),
            ("args", Node::list([])),
            ("extra", Node::int(1)),
        ]);
        assert!(op().check(&node, &Path::root()).is_err());
    }

    #[test]
    fn test_incomplete_values_pass_when_compatible() {
        let node = Node::structure([
            ("do", Node::string("exec")),
            ("args", Node::list([Node::typed(Constraint::String), Node::top()])),
            ("network", Node::reference("config.network")),
        ]);
        assert!(op().check(&node, &Path::root()).is_ok());

        let wrong = Node::structure([
            ("do", Node::string("exec")),
            ("args", Node::list([Node::typed(Constraint::Int)])),
        ]);
        assert!(op().check(&wrong, &Path::root()).is_err());
    }
}
