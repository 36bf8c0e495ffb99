//! Turning source text into documents.
//!
//! The engine only depends on the [`Compiler`] trait. [`JsonCompiler`] reads
//! plain JSON extended with a few conventions:
//!
//! * `{"$ref": "a.b"}` is a reference to the absolute path `a.b`,
//! * `{"$type": "string"}` is a placeholder constrained to a type (`"_"`
//!   leaves it open),
//! * keys starting with `#` are definitions, e.g. the `#up` compute script.
//!
//! Other keys next to `$ref`/`$type` are unified with it, so
//! `{"$type": "string", "#up": [...]}` is a component exporting a string.

use serde_json::Value as Json;

use crate::error::CompileError;
use crate::value::{Constraint, Node, Path, Value};

pub trait Compiler {
    fn compile(&self, name: &str, source: &str) -> Result<Value, CompileError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCompiler;

impl Compiler for JsonCompiler {
    fn compile(&self, name: &str, source: &str) -> Result<Value, CompileError> {
        let data: Json = serde_json::from_str(source).map_err(|source| CompileError::Syntax {
            name: name.to_string(),
            source,
        })?;
        Ok(Value::new(convert(name, data, &Path::root())?))
    }
}

fn invalid(name: &str, at: &Path, message: impl std::fmt::Display) -> CompileError {
    CompileError::Invalid {
        name: name.to_string(),
        message: format!("{at}: {message}"),
    }
}

fn convert(name: &str, data: Json, at: &Path) -> Result<Node, CompileError> {
    match data {
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                out.push(convert(name, item, &at.child(i))?);
            }
            Ok(Node::list(out))
        }
        Json::Object(mut map) => {
            let mut base = match (map.remove("$ref"), map.remove("$type")) {
                (Some(Json::String(target)), None) => Node::reference(Path::parse(&target)),
                (None, Some(Json::String(kind))) => match Constraint::parse(&kind) {
                    Some(constraint) => Node::typed(constraint),
                    None => return Err(invalid(name, at, format!("unknown $type {kind:?}"))),
                },
                (None, None) => Node::structure::<String>([]),
                (Some(_), Some(_)) => {
                    return Err(invalid(name, at, "$ref and $type are exclusive"));
                }
                _ => return Err(invalid(name, at, "$ref and $type must be strings")),
            };

            let mut fields = Vec::new();
            for (label, value) in map {
                let node = convert(name, value, &at.child(label.as_str()))?;
                if label.starts_with('#') {
                    base.defs.insert(label, node);
                } else {
                    fields.push((label, node));
                }
            }

            if fields.is_empty() {
                return Ok(base);
            }

            base.merge(&Node::structure(fields))
                .map_err(|e| invalid(name, at, e))
        }
        scalar => Node::try_from_data(scalar, at).map_err(|e| CompileError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kind;

    #[test]
    fn test_conventions() {
        let value = JsonCompiler
            .compile(
                "plan",
                r##"{
                    "repository": {"#up": [{"do": "local", "dir": "."}]},
                    "build": {
                        "$type": "string",
                        "#up": [{"do": "load", "from": {"$ref": "repository"}}]
                    },
                    "open": {"$type": "_"}
                }"##,
            )
            .unwrap();

        assert!(value.lookup("repository.#up[0].dir").exists());
        assert_eq!(
            value.lookup("build").node().unwrap().kind,
            Kind::Top(Constraint::String)
        );
        assert!(matches!(
            value.lookup("build.#up[0].from").node().unwrap().kind,
            Kind::Ref { .. }
        ));
        assert!(!value.lookup("open").is_concrete_recursive());
        assert_eq!(value.json_partial().unwrap(), r#"{"repository":{}}"#);
    }

    #[test]
    fn test_reference_with_fields() {
        let value = JsonCompiler
            .compile("t", r#"{"a": {"x": 1}, "b": {"$ref": "a", "y": 2}}"#)
            .unwrap();
        let resolved = value.resolved().unwrap();
        assert_eq!(resolved.lookup("b").json().unwrap(), r#"{"x":1,"y":2}"#);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            JsonCompiler.compile("bad", "{").unwrap_err(),
            CompileError::Syntax { .. }
        ));
        assert!(matches!(
            JsonCompiler.compile("bad", r#"{"$type": "decimal"}"#).unwrap_err(),
            CompileError::Invalid { .. }
        ));
        assert!(matches!(
            JsonCompiler.compile("bad", r#"{"$type": "string", "x": 1}"#).unwrap_err(),
            CompileError::Invalid { .. }
        ));
        assert!(matches!(
            JsonCompiler.compile("bad", r#"{"big": 18446744073709551615}"#).unwrap_err(),
            CompileError::Invalid { message, .. } if message.contains("out of range")
        ));
    }
}
