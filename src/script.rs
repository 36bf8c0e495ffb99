use crate::error::{EngineError, SchemaError, ValueError};
use crate::op::OP_SCHEMA;
use crate::value::{Kind, Node, Path, Value};

/// Label of the attached compute script.
pub const SCRIPT_FIELD: &str = "#up";

/// Ordered list of operations, normalized from one of the three shapes a
/// script can take: a node with an attached `#up` list, a single operation,
/// or a list of operations.
#[derive(Clone, Debug)]
pub struct Script {
    value: Value,
    ops: Vec<Value>,
}

impl Script {
    pub fn parse(value: &Value) -> Result<Script, EngineError> {
        let attached = value.lookup(SCRIPT_FIELD);
        let ops = if attached.exists() {
            match attached.list() {
                Ok(ops) => ops,
                Err(ValueError::WrongKind { found, .. }) => {
                    return Err(SchemaError::new(
                        attached.path(),
                        format!("expected list of operations, found {found}"),
                    )
                    .into());
                }
                Err(err) => return Err(err.into()),
            }
        } else if value.lookup("do").exists() {
            vec![value.clone()]
        } else if let Ok(ops) = value.list() {
            ops
        } else {
            return Err(SchemaError::new(
                value.path(),
                format!("not executable: {}", value.source()),
            )
            .into());
        };

        Ok(Script {
            value: value.clone(),
            ops,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn ops(&self) -> &[Value] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Calls `f` on every operation, then on every operation of the nested
    /// scripts reachable through `from` and exec mounts.
    pub fn analyze<E>(&self, f: &mut impl FnMut(&Value) -> Result<(), E>) -> Result<(), E> {
        for op in &self.ops {
            analyze_op(op, f)?;
        }
        Ok(())
    }

    /// True when this script and every nested script are fully concrete.
    pub fn is_ready(&self) -> bool {
        self.first_incomplete().is_none()
    }

    /// Path of the first incomplete location across all nested scripts.
    pub fn first_incomplete(&self) -> Option<Path> {
        let result = self.analyze(&mut |op: &Value| match op.check_concrete() {
            Ok(()) => Ok(()),
            Err(err) => Err(err.path().clone()),
        });
        result.err()
    }
}

/// Static walk over a script that may not be executable yet. Values that do
/// not parse as a script are skipped silently.
pub fn analyze<E>(value: &Value, f: &mut impl FnMut(&Value) -> Result<(), E>) -> Result<(), E> {
    match Script::parse(value) {
        Ok(script) => script.analyze(f),
        Err(_) => Ok(()),
    }
}

fn analyze_op<E>(op: &Value, f: &mut impl FnMut(&Value) -> Result<(), E>) -> Result<(), E> {
    f(op)?;

    let Ok(kind) = op.lookup("do").as_str() else {
        return Ok(());
    };

    match kind.as_str() {
        "copy" | "load" => analyze(&op.lookup("from"), f),
        "exec" => {
            let Ok(mounts) = op.lookup("mount").fields() else {
                return Ok(());
            };
            for mount in mounts {
                let from = mount.value.lookup("from");
                if from.exists() {
                    analyze(&from, f)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Structural check backing [`crate::value::Schema::Script`].
pub(crate) fn check(node: &Node, at: &Path) -> Result<(), SchemaError> {
    if let Some(attached) = node.defs.get(SCRIPT_FIELD) {
        let at = at.child(SCRIPT_FIELD);
        return match &attached.kind {
            Kind::List(ops) => ops
                .iter()
                .enumerate()
                .try_for_each(|(i, op)| OP_SCHEMA.check(op, &at.child(i))),
            Kind::Top(_) | Kind::Ref { .. } => Ok(()),
            other => Err(SchemaError::new(
                &at,
                format!("expected list, found {}", other.name()),
            )),
        };
    }

    match &node.kind {
        Kind::Struct(fields) if fields.contains_key("do") => OP_SCHEMA.check(node, at),
        Kind::List(ops) => ops
            .iter()
            .enumerate()
            .try_for_each(|(i, op)| OP_SCHEMA.check(op, &at.child(i))),
        Kind::Top(_) | Kind::Ref { .. } => Ok(()),
        _ => Err(SchemaError::new(at, "not executable")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::Constraint;

    #[test]
    fn test_parse_shapes() {
        let single = Value::from(json!({"do": "local", "dir": "."}));
        assert_eq!(Script::parse(&single).unwrap().len(), 1);

        let list = Value::from(json!([{"do": "local", "dir": "."}, {"do": "subdir", "dir": "/a"}]));
        assert_eq!(Script::parse(&list).unwrap().len(), 2);

        let component = Value::new(Node::structure([("out", Node::typed(Constraint::String))]).with_field(
            SCRIPT_FIELD,
            Node::list([Node::structure([("do", Node::string("load")), ("from", Node::top())])]),
        ));
        let script = Script::parse(&component).unwrap();
        assert_eq!(script.len(), 1);
        assert_eq!(script.ops()[0].path(), &Path::parse("#up[0]"));

        let scalar = Value::from(json!("nope"));
        assert!(Script::parse(&scalar).unwrap_err().is_schema());

        let attached = Value::new(Node::structure::<&str>([]).with_field(
            SCRIPT_FIELD,
            Node::from_data(json!({"do": "mkdir", "path": "/a"})),
        ));
        let err = Script::parse(&attached).unwrap_err();
        assert!(err.is_schema());
        assert_eq!(err.paths(), vec![&Path::parse("#up")]);

        let open = Value::new(Node::structure::<&str>([]).with_field(SCRIPT_FIELD, Node::top()));
        assert!(!Script::parse(&open).unwrap_err().is_schema());
    }

    #[test]
    fn test_analyze_reaches_every_mount() {
        let value = Value::from(json!({
            "do": "exec",
            "args": ["true"],
            "mount": {
                "/a": {"from": {"do": "local", "dir": "a"}},
                "/b": {"from": {"do": "local", "dir": "b"}},
            },
        }));

        let mut dirs = Vec::new();
        analyze(&value, &mut |op: &Value| -> Result<(), ()> {
            if let Ok(dir) = op.lookup("dir").as_str() {
                dirs.push(dir);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(dirs, vec!["a", "b"]);
    }

    #[test]
    fn test_readiness_follows_nested_scripts() {
        let nested = Node::structure::<&str>([]).with_field(
            SCRIPT_FIELD,
            Node::list([Node::structure([
                ("do", Node::string("fetch-container")),
                ("ref", Node::typed(Constraint::String)),
            ])]),
        );
        let value = Value::new(Node::list([Node::structure([
            ("do", Node::string("load")),
            ("from", nested),
        ])]));

        let script = Script::parse(&value).unwrap();
        assert!(value.is_concrete_recursive());
        assert!(!script.is_ready());
        assert_eq!(
            script.first_incomplete(),
            Some(Path::parse("[0].from.#up[0].ref"))
        );
    }

    #[test]
    fn test_schema_check() {
        let ok = Node::list([Node::structure([
            ("do", Node::string("subdir")),
            ("dir", Node::string("/a")),
        ])]);
        assert!(check(&ok, &Path::root()).is_ok());
        assert!(check(&Node::int(1), &Path::root()).is_err());
    }
}
