use crate::error::ValueError;
use crate::value::{Node, Value};

/// Write-back target for computed results.
pub trait Fillable: Send + Sync {
    fn fill(&self, node: Node) -> Result<(), ValueError>;
}

/// Accepts anything and keeps nothing; used by nested sub-pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Fillable for Discard {
    fn fill(&self, _: Node) -> Result<(), ValueError> {
        Ok(())
    }
}

impl Fillable for Value {
    fn fill(&self, node: Node) -> Result<(), ValueError> {
        Value::fill(self, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_sink() {
        let out = Value::empty();
        let sink: &dyn Fillable = &out.lookup("a");
        sink.fill(Node::string("x")).unwrap();
        sink.fill(Node::string("x")).unwrap();
        assert!(sink.fill(Node::string("y")).is_err());
        assert_eq!(out.json().unwrap(), r#"{"a":"x"}"#);

        assert!(Discard.fill(Node::int(1)).is_ok());
    }
}
