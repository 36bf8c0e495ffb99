use crate::script::{SCRIPT_FIELD, Script};
use crate::value::{Path, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Discovered, waiting for its inputs.
    Pending,
    Running,
    /// Ran to completion; its result is committed to the output layer.
    Terminated,
    /// Rejected because of its own shape; siblings are unaffected.
    Failed,
}

/// One component found in the merged document.
#[derive(Clone, Debug)]
pub struct Task {
    value: Value,
    state: TaskState,
}

impl Task {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            state: TaskState::Pending,
        }
    }

    pub fn path(&self) -> &Path {
        self.value.path()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Points the task at the component found by a later pass.
    pub(crate) fn refresh(&mut self, value: Value) {
        self.value = value;
    }

    /// True once the script and every script nested in it are concrete.
    ///
    /// A script that does not even parse is reported ready as soon as it is
    /// concrete, so running it surfaces the error.
    pub fn is_ready(&self) -> bool {
        match Script::parse(&self.value) {
            Ok(script) => script.is_ready(),
            Err(_) => self.value.lookup(SCRIPT_FIELD).is_concrete_recursive(),
        }
    }
}

/// Every component of `state`, at any depth, in document order.
pub fn discover(state: &Value) -> Vec<Task> {
    let mut found = Vec::new();
    state.walk(
        |value| {
            if value.lookup(SCRIPT_FIELD).exists() {
                found.push(Task::new(value.clone()));
            }
            true
        },
        |_| {},
    );
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Node;

    fn component(ops: serde_json::Value) -> Node {
        Node::structure::<&str>([]).with_field(SCRIPT_FIELD, Node::from_data(ops))
    }

    #[test]
    fn test_discover_nested() {
        let state = Value::new(Node::structure([
            ("a", component(serde_json::json!([{"do": "mkdir", "path": "/a"}]))),
            (
                "group",
                Node::structure([(
                    "b",
                    component(serde_json::json!([{"do": "mkdir", "path": "/b"}])),
                )]),
            ),
            ("plain", Node::string("x")),
        ]));

        let paths: Vec<String> = discover(&state).iter().map(|t| t.path().to_string()).collect();
        assert_eq!(paths, vec!["a", "group.b"]);
    }

    #[test]
    fn test_readiness_follows_nested_scripts() {
        let state = Value::new(Node::structure([(
            "test",
            Node::structure::<&str>([]).with_field(
                SCRIPT_FIELD,
                Node::list([Node::structure([
                    ("do", Node::string("copy")),
                    (
                        "from",
                        Node::list([Node::structure([
                            ("do", Node::string("mkfile")),
                            ("dest", Node::string("/v")),
                            ("content", Node::reference("build.version")),
                        ])]),
                    ),
                ])]),
            ),
        )]));

        let tasks = discover(&state);
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].is_ready());
        assert_eq!(tasks[0].state(), TaskState::Pending);

        let resolved = Value::new(Node::structure([
            ("build", Node::structure([("version", Node::string("1.0"))])),
            ("test", state.lookup("test").node_or_top()),
        ]))
        .resolved()
        .unwrap();
        let tasks = discover(&resolved);
        assert!(tasks[0].is_ready());
    }
}
