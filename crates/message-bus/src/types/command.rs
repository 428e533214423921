//! Control-plane commands addressed to application workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::new_message_id;
use crate::config::RoutingConfig;

/// An instruction for a named worker, e.g. `collect_metrics` or `start`.
///
/// Arguments may be given positionally (`args`) or by keyword (`kwargs`);
/// handlers read them through [`ApiCommand::argument`], which checks the
/// positional slot first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCommand {
    /// Envelope identifier.
    #[serde(default = "new_message_id")]
    pub message_id: String,

    /// When the command was created.
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Worker the command is addressed to.
    pub worker_name: String,

    /// Command verb.
    pub command: String,

    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ApiCommand {
    /// Create a command with keyword arguments only.
    pub fn command(
        worker_name: impl Into<String>,
        command: impl Into<String>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            timestamp: Utc::now(),
            worker_name: worker_name.into(),
            command: command.into(),
            args: Vec::new(),
            kwargs,
        }
    }

    /// Set the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Default routing for commands.
    pub fn default_routing_config() -> RoutingConfig {
        RoutingConfig::api_commands()
    }

    /// Look up an argument by position, falling back to its keyword name.
    pub fn argument(&self, position: usize, name: &str) -> Option<&Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    /// Look up a string argument by position or keyword name.
    pub fn str_argument(&self, position: usize, name: &str) -> Option<&str> {
        self.argument(position, name).and_then(Value::as_str)
    }

    /// Look up a keyword-only argument.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}
