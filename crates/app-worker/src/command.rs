//! Verb lookup for control commands.

use std::collections::HashMap;

use crate::error::{Result, WorkerError};

/// Verb that makes the worker publish conversation metrics.
pub const COLLECT_METRICS: &str = "collect_metrics";

/// Verb that makes the worker repair cached batch counters.
pub const RECONCILE_CACHE: &str = "reconcile_cache";

/// What a verb is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    CollectMetrics,
    ReconcileCache,
    /// A verb declared by the application.
    Application(String),
}

/// Verb table built once at startup.
///
/// Built-in verbs are always present. Application verbs may not be empty
/// and may not collide with each other or with a built-in.
#[derive(Debug, Clone)]
pub struct CommandTable {
    verbs: HashMap<String, Verb>,
}

impl CommandTable {
    pub fn new<I, S>(application_verbs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut verbs = Self::builtin().verbs;
        for verb in application_verbs {
            let verb = verb.as_ref();
            if verb.trim().is_empty() {
                return Err(WorkerError::CommandTable("empty verb".to_string()));
            }
            if verbs.contains_key(verb) {
                return Err(WorkerError::CommandTable(format!(
                    "verb {:?} registered twice",
                    verb
                )));
            }
            verbs.insert(verb.to_string(), Verb::Application(verb.to_string()));
        }

        Ok(Self { verbs })
    }

    /// Built-in verbs only.
    pub fn builtin() -> Self {
        let verbs = HashMap::from([
            (COLLECT_METRICS.to_string(), Verb::CollectMetrics),
            (RECONCILE_CACHE.to_string(), Verb::ReconcileCache),
        ]);
        Self { verbs }
    }

    pub fn resolve(&self, verb: &str) -> Option<&Verb> {
        self.verbs.get(verb)
    }

    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

/// How one dispatched command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A handler ran to completion.
    Handled,
    /// Dropped because the same key was already in flight.
    Duplicate,
    /// The verb is not in the command table.
    UnknownCommand,
    /// The handler failed.
    Failed(String),
}
