use crate::types::{Task, TaskSpec, TaskStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A category-specific rule that expands a composite task into child specs.
///
/// Rules are injected at orchestrator construction and looked up by the
/// task's `category`; there is no subclassing hook.
pub trait DecompositionRule: Send + Sync {
    /// Produce the child task specs for the given parent.
    ///
    /// A child spec without an explicit priority inherits the parent's.
    fn decompose(&self, parent: &Task) -> Vec<TaskSpec>;
}

impl<F> DecompositionRule for F
where
    F: Fn(&Task) -> Vec<TaskSpec> + Send + Sync,
{
    fn decompose(&self, parent: &Task) -> Vec<TaskSpec> {
        self(parent)
    }
}

/// Expands tasks using a registry of category-keyed decomposition rules.
///
/// Atomic tasks (no rule for their category) come back as a one-element list,
/// so the rest of the pipeline always operates on a list of subtasks.
pub struct Decomposer {
    rules: HashMap<String, Arc<dyn DecompositionRule>>,
    allow_nested: bool,
    max_depth: u32,
    priority_levels: u8,
}

impl Decomposer {
    /// Create a decomposer with no rules registered.
    pub fn new(allow_nested: bool, max_depth: u32, priority_levels: u8) -> Self {
        Self {
            rules: HashMap::new(),
            allow_nested,
            max_depth,
            priority_levels,
        }
    }

    /// Register a rule for a task category, replacing any previous one.
    pub fn register(&mut self, category: impl Into<String>, rule: Arc<dyn DecompositionRule>) {
        self.rules.insert(category.into(), rule);
    }

    /// Whether a rule exists for the category.
    pub fn has_rule(&self, category: &str) -> bool {
        self.rules.contains_key(category)
    }

    fn rule_for(&self, task: &Task) -> Option<&Arc<dyn DecompositionRule>> {
        task.category.as_deref().and_then(|c| self.rules.get(c))
    }

    /// Expand a task into its subtasks.
    ///
    /// Returns `[task]` unchanged for atomic tasks. For composite tasks,
    /// children inherit the parent's priority unless their spec overrides it
    /// and start with a halved retry budget. Nested expansion only happens
    /// when enabled and within the depth bound.
    pub fn expand(&self, task: Task) -> Vec<Task> {
        let Some(rule) = self.rule_for(&task) else {
            return vec![task];
        };

        let specs = rule.decompose(&task);
        debug!(task_id = %task.id, category = ?task.category, children = specs.len(), "decomposed task");

        let mut children = Vec::with_capacity(specs.len());
        for spec in specs {
            let child = self.child_from_spec(&task, spec);
            if self.allow_nested
                && child.depth < self.max_depth
                && child
                    .category
                    .as_deref()
                    .is_some_and(|c| self.rules.contains_key(c))
            {
                children.extend(self.expand(child));
            } else {
                children.push(child);
            }
        }
        children
    }

    fn child_from_spec(&self, parent: &Task, spec: TaskSpec) -> Task {
        let priority = spec
            .priority
            .unwrap_or(parent.priority)
            .clamp(1, self.priority_levels);
        // Parent metadata carries through; the rule's entries win on conflict.
        let mut metadata = parent.metadata.clone();
        metadata.extend(spec.metadata);
        Task {
            id: Uuid::new_v4(),
            payload: spec.payload,
            category: spec.category,
            priority,
            metadata,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: parent.max_retries / 2,
            parent: Some(parent.id),
            depth: parent.depth + 1,
            subtasks: Vec::new(),
        }
    }
}
