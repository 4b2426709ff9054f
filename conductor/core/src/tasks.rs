//! Task Types
//!
//! A [`Task`] is one unit of generation work submitted by an external caller
//! (the project wizard, a build pipeline, a test harness). Tasks are
//! immutable once submitted: the dispatcher only reads them.
//!
//! # Prompt Rendering
//!
//! Every task type carries a short role preamble that is prepended to the
//! caller's description before the prompt is handed to a backend. Callers
//! that need full control over the prompt should put it in the description;
//! the preamble is fixed per task type.

use serde::{Deserialize, Serialize};

use crate::routing::config::Tier;

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a task asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Technical specifications and architecture plans
    Planning,
    /// Writing code
    Coding,
    /// Reviewing code for quality and security
    Review,
    /// Writing tests
    Testing,
    /// Writing documentation
    Documentation,
    /// Finding and fixing defects
    Debugging,
    /// Deployment configuration
    Deployment,
}

impl TaskType {
    /// Every task type, in declaration order
    pub const ALL: [TaskType; 7] = [
        Self::Planning,
        Self::Coding,
        Self::Review,
        Self::Testing,
        Self::Documentation,
        Self::Debugging,
        Self::Deployment,
    ];

    /// Parse a task type (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "planning" | "plan" => Some(Self::Planning),
            "coding" | "code" => Some(Self::Coding),
            "review" => Some(Self::Review),
            "testing" | "test" => Some(Self::Testing),
            "documentation" | "docs" => Some(Self::Documentation),
            "debugging" | "debug" => Some(Self::Debugging),
            "deployment" | "deploy" => Some(Self::Deployment),
            _ => None,
        }
    }

    /// Canonical lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Debugging => "debugging",
            Self::Deployment => "deployment",
        }
    }

    /// Role preamble prepended to prompts of this type
    #[must_use]
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Planning => {
                "You are a Product Manager. Create a detailed technical specification."
            }
            Self::Coding => "You are a Senior Full-Stack Developer. Write production-ready code.",
            Self::Review => "You are a Lead Engineer. Review code for quality and security.",
            Self::Testing => "You are a QA Engineer. Create comprehensive tests.",
            Self::Documentation => "You are a Technical Writer. Create clear documentation.",
            Self::Debugging => "You are a Senior Debugger. Find and fix issues.",
            Self::Deployment => "You are a DevOps Engineer. Set up deployment configurations.",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How demanding a task is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short, routine work
    Simple,
    /// Typical work
    #[default]
    Medium,
    /// Long or subtle work
    Complex,
}

impl Complexity {
    /// Parse a complexity level (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" | "easy" => Some(Self::Simple),
            "medium" | "moderate" => Some(Self::Medium),
            "complex" | "hard" => Some(Self::Complex),
            _ => None,
        }
    }

    /// Backend tier that best fits this complexity
    #[must_use]
    pub fn preferred_tier(&self) -> Tier {
        match self {
            Self::Simple => Tier::Fast,
            Self::Medium => Tier::Balanced,
            Self::Complex => Tier::Powerful,
        }
    }
}

/// A unit of work for some model backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    #[serde(default = "TaskId::generate")]
    pub id: TaskId,
    /// Kind of work
    pub task_type: TaskType,
    /// What the caller wants done
    pub description: String,
    /// How demanding the work is
    #[serde(default)]
    pub complexity: Complexity,
    /// Higher = more urgent
    #[serde(default)]
    pub priority: i32,
}

impl Task {
    /// Create a medium-complexity task with a generated ID
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            task_type,
            description: description.into(),
            complexity: Complexity::Medium,
            priority: 0,
        }
    }

    /// Set the task ID
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = TaskId::new(id);
        self
    }

    /// Set complexity
    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Full prompt sent to a backend: role preamble, blank line, description
    #[must_use]
    pub fn render_prompt(&self) -> String {
        format!("{}\n\n{}", self.task_type.instruction(), self.description)
    }
}
