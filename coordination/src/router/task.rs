//! Task profiles
//!
//! A [`TaskProfile`] is the caller's description of a unit of work. It is
//! immutable once built and only consumed by the selector.

use serde::{Deserialize, Serialize};

/// How demanding a task is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Subject area of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Security,
    Architecture,
    Debugging,
    Performance,
    General,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Architecture => write!(f, "architecture"),
            Self::Debugging => write!(f, "debugging"),
            Self::Performance => write!(f, "performance"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Description of a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProfile {
    complexity: Complexity,
    token_budget: u32,
    requires_deep_reasoning: bool,
    requires_code_generation: bool,
    requires_speed: bool,
    requires_creativity: bool,
    domain: Option<Domain>,
}

impl Default for TaskProfile {
    fn default() -> Self {
        Self {
            complexity: Complexity::Medium,
            token_budget: 8_000,
            requires_deep_reasoning: false,
            requires_code_generation: false,
            requires_speed: false,
            requires_creativity: false,
            domain: None,
        }
    }
}

impl TaskProfile {
    pub fn builder() -> TaskProfileBuilder {
        TaskProfileBuilder::default()
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    pub fn token_budget(&self) -> u32 {
        self.token_budget
    }

    pub fn requires_deep_reasoning(&self) -> bool {
        self.requires_deep_reasoning
    }

    pub fn requires_code_generation(&self) -> bool {
        self.requires_code_generation
    }

    pub fn requires_speed(&self) -> bool {
        self.requires_speed
    }

    pub fn requires_creativity(&self) -> bool {
        self.requires_creativity
    }

    pub fn domain(&self) -> Option<Domain> {
        self.domain
    }
}

/// Builder for [`TaskProfile`]
#[derive(Debug, Clone, Default)]
pub struct TaskProfileBuilder {
    profile: TaskProfile,
}

impl TaskProfileBuilder {
    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.profile.complexity = complexity;
        self
    }

    pub fn token_budget(mut self, tokens: u32) -> Self {
        self.profile.token_budget = tokens;
        self
    }

    pub fn deep_reasoning(mut self) -> Self {
        self.profile.requires_deep_reasoning = true;
        self
    }

    pub fn code_generation(mut self) -> Self {
        self.profile.requires_code_generation = true;
        self
    }

    pub fn speed(mut self) -> Self {
        self.profile.requires_speed = true;
        self
    }

    pub fn creativity(mut self) -> Self {
        self.profile.requires_creativity = true;
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.profile.domain = Some(domain);
        self
    }

    pub fn build(self) -> TaskProfile {
        self.profile
    }
}
