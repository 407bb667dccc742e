//! Backend Registry — identity, class and timeout metadata
//!
//! The set of known backends is fixed at startup. Each backend belongs to a
//! [`BackendClass`] that the selector reasons about, carries its own
//! invocation timeout, and holds a position in the fixed fallback order
//! (registration order).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Opaque name of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Capability class of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendClass {
    /// Fast, lightweight, good at pattern matching
    Fast,
    /// Slow, deep reasoning and architecture
    DeepReasoning,
    /// Specialized code generation
    CodeGeneration,
    /// Practical implementation and debugging
    Practical,
    /// Cheapest per token
    Economy,
}

impl BackendClass {
    /// Default invocation timeout for backends of this class.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Fast | Self::Economy => Duration::from_secs(60),
            Self::Practical => Duration::from_secs(120),
            Self::CodeGeneration => Duration::from_secs(180),
            Self::DeepReasoning => Duration::from_secs(300),
        }
    }

    /// Classes that give a complementary perspective to this one, best first.
    pub fn complements(&self) -> &'static [BackendClass] {
        use BackendClass::*;
        match self {
            DeepReasoning => &[Practical, CodeGeneration, Fast, Economy],
            Practical => &[DeepReasoning, CodeGeneration, Fast, Economy],
            CodeGeneration => &[DeepReasoning, Practical, Fast, Economy],
            Fast => &[DeepReasoning, Practical, CodeGeneration, Economy],
            Economy => &[DeepReasoning, Practical, CodeGeneration, Fast],
        }
    }
}

impl std::fmt::Display for BackendClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::DeepReasoning => write!(f, "deep_reasoning"),
            Self::CodeGeneration => write!(f, "code_generation"),
            Self::Practical => write!(f, "practical"),
            Self::Economy => write!(f, "economy"),
        }
    }
}

/// A registered backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendProfile {
    pub id: BackendId,
    pub class: BackendClass,
    /// Upper bound for a single invocation
    pub timeout: Duration,
}

impl BackendProfile {
    /// Profile with the class default timeout.
    pub fn new(id: impl Into<BackendId>, class: BackendClass) -> Self {
        Self {
            id: id.into(),
            timeout: class.default_timeout(),
            class,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Registry of all known backends, in fallback order
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    profiles: Vec<BackendProfile>,
    index: HashMap<BackendId, usize>,
}

impl BackendRegistry {
    /// Build a registry. Duplicate ids keep their first registration.
    pub fn new(profiles: impl IntoIterator<Item = BackendProfile>) -> Self {
        let mut registry = Self::default();
        for profile in profiles {
            if registry.index.contains_key(&profile.id) {
                tracing::warn!(backend = %profile.id, "Duplicate backend registration ignored");
                continue;
            }
            registry
                .index
                .insert(profile.id.clone(), registry.profiles.len());
            registry.profiles.push(profile);
        }
        registry
    }

    pub fn get(&self, id: &BackendId) -> Option<&BackendProfile> {
        self.index.get(id).map(|&i| &self.profiles[i])
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.index.contains_key(id)
    }

    pub fn class_of(&self, id: &BackendId) -> Option<BackendClass> {
        self.get(id).map(|p| p.class)
    }

    /// Invocation timeout for `id`; unknown backends get the slowest class budget.
    pub fn timeout_for(&self, id: &BackendId) -> Duration {
        self.get(id)
            .map(|p| p.timeout)
            .unwrap_or_else(|| BackendClass::DeepReasoning.default_timeout())
    }

    /// Position in the fixed fallback order.
    pub fn position(&self, id: &BackendId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// All backend ids in fallback order.
    pub fn ids(&self) -> Vec<BackendId> {
        self.profiles.iter().map(|p| p.id.clone()).collect()
    }

    pub fn profiles(&self) -> &[BackendProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
