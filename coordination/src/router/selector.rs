//! Backend selection
//!
//! Picks a backend for a [`TaskProfile`] with an ordered rule cascade; the
//! first rule that matches and still has an eligible backend wins.
//!
//! ```text
//! Rule                              | Preferred class
//! ----------------------------------|------------------------------
//! speed + low complexity            | fast
//! deep reasoning                    | deep_reasoning
//! code generation + high complexity | code_generation
//! domain                            | see domain table
//! small token budget                | economy
//! high complexity                   | deep_reasoning
//! proven success rate (> floor)     | best success rate, any class
//! otherwise                         | first in fallback order
//! ```
//!
//! Backends the circuit breaker excludes are removed before any rule runs.
//! Selection only peeks at breaker state; it never consumes a half-open
//! trial.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circuit_breaker::CircuitBreaker;
use super::stats::BackendStats;
use super::task::{Complexity, Domain, TaskProfile};
use crate::registry::{BackendClass, BackendId, BackendRegistry};

/// Selector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Token budgets below this prefer the economy class
    pub small_budget_threshold: u32,
    /// Success rate a backend must exceed to win on track record alone
    pub confidence_floor: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            small_budget_threshold: 2_000,
            confidence_floor: 0.7,
        }
    }
}

/// Which rule produced a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    SpeedOnSimpleTask,
    DeepReasoning,
    ComplexCodeGeneration,
    Domain(Domain),
    SmallTokenBudget,
    HighComplexity,
    ProvenSuccessRate,
    FallbackOrder,
}

impl std::fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpeedOnSimpleTask => write!(f, "speed required on a low-complexity task"),
            Self::DeepReasoning => write!(f, "deep reasoning required"),
            Self::ComplexCodeGeneration => write!(f, "high-complexity code generation"),
            Self::Domain(domain) => write!(f, "{} domain preference", domain),
            Self::SmallTokenBudget => write!(f, "small token budget"),
            Self::HighComplexity => write!(f, "high complexity"),
            Self::ProvenSuccessRate => write!(f, "best historical success rate"),
            Self::FallbackOrder => write!(f, "first available in fallback order"),
        }
    }
}

/// Selection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub backend: BackendId,
    pub class: BackendClass,
    pub rule: SelectionRule,
}

/// Rule-based backend selector
#[derive(Debug, Clone)]
pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<BackendStats>,
    config: SelectorConfig,
}

impl BackendSelector {
    pub fn new(
        registry: Arc<BackendRegistry>,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<BackendStats>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            stats,
            config,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Known, non-excluded candidates in fallback order, without duplicates.
    pub fn available(&self, candidates: &[BackendId]) -> Vec<BackendId> {
        let mut available: Vec<BackendId> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !self.registry.contains(candidate) {
                debug!(backend = %candidate, "Ignoring unregistered candidate");
                continue;
            }
            if available.contains(candidate) {
                continue;
            }
            if !self.breaker.peek_available(candidate) {
                debug!(backend = %candidate, "Candidate excluded by circuit breaker");
                continue;
            }
            available.push(candidate.clone());
        }
        available.sort_by_key(|b| self.registry.position(b));
        available
    }

    /// Pick one backend for `task` from `candidates`.
    pub fn select(&self, task: &TaskProfile, candidates: &[BackendId]) -> Option<Selection> {
        let available = self.available(candidates);
        self.select_from(task, &available)
    }

    /// Primary pick followed by every other eligible candidate in fallback
    /// order.
    pub fn rank(&self, task: &TaskProfile, candidates: &[BackendId]) -> Vec<BackendId> {
        let available = self.available(candidates);
        let Some(primary) = self.select_from(task, &available) else {
            return Vec::new();
        };

        let mut ranked = Vec::with_capacity(available.len());
        ranked.push(primary.backend.clone());
        ranked.extend(available.into_iter().filter(|b| *b != primary.backend));
        ranked
    }

    /// Up to `count` distinct backends covering complementary classes.
    ///
    /// The primary pick comes first; the rest are drawn class by class from
    /// the primary's complements so parallel runs give different
    /// perspectives, then topped up with whatever remains.
    pub fn select_parallel_backends(&self, task: &TaskProfile, count: usize) -> Vec<BackendId> {
        if count == 0 {
            return Vec::new();
        }
        let available = self.available(&self.registry.ids());
        let Some(primary) = self.select_from(task, &available) else {
            return Vec::new();
        };

        let mut chosen = vec![primary.backend.clone()];
        for class in primary.class.complements() {
            if chosen.len() >= count {
                break;
            }
            let remaining: Vec<BackendId> = available
                .iter()
                .filter(|b| !chosen.contains(b))
                .cloned()
                .collect();
            if let Some(backend) = self.best_of_class(&remaining, *class) {
                chosen.push(backend);
            }
        }
        for backend in &available {
            if chosen.len() >= count {
                break;
            }
            if !chosen.contains(backend) {
                chosen.push(backend.clone());
            }
        }

        debug!(
            requested = count,
            selected = chosen.len(),
            primary = %primary.backend,
            "Parallel backends selected"
        );
        chosen
    }

    /// Re-run selection over every known backend except `failed`.
    pub fn select_fallback_backend(
        &self,
        failed: &BackendId,
        task: &TaskProfile,
    ) -> Option<Selection> {
        let candidates: Vec<BackendId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|b| b != failed)
            .collect();
        self.select(task, &candidates)
    }

    fn select_from(&self, task: &TaskProfile, available: &[BackendId]) -> Option<Selection> {
        if available.is_empty() {
            debug!("No available backends to select from");
            return None;
        }

        for (rule, class) in self.class_rules(task) {
            if let Some(backend) = self.best_of_class(available, class) {
                return Some(self.finish(backend, rule));
            }
        }

        if let Some((backend, rate)) = self.best_by_success_rate(available.iter()) {
            if rate > self.config.confidence_floor {
                return Some(self.finish(backend, SelectionRule::ProvenSuccessRate));
            }
        }

        available
            .first()
            .map(|backend| self.finish(backend.clone(), SelectionRule::FallbackOrder))
    }

    /// Class preferences whose conditions hold, in cascade order.
    fn class_rules(&self, task: &TaskProfile) -> Vec<(SelectionRule, BackendClass)> {
        let mut rules = Vec::new();
        if task.requires_speed() && task.complexity() == Complexity::Low {
            rules.push((SelectionRule::SpeedOnSimpleTask, BackendClass::Fast));
        }
        if task.requires_deep_reasoning() {
            rules.push((SelectionRule::DeepReasoning, BackendClass::DeepReasoning));
        }
        if task.requires_code_generation() && task.complexity() == Complexity::High {
            rules.push((
                SelectionRule::ComplexCodeGeneration,
                BackendClass::CodeGeneration,
            ));
        }
        if let Some(domain) = task.domain() {
            if let Some(class) = domain_preference(domain, task) {
                rules.push((SelectionRule::Domain(domain), class));
            }
        }
        if task.token_budget() < self.config.small_budget_threshold {
            rules.push((SelectionRule::SmallTokenBudget, BackendClass::Economy));
        }
        if task.complexity() == Complexity::High {
            rules.push((SelectionRule::HighComplexity, BackendClass::DeepReasoning));
        }
        rules
    }

    /// Best backend of `class`, by success rate then fallback order.
    fn best_of_class(&self, available: &[BackendId], class: BackendClass) -> Option<BackendId> {
        let of_class = available
            .iter()
            .filter(|b| self.registry.class_of(b) == Some(class));
        self.best_by_success_rate(of_class).map(|(b, _)| b)
    }

    /// Highest success rate; ties keep the earliest backend.
    fn best_by_success_rate<'a>(
        &self,
        backends: impl Iterator<Item = &'a BackendId>,
    ) -> Option<(BackendId, f64)> {
        let mut best: Option<(&BackendId, f64)> = None;
        for backend in backends {
            let rate = self.stats.success_rate(backend);
            match best {
                Some((_, best_rate)) if rate <= best_rate => {}
                _ => best = Some((backend, rate)),
            }
        }
        best.map(|(b, rate)| (b.clone(), rate))
    }

    fn finish(&self, backend: BackendId, rule: SelectionRule) -> Selection {
        let class = self
            .registry
            .class_of(&backend)
            .unwrap_or(BackendClass::Practical);
        debug!(backend = %backend, class = %class, reason = %rule, "Backend selected");
        Selection {
            backend,
            class,
            rule,
        }
    }
}

/// Domain → preferred class.
fn domain_preference(domain: Domain, task: &TaskProfile) -> Option<BackendClass> {
    match domain {
        Domain::Security => Some(BackendClass::Fast),
        Domain::Architecture => Some(BackendClass::DeepReasoning),
        Domain::Debugging => Some(BackendClass::Practical),
        Domain::Performance if task.requires_code_generation() => {
            Some(BackendClass::CodeGeneration)
        }
        Domain::Performance => Some(BackendClass::DeepReasoning),
        Domain::General => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::BackendProfile;
    use crate::router::circuit_breaker::BreakerConfig;
    use std::time::Duration;

    struct Fixture {
        selector: BackendSelector,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<BackendStats>,
        all: Vec<BackendId>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let registry = Arc::new(BackendRegistry::new([
            BackendProfile::new("fast", BackendClass::Fast),
            BackendProfile::new("deep", BackendClass::DeepReasoning),
            BackendProfile::new("coder", BackendClass::CodeGeneration),
            BackendProfile::new("practical", BackendClass::Practical),
            BackendProfile::new("cheap", BackendClass::Economy),
        ]));
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 60_000,
            },
            clock.clone(),
        ));
        let stats = Arc::new(BackendStats::new(clock));
        let all = registry.ids();
        Fixture {
            selector: BackendSelector::new(
                registry,
                breaker.clone(),
                stats.clone(),
                SelectorConfig::default(),
            ),
            breaker,
            stats,
            all,
        }
    }

    fn pick(f: &Fixture, task: &TaskProfile) -> Selection {
        f.selector.select(task, &f.all).unwrap()
    }

    #[test]
    fn test_speed_on_simple_task_prefers_fast() {
        let f = fixture();
        let task = TaskProfile::builder()
            .speed()
            .complexity(Complexity::Low)
            .deep_reasoning()
            .build();
        let s = pick(&f, &task);
        assert_eq!(s.backend, BackendId::from("fast"));
        assert_eq!(s.rule, SelectionRule::SpeedOnSimpleTask);
    }

    #[test]
    fn test_deep_reasoning_rule() {
        let f = fixture();
        let task = TaskProfile::builder().deep_reasoning().build();
        assert_eq!(pick(&f, &task).backend, BackendId::from("deep"));
    }

    #[test]
    fn test_complex_code_generation_rule() {
        let f = fixture();
        let task = TaskProfile::builder()
            .code_generation()
            .complexity(Complexity::High)
            .build();
        let s = pick(&f, &task);
        assert_eq!(s.backend, BackendId::from("coder"));
        assert_eq!(s.rule, SelectionRule::ComplexCodeGeneration);
    }

    #[test]
    fn test_domain_table() {
        let f = fixture();
        let cases = [
            (Domain::Security, false, "fast"),
            (Domain::Architecture, false, "deep"),
            (Domain::Debugging, false, "practical"),
            (Domain::Performance, true, "coder"),
            (Domain::Performance, false, "deep"),
        ];
        for (domain, generation, expected) in cases {
            let mut builder = TaskProfile::builder().domain(domain);
            if generation {
                builder = builder.code_generation();
            }
            let s = pick(&f, &builder.build());
            assert_eq!(s.backend, BackendId::from(expected), "domain {}", domain);
            assert_eq!(s.rule, SelectionRule::Domain(domain));
        }
    }

    #[test]
    fn test_small_budget_prefers_economy() {
        let f = fixture();
        let task = TaskProfile::builder().token_budget(500).build();
        let s = pick(&f, &task);
        assert_eq!(s.backend, BackendId::from("cheap"));
        assert_eq!(s.rule, SelectionRule::SmallTokenBudget);
    }

    #[test]
    fn test_high_complexity_prefers_deep() {
        let f = fixture();
        let task = TaskProfile::builder().complexity(Complexity::High).build();
        let s = pick(&f, &task);
        assert_eq!(s.backend, BackendId::from("deep"));
        assert_eq!(s.rule, SelectionRule::HighComplexity);
    }

    #[test]
    fn test_success_rate_rule_respects_floor() {
        let f = fixture();
        let task = TaskProfile::builder().build();

        // Nothing proven yet → fallback order
        assert_eq!(pick(&f, &task).rule, SelectionRule::FallbackOrder);
        assert_eq!(pick(&f, &task).backend, BackendId::from("fast"));

        let ms = Duration::from_millis(10);
        for _ in 0..7 {
            f.stats.record_attempt(&"practical".into(), true, ms);
        }
        for _ in 0..3 {
            f.stats.record_attempt(&"practical".into(), false, ms);
        }
        // 0.7 does not exceed the floor
        assert_eq!(pick(&f, &task).rule, SelectionRule::FallbackOrder);

        f.stats.record_attempt(&"practical".into(), true, ms);
        let s = pick(&f, &task);
        assert_eq!(s.backend, BackendId::from("practical"));
        assert_eq!(s.rule, SelectionRule::ProvenSuccessRate);
    }

    #[tokio::test]
    async fn test_excluded_backend_never_selected() {
        let f = fixture();
        f.breaker.on_failure(&"deep".into()).await;
        let task = TaskProfile::builder().deep_reasoning().build();

        let s = pick(&f, &task);
        assert_ne!(s.backend, BackendId::from("deep"));
        assert!(f.breaker.peek_available(&s.backend));

        let ranked = f.selector.rank(&task, &f.all);
        assert!(!ranked.contains(&"deep".into()));
        assert_eq!(ranked.len(), 4);

        let parallel = f.selector.select_parallel_backends(&task, 5);
        assert!(!parallel.contains(&"deep".into()));
    }

    #[tokio::test]
    async fn test_all_excluded_returns_none() {
        let f = fixture();
        for b in &f.all {
            f.breaker.on_failure(b).await;
        }
        let task = TaskProfile::builder().build();
        assert!(f.selector.select(&task, &f.all).is_none());
        assert!(f.selector.rank(&task, &f.all).is_empty());
        assert!(f.selector.select_parallel_backends(&task, 2).is_empty());
    }

    #[test]
    fn test_rank_puts_primary_first_then_fallback_order() {
        let f = fixture();
        let task = TaskProfile::builder().domain(Domain::Debugging).build();
        let ranked = f.selector.rank(&task, &f.all);
        let names: Vec<&str> = ranked.iter().map(|b| b.as_str()).collect();
        assert_eq!(names, vec!["practical", "fast", "deep", "coder", "cheap"]);
    }

    #[test]
    fn test_parallel_diversifies_by_class() {
        let f = fixture();
        let task = TaskProfile::builder().deep_reasoning().build();
        let picks = f.selector.select_parallel_backends(&task, 2);
        assert_eq!(
            picks,
            vec![BackendId::from("deep"), BackendId::from("practical")]
        );

        let picks = f.selector.select_parallel_backends(&task, 10);
        assert_eq!(picks.len(), 5);
    }

    #[test]
    fn test_parallel_prefers_other_classes_over_same_class() {
        let clock = ManualClock::starting_now();
        let registry = Arc::new(BackendRegistry::new([
            BackendProfile::new("deep-a", BackendClass::DeepReasoning),
            BackendProfile::new("deep-b", BackendClass::DeepReasoning),
            BackendProfile::new("coder", BackendClass::CodeGeneration),
        ]));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let stats = Arc::new(BackendStats::new(clock));
        let selector = BackendSelector::new(registry, breaker, stats, SelectorConfig::default());

        let task = TaskProfile::builder().deep_reasoning().build();
        let picks = selector.select_parallel_backends(&task, 2);
        assert_eq!(picks, vec![BackendId::from("deep-a"), BackendId::from("coder")]);
    }

    #[test]
    fn test_fallback_excludes_failed() {
        let f = fixture();
        let task = TaskProfile::builder().deep_reasoning().build();
        let s = f
            .selector
            .select_fallback_backend(&"deep".into(), &task)
            .unwrap();
        assert_ne!(s.backend, BackendId::from("deep"));
    }

    #[test]
    fn test_unregistered_candidates_ignored() {
        let f = fixture();
        let task = TaskProfile::builder().build();
        let s = f
            .selector
            .select(&task, &["ghost".into(), "cheap".into()])
            .unwrap();
        assert_eq!(s.backend, BackendId::from("cheap"));
    }

    #[test]
    fn test_class_tie_broken_by_success_rate() {
        let clock = ManualClock::starting_now();
        let registry = Arc::new(BackendRegistry::new([
            BackendProfile::new("deep-a", BackendClass::DeepReasoning),
            BackendProfile::new("deep-b", BackendClass::DeepReasoning),
        ]));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let stats = Arc::new(BackendStats::new(clock));
        stats.record_attempt(&"deep-a".into(), false, Duration::from_millis(5));
        stats.record_attempt(&"deep-b".into(), true, Duration::from_millis(5));
        let selector =
            BackendSelector::new(registry.clone(), breaker, stats, SelectorConfig::default());

        let task = TaskProfile::builder().deep_reasoning().build();
        let s = selector.select(&task, &registry.ids()).unwrap();
        assert_eq!(s.backend, BackendId::from("deep-b"));
    }
}
