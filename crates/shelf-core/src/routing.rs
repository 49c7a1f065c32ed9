//! LLM provider selection.
//!
//! [`select_providers`] turns the configured provider list, routing
//! settings, and a snapshot of per-provider stats into an ordered
//! [`RoutePlan`]. It performs no I/O; the gateway in the service crate
//! records the stats and walks the plan.
//!
//! Precedence:
//!
//! 1. A forced provider that is not blocklisted goes first.
//! 2. An intent mapping (`provider_by_intent`) puts its provider first.
//! 3. Cost steering puts the low-cost provider first unless the query
//!    hits a high-risk keyword.
//! 4. Otherwise candidates keep their natural order, sorted by health
//!    score when every candidate has enough samples.
//!
//! Blocklisted and cooling-down providers are filtered out. When nothing
//! is left the natural order is used as-is.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub name: String,
    pub url: String,
}

impl Provider {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// `primary`, `fallback_1`, `fallback_2`, … in configured order.
pub fn providers_from_urls(primary: &str, fallbacks: &[String]) -> Vec<Provider> {
    let mut providers = vec![Provider::new("primary", primary)];
    for (i, url) in fallbacks.iter().enumerate() {
        providers.push(Provider::new(format!("fallback_{}", i + 1), url.clone()));
    }
    providers
}

#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub force_provider: Option<String>,
    pub blocklist: Vec<String>,
    pub provider_by_intent: HashMap<String, String>,
    pub cost_steering_enabled: bool,
    pub low_cost_provider: Option<String>,
    pub provider_costs: HashMap<String, f64>,
    pub risk_high_keywords: Vec<String>,
    pub health_routing_enabled: bool,
    pub health_min_sample: u64,
    pub health_streak_penalty_step: f64,
    pub health_streak_penalty_max: f64,
}

/// Rolling outcome counts for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub ok: u64,
    pub fail: u64,
    pub streak_fail: u64,
    pub cooling_down: bool,
}

impl ProviderStats {
    pub fn samples(&self) -> u64 {
        self.ok + self.fail
    }
}

/// `success_ratio − min(streak_fail × step, max)`; an unobserved provider
/// has a success ratio of 1.
pub fn health_score(stats: &ProviderStats, step: f64, max: f64) -> f64 {
    let ratio = if stats.samples() == 0 {
        1.0
    } else {
        stats.ok as f64 / stats.samples() as f64
    };
    ratio - (stats.streak_fail as f64 * step).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    Forced,
    Intent,
    CostSteer,
    Health,
    Natural,
    AvailabilityFallback,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Forced => "forced",
            RouteMode::Intent => "intent",
            RouteMode::CostSteer => "cost_steer",
            RouteMode::Health => "health",
            RouteMode::Natural => "natural",
            RouteMode::AvailabilityFallback => "availability_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouteInput<'a> {
    pub intent: Option<&'a str>,
    pub query: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePlan {
    pub order: Vec<Provider>,
    pub mode: RouteMode,
    /// A forced provider was configured but blocklisted.
    pub forced_blocked: bool,
    pub high_risk: bool,
    pub health_scores: BTreeMap<String, f64>,
}

impl RoutePlan {
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|p| p.name.as_str()).collect()
    }
}

pub fn is_high_risk(query: &str, keywords: &[String]) -> bool {
    let lowered = query.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .any(|k| lowered.contains(&k.to_lowercase()))
}

fn promote(candidates: &[Provider], name: &str) -> Option<Vec<Provider>> {
    let pos = candidates.iter().position(|p| p.name == name)?;
    let mut order = Vec::with_capacity(candidates.len());
    order.push(candidates[pos].clone());
    order.extend(
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, p)| p.clone()),
    );
    Some(order)
}

pub fn select_providers(
    providers: &[Provider],
    config: &RoutingConfig,
    stats: &HashMap<String, ProviderStats>,
    input: &RouteInput<'_>,
) -> RoutePlan {
    let high_risk = is_high_risk(input.query, &config.risk_high_keywords);
    let stat_of = |name: &str| stats.get(name).copied().unwrap_or_default();
    let health_scores: BTreeMap<String, f64> = providers
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                health_score(
                    &stat_of(&p.name),
                    config.health_streak_penalty_step,
                    config.health_streak_penalty_max,
                ),
            )
        })
        .collect();
    let plan = |order: Vec<Provider>, mode: RouteMode, forced_blocked: bool| RoutePlan {
        order,
        mode,
        forced_blocked,
        high_risk,
        health_scores: health_scores.clone(),
    };

    let blocked = |name: &str| config.blocklist.iter().any(|b| b == name);

    let mut forced_blocked = false;
    if let Some(forced) = config.force_provider.as_deref().filter(|f| !f.is_empty()) {
        if blocked(forced) {
            forced_blocked = true;
        } else if let Some(order) = promote(providers, forced) {
            let order: Vec<Provider> = order
                .into_iter()
                .enumerate()
                .filter(|(i, p)| *i == 0 || (!blocked(&p.name) && !stat_of(&p.name).cooling_down))
                .map(|(_, p)| p)
                .collect();
            return plan(order, RouteMode::Forced, false);
        }
    }

    let candidates: Vec<Provider> = providers
        .iter()
        .filter(|p| !blocked(&p.name) && !stat_of(&p.name).cooling_down)
        .cloned()
        .collect();
    if candidates.is_empty() {
        return plan(
            providers.to_vec(),
            RouteMode::AvailabilityFallback,
            forced_blocked,
        );
    }

    if let Some(mapped) = input
        .intent
        .and_then(|intent| config.provider_by_intent.get(intent))
    {
        if let Some(order) = promote(&candidates, mapped) {
            return plan(order, RouteMode::Intent, forced_blocked);
        }
    }

    if config.cost_steering_enabled && !high_risk {
        let target = config
            .low_cost_provider
            .clone()
            .filter(|name| candidates.iter().any(|p| &p.name == name))
            .or_else(|| {
                candidates
                    .iter()
                    .filter_map(|p| config.provider_costs.get(&p.name).map(|c| (p, *c)))
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(p, _)| p.name.clone())
            });
        if let Some(order) = target.and_then(|name| promote(&candidates, &name)) {
            return plan(order, RouteMode::CostSteer, forced_blocked);
        }
    }

    let enough_samples = candidates
        .iter()
        .all(|p| stat_of(&p.name).samples() >= config.health_min_sample);
    if config.health_routing_enabled && enough_samples {
        let mut order = candidates;
        order.sort_by(|a, b| {
            let sa = health_scores.get(&a.name).copied().unwrap_or(0.0);
            let sb = health_scores.get(&b.name).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        return plan(order, RouteMode::Health, forced_blocked);
    }

    plan(candidates, RouteMode::Natural, forced_blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<Provider> {
        providers_from_urls(
            "http://p",
            &["http://f1".to_string(), "http://f2".to_string()],
        )
    }

    fn input(query: &str) -> RouteInput<'_> {
        RouteInput {
            intent: None,
            query,
        }
    }

    #[test]
    fn test_natural_order() {
        let plan = select_providers(
            &providers(),
            &RoutingConfig::default(),
            &HashMap::new(),
            &input("hello"),
        );
        assert_eq!(plan.names(), vec!["primary", "fallback_1", "fallback_2"]);
        assert_eq!(plan.mode, RouteMode::Natural);
    }

    #[test]
    fn test_forced_provider_first() {
        let config = RoutingConfig {
            force_provider: Some("fallback_2".into()),
            ..Default::default()
        };
        let plan = select_providers(&providers(), &config, &HashMap::new(), &input("q"));
        assert_eq!(plan.names(), vec!["fallback_2", "primary", "fallback_1"]);
        assert_eq!(plan.mode, RouteMode::Forced);
    }

    #[test]
    fn test_forced_but_blocked() {
        let config = RoutingConfig {
            force_provider: Some("primary".into()),
            blocklist: vec!["primary".into()],
            ..Default::default()
        };
        let plan = select_providers(&providers(), &config, &HashMap::new(), &input("q"));
        assert!(plan.forced_blocked);
        assert_eq!(plan.names(), vec!["fallback_1", "fallback_2"]);
    }

    #[test]
    fn test_intent_mapping() {
        let mut config = RoutingConfig::default();
        config
            .provider_by_intent
            .insert("REFUND_POLICY".into(), "fallback_1".into());
        let plan = select_providers(
            &providers(),
            &config,
            &HashMap::new(),
            &RouteInput {
                intent: Some("REFUND_POLICY"),
                query: "q",
            },
        );
        assert_eq!(plan.names()[0], "fallback_1");
        assert_eq!(plan.mode, RouteMode::Intent);
    }

    #[test]
    fn test_cost_steering_skips_high_risk() {
        let config = RoutingConfig {
            cost_steering_enabled: true,
            low_cost_provider: Some("fallback_2".into()),
            risk_high_keywords: vec!["환불".into()],
            ..Default::default()
        };
        let cheap = select_providers(&providers(), &config, &HashMap::new(), &input("소설 추천"));
        assert_eq!(cheap.names()[0], "fallback_2");
        assert_eq!(cheap.mode, RouteMode::CostSteer);

        let risky = select_providers(&providers(), &config, &HashMap::new(), &input("환불 규정"));
        assert_eq!(risky.names()[0], "primary");
        assert!(risky.high_risk);
    }

    #[test]
    fn test_cheapest_by_costs() {
        let mut config = RoutingConfig {
            cost_steering_enabled: true,
            ..Default::default()
        };
        config.provider_costs.insert("primary".into(), 3.0);
        config.provider_costs.insert("fallback_1".into(), 1.0);
        let plan = select_providers(&providers(), &config, &HashMap::new(), &input("q"));
        assert_eq!(plan.names()[0], "fallback_1");
    }

    #[test]
    fn test_health_sorting_needs_samples() {
        let config = RoutingConfig {
            health_routing_enabled: true,
            health_min_sample: 5,
            health_streak_penalty_step: 0.1,
            health_streak_penalty_max: 0.5,
            ..Default::default()
        };
        let mut stats = HashMap::new();
        stats.insert(
            "primary".to_string(),
            ProviderStats {
                ok: 2,
                fail: 8,
                streak_fail: 3,
                cooling_down: false,
            },
        );
        stats.insert(
            "fallback_1".to_string(),
            ProviderStats {
                ok: 9,
                fail: 1,
                ..Default::default()
            },
        );
        let plan = select_providers(&providers(), &config, &stats, &input("q"));
        // fallback_2 has no samples yet.
        assert_eq!(plan.mode, RouteMode::Natural);

        stats.insert(
            "fallback_2".to_string(),
            ProviderStats {
                ok: 5,
                fail: 5,
                ..Default::default()
            },
        );
        let plan = select_providers(&providers(), &config, &stats, &input("q"));
        assert_eq!(plan.mode, RouteMode::Health);
        assert_eq!(plan.names(), vec!["fallback_1", "fallback_2", "primary"]);
    }

    #[test]
    fn test_health_score_formula() {
        let s = ProviderStats {
            ok: 8,
            fail: 2,
            streak_fail: 10,
            cooling_down: false,
        };
        assert!((health_score(&s, 0.1, 0.3) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_filtered_and_fallback_when_all_out() {
        let mut stats = HashMap::new();
        stats.insert(
            "primary".to_string(),
            ProviderStats {
                cooling_down: true,
                ..Default::default()
            },
        );
        let plan = select_providers(&providers(), &RoutingConfig::default(), &stats, &input("q"));
        assert_eq!(plan.names(), vec!["fallback_1", "fallback_2"]);

        let config = RoutingConfig {
            blocklist: vec!["fallback_1".into(), "fallback_2".into()],
            ..Default::default()
        };
        let plan = select_providers(&providers(), &config, &stats, &input("q"));
        assert_eq!(plan.mode, RouteMode::AvailabilityFallback);
        assert_eq!(plan.names(), vec!["primary", "fallback_1", "fallback_2"]);
    }
}
