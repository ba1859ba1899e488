//! Upstream candidate selection.
//!
//! Builds the ordered candidate list for one request: active upstreams matching
//! the request's capability and model, ordered by priority tier and then by
//! weight-proportional sampling within each tier. A remembered session binding
//! puts its upstream first while it remains eligible.
//!
//! The upstream snapshot is hot-swapped; selection never blocks reloads.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::models::{Capability, Upstream};

#[derive(Debug, Clone)]
struct SessionBinding {
    upstream_id: String,
    bound_at: Instant,
}

/// Directory snapshot plus per-session routing stickiness.
pub struct UpstreamService {
    snapshot: ArcSwap<Vec<Upstream>>,
    affinity: DashMap<String, SessionBinding>,
    affinity_ttl: Duration,
}

impl UpstreamService {
    pub fn new(upstreams: Vec<Upstream>, affinity_ttl: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(upstreams),
            affinity: DashMap::new(),
            affinity_ttl,
        }
    }

    /// Replace the upstream snapshot (directory reload).
    pub fn reload(&self, upstreams: Vec<Upstream>) {
        tracing::info!(count = upstreams.len(), "Upstream snapshot reloaded");
        self.snapshot.store(Arc::new(upstreams));
    }

    pub fn all(&self) -> Arc<Vec<Upstream>> {
        self.snapshot.load_full()
    }

    /// Build the ordered candidate list for a request.
    pub fn candidates(
        &self,
        capability: Capability,
        model: Option<&str>,
        session_id: Option<&str>,
    ) -> Vec<Upstream> {
        let snapshot = self.snapshot.load();
        let eligible: Vec<Upstream> = snapshot
            .iter()
            .filter(|u| u.is_active)
            .filter(|u| u.has_capability(capability))
            .filter(|u| model.map(|m| u.supports_model(m)).unwrap_or(true))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return eligible;
        }

        // Priority tiers ascending; weighted shuffle within each tier
        let mut tiers: BTreeMap<i32, Vec<Upstream>> = BTreeMap::new();
        for upstream in eligible {
            tiers.entry(upstream.priority).or_default().push(upstream);
        }

        let mut rng = thread_rng();
        let mut ordered: Vec<Upstream> = Vec::new();
        for (_, tier) in tiers {
            ordered.extend(weighted_shuffle(tier, &mut rng));
        }

        // A remembered session upstream is tried first while still eligible;
        // an ineligible binding simply stops applying (affinity migration is
        // the external policy's concern)
        if let Some(preferred) = session_id.and_then(|sid| self.take_preferred(sid)) {
            if let Some(pos) = ordered.iter().position(|u| u.id == preferred) {
                let upstream = ordered.remove(pos);
                ordered.insert(0, upstream);
            }
        }

        ordered
    }

    /// Remember the upstream that served a session. Called on success only.
    pub fn bind_session(&self, session_id: &str, upstream_id: &str) {
        self.affinity.insert(
            session_id.to_string(),
            SessionBinding {
                upstream_id: upstream_id.to_string(),
                bound_at: Instant::now(),
            },
        );
    }

    fn take_preferred(&self, session_id: &str) -> Option<String> {
        let binding = self.affinity.get(session_id)?;
        if binding.bound_at.elapsed() >= self.affinity_ttl {
            drop(binding);
            self.affinity.remove(session_id);
            return None;
        }
        Some(binding.upstream_id.clone())
    }
}

/// Order one priority tier by repeated weight-proportional sampling without
/// replacement. Zero-weight upstreams sort to the end of the tier.
fn weighted_shuffle(tier: Vec<Upstream>, rng: &mut ThreadRng) -> Vec<Upstream> {
    let (mut weighted, zeros): (Vec<Upstream>, Vec<Upstream>) =
        tier.into_iter().partition(|u| u.weight > 0);

    let mut ordered = Vec::with_capacity(weighted.len() + zeros.len());
    while !weighted.is_empty() {
        let weights: Vec<u32> = weighted.iter().map(|u| u.weight).collect();
        match WeightedIndex::new(&weights) {
            Ok(index) => {
                let chosen = index.sample(rng);
                ordered.push(weighted.swap_remove(chosen));
            }
            Err(_) => break,
        }
    }
    ordered.extend(weighted);
    ordered.extend(zeros);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::CircuitBreakerConfig;
    use std::collections::HashMap;

    fn upstream(id: &str, priority: i32, weight: u32) -> Upstream {
        Upstream {
            id: id.to_string(),
            name: id.to_string(),
            base_url: format!("https://{}.example.com", id),
            api_key: String::new(),
            timeout_secs: 30,
            is_active: true,
            priority,
            weight,
            capabilities: vec!["anthropic".to_string()],
            allowed_models: None,
            model_redirects: HashMap::new(),
            billing_input_multiplier: 1.0,
            billing_output_multiplier: 1.0,
            circuit_config: CircuitBreakerConfig::default(),
        }
    }

    fn service(upstreams: Vec<Upstream>) -> UpstreamService {
        UpstreamService::new(upstreams, Duration::from_secs(3600))
    }

    #[test]
    fn test_filters_capability_and_active() {
        let mut inactive = upstream("b", 0, 1);
        inactive.is_active = false;
        let mut wrong_cap = upstream("c", 0, 1);
        wrong_cap.capabilities = vec!["openai".to_string()];

        let svc = service(vec![upstream("a", 0, 1), inactive, wrong_cap]);
        let candidates = svc.candidates(Capability::Anthropic, None, None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "a");
    }

    #[test]
    fn test_filters_model_allowlist() {
        let mut restricted = upstream("a", 0, 1);
        restricted.allowed_models = Some(vec!["claude-3-opus".to_string()]);
        let open = upstream("b", 0, 1);

        let svc = service(vec![restricted, open]);
        let candidates = svc.candidates(Capability::Anthropic, Some("gpt-4"), None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "b");
    }

    #[test]
    fn test_priority_tiers_ascending() {
        let svc = service(vec![
            upstream("low", 10, 1),
            upstream("high", 0, 1),
            upstream("mid", 5, 1),
        ]);
        let candidates = svc.candidates(Capability::Anthropic, None, None);
        let ids: Vec<&str> = candidates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_weighted_selection_within_tier() {
        let svc = service(vec![upstream("heavy", 0, 19), upstream("light", 0, 1)]);
        let mut heavy_first = 0;
        for _ in 0..200 {
            let candidates = svc.candidates(Capability::Anthropic, None, None);
            assert_eq!(candidates.len(), 2);
            if candidates[0].id == "heavy" {
                heavy_first += 1;
            }
        }
        // 95% expectation; allow generous slack for randomness
        assert!(heavy_first > 150, "heavy won only {}/200", heavy_first);
    }

    #[test]
    fn test_zero_weight_sorts_to_tier_end() {
        let svc = service(vec![upstream("zero", 0, 0), upstream("one", 0, 1)]);
        for _ in 0..20 {
            let candidates = svc.candidates(Capability::Anthropic, None, None);
            assert_eq!(candidates.last().unwrap().id, "zero");
        }
    }

    #[test]
    fn test_session_affinity_moves_upstream_first() {
        let svc = service(vec![
            upstream("a", 0, 1),
            upstream("b", 5, 1),
            upstream("c", 10, 1),
        ]);
        svc.bind_session("sess-1", "c");

        let candidates = svc.candidates(Capability::Anthropic, None, Some("sess-1"));
        assert_eq!(candidates[0].id, "c");
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_session_affinity_ignored_when_ineligible() {
        let svc = service(vec![upstream("a", 0, 1)]);
        svc.bind_session("sess-1", "gone");

        let candidates = svc.candidates(Capability::Anthropic, None, Some("sess-1"));
        assert_eq!(candidates[0].id, "a");
    }

    #[test]
    fn test_session_affinity_expires() {
        let svc = UpstreamService::new(
            vec![upstream("a", 0, 1), upstream("b", 1, 1)],
            Duration::from_millis(0),
        );
        svc.bind_session("sess-1", "b");

        let candidates = svc.candidates(Capability::Anthropic, None, Some("sess-1"));
        assert_eq!(candidates[0].id, "a");
        assert!(svc.affinity.get("sess-1").is_none());
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let svc = service(vec![upstream("a", 0, 1)]);
        svc.reload(vec![upstream("b", 0, 1)]);
        let candidates = svc.candidates(Capability::Anthropic, None, None);
        assert_eq!(candidates[0].id, "b");
    }

    #[test]
    fn test_empty_directory() {
        let svc = service(vec![]);
        assert!(svc.candidates(Capability::Anthropic, None, None).is_empty());
    }
}
