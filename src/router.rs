use std::sync::Arc;

use serde::Serialize;

use crate::complexity::{score_goal, score_work_item, ComplexityScore};
use crate::config::{ModelsConfig, TierModels};
use crate::traits::{Goal, ModelAvailability, ModelPair, WorkItem};
use crate::types::ComplexityTier;

/// Availability taken from `[models] available`. An empty list means every
/// configured model is usable.
pub struct ConfiguredAvailability {
    available: Vec<String>,
}

impl ConfiguredAvailability {
    pub fn new(available: Vec<String>) -> Self {
        Self { available }
    }
}

impl ModelAvailability for ConfiguredAvailability {
    fn is_model_supported(&self, model: &str) -> bool {
        !model.is_empty() && (self.available.is_empty() || self.available.iter().any(|m| m == model))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSelection {
    pub model: String,
    pub tier: ComplexityTier,
    pub complexity_score: u8,
    pub reasoning: String,
    /// Ordered candidates that were probed.
    pub candidates: Vec<String>,
    /// False when nothing was available and the tier's nominal primary was
    /// returned anyway.
    pub available: bool,
}

/// Tier-based model selection with availability fallback. Never fails.
#[derive(Clone)]
pub struct ModelSelector {
    models: ModelsConfig,
    availability: Arc<dyn ModelAvailability>,
}

fn push_unique(out: &mut Vec<String>, candidate: &str) {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return;
    }
    if !out.iter().any(|m| m == candidate) {
        out.push(candidate.to_string());
    }
}

impl ModelSelector {
    pub fn new(models: ModelsConfig, availability: Arc<dyn ModelAvailability>) -> Self {
        Self {
            models,
            availability,
        }
    }

    fn tier_models(&self, tier: ComplexityTier) -> &TierModels {
        match tier {
            ComplexityTier::Simple => &self.models.tiers.simple,
            ComplexityTier::Medium => &self.models.tiers.medium,
            ComplexityTier::Complex => &self.models.tiers.complex,
        }
    }

    fn default_pair(&self) -> ModelPair {
        ModelPair {
            primary: self.models.primary.clone(),
            fallback: self.models.fallback.clone(),
        }
    }

    /// Deduplicated, order-preserving candidates for a tier. A per-call
    /// override pair outranks the tier list; otherwise the tier list outranks
    /// the default pair.
    pub fn candidates_for_tier(
        &self,
        tier: ComplexityTier,
        override_pair: Option<&ModelPair>,
    ) -> Vec<String> {
        let tier_models = self.tier_models(tier);
        let mut tier_list = Vec::new();
        push_unique(&mut tier_list, &tier_models.primary);
        for m in &tier_models.fallbacks {
            push_unique(&mut tier_list, m);
        }

        let (pair, pair_first) = match override_pair {
            Some(p) => (p.clone(), true),
            None => (self.default_pair(), false),
        };
        let mut pair_list = Vec::new();
        push_unique(&mut pair_list, &pair.primary);
        if let Some(fallback) = &pair.fallback {
            push_unique(&mut pair_list, fallback);
        }

        let (first, second) = if pair_first {
            (pair_list, tier_list)
        } else {
            (tier_list, pair_list)
        };
        let mut out = Vec::new();
        for m in first.iter().chain(second.iter()) {
            push_unique(&mut out, m);
        }
        out
    }

    /// Every model named anywhere in the global configuration, in config order.
    pub fn all_models_ordered(&self) -> Vec<String> {
        let mut out = Vec::new();
        push_unique(&mut out, &self.models.primary);
        if let Some(fallback) = &self.models.fallback {
            push_unique(&mut out, fallback);
        }
        for tier in [
            ComplexityTier::Simple,
            ComplexityTier::Medium,
            ComplexityTier::Complex,
        ] {
            let t = self.tier_models(tier);
            push_unique(&mut out, &t.primary);
            for m in &t.fallbacks {
                push_unique(&mut out, m);
            }
        }
        out
    }

    pub fn select_for_work_item(
        &self,
        item: &WorkItem,
        override_pair: Option<&ModelPair>,
    ) -> ModelSelection {
        self.select(score_work_item(item), override_pair)
    }

    pub fn select_for_goal(&self, goal: &Goal, override_pair: Option<&ModelPair>) -> ModelSelection {
        self.select(score_goal(goal), override_pair)
    }

    fn select(&self, score: ComplexityScore, override_pair: Option<&ModelPair>) -> ModelSelection {
        let candidates = self.candidates_for_tier(score.tier, override_pair);

        let picked = candidates
            .iter()
            .find(|m| self.availability.is_model_supported(m))
            .map(|m| (m.clone(), "tier candidate"))
            .or_else(|| {
                self.all_models_ordered()
                    .into_iter()
                    .find(|m| self.availability.is_model_supported(m))
                    .map(|m| (m, "global fallback"))
            });

        let (model, available, source) = match picked {
            Some((m, source)) => (m, true, source),
            None => {
                let nominal = candidates
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.models.primary.clone());
                (nominal, false, "nominal primary, unavailable")
            }
        };

        let top = score
            .top_factors(3)
            .iter()
            .map(|f| format!("{}={} ({:.1})", f.name, f.value, f.contribution()))
            .collect::<Vec<_>>()
            .join(", ");
        let reasoning = format!(
            "{} tier (score {}) -> {} [{}]; top factors: {}",
            score.tier, score.score, model, source, top
        );

        ModelSelection {
            model,
            tier: score.tier,
            complexity_score: score.score,
            reasoning,
            candidates,
            available,
        }
    }
}
