use crate::models::{ErrorCombo, MasteryRecord, ProficiencyLevel, UserSettings};
use crate::registry::ChunkRegistry;

/// Highest chunk priority tier worth warming for each level.
static LEVEL_TIERS: &[(ProficiencyLevel, u8)] = &[
    (ProficiencyLevel::Beginner, 1),
    (ProficiencyLevel::Intermediate, 2),
    (ProficiencyLevel::Advanced, 3),
];

pub fn max_tier(level: ProficiencyLevel) -> u8 {
    LEVEL_TIERS
        .iter()
        .find(|(l, _)| *l == level)
        .map(|(_, tier)| *tier)
        .unwrap_or(1)
}

/// Chunks to warm in one pass, in load order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreloadPlan {
    chunk_ids: Vec<String>,
}

impl PreloadPlan {
    pub fn push(&mut self, chunk_id: impl Into<String>) {
        let chunk_id = chunk_id.into();
        if !self.chunk_ids.contains(&chunk_id) {
            self.chunk_ids.push(chunk_id);
        }
    }

    pub fn chunk_ids(&self) -> &[String] {
        &self.chunk_ids
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    /// Level tier chunks first, then chunks tagged with the preferred
    /// category.
    pub fn for_settings(registry: &ChunkRegistry, settings: &UserSettings) -> Self {
        let mut plan = Self::default();
        for meta in registry.chunks_up_to_priority(max_tier(settings.level)) {
            plan.push(meta.id.as_str());
        }
        if let Some(category) = settings.preferred_category.as_deref() {
            for meta in registry.chunks_with_category(category) {
                plan.push(meta.id.as_str());
            }
        }
        plan
    }
}

/// The `limit` highest-impact combos, strongest first.
pub fn top_error_combos(mut combos: Vec<ErrorCombo>, limit: usize) -> Vec<ErrorCombo> {
    combos.retain(|c| c.impact.is_finite() && c.impact > 0.0);
    combos.sort_by(|a, b| b.impact.total_cmp(&a.impact));
    combos.truncate(limit);
    combos
}

/// Keys below `threshold`, weakest first, at most `limit` of them.
pub fn weakest_keys(mut records: Vec<MasteryRecord>, threshold: f64, limit: usize) -> Vec<MasteryRecord> {
    records.retain(|r| r.score < threshold);
    records.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.key.cmp(&b.key)));
    records.truncate(limit);
    records
}
