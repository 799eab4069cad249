//! Closed-form confidence arithmetic.
//!
//! Reinforcement moves confidence a fixed fraction of the remaining headroom
//! towards the ceiling. Penalties remove a fixed fraction of the current value.
//! Decay multiplies by `(1 - rate)^days`, bounded below by `min_decay_factor`,
//! and never drops under `min_confidence`. All functions here are pure; the
//! `*_stored` variant is the only one touching a store.

use chrono::{DateTime, Utc};
use invoicemem_core::memory::clamp_unit;
use invoicemem_core::{
    ConfidenceConfig, Error, Memory, MemoryStore, MemoryUpdate, Result, UpdateType,
};
use tracing::{debug, warn};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Default)]
pub struct ConfidenceManager {
    config: ConfidenceConfig,
}

impl ConfidenceManager {
    #[must_use]
    pub const fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// New confidence after one outcome.
    ///
    /// Success never lowers confidence and never reaches 1.0; failure never
    /// pushes it under the configured floor (or the current value, if that is
    /// already lower).
    #[must_use]
    pub fn reinforce_memory(&self, memory: &Memory, success: bool) -> f64 {
        let c = clamp_unit(memory.confidence);
        if success {
            let raised = self.config.reinforcement_step.mul_add(1.0 - c, c);
            clamp_unit(raised.min(self.config.max_confidence).max(c))
        } else {
            self.weaken(memory)
        }
    }

    /// Proportional penalty, floored.
    #[must_use]
    pub fn weaken(&self, memory: &Memory) -> f64 {
        let c = clamp_unit(memory.confidence);
        let lowered = c * (1.0 - self.config.penalty_step);
        clamp_unit(lowered.max(self.config.min_confidence.min(c)))
    }

    /// New confidence after `days_since_use` idle days. Non-positive
    /// durations leave confidence unchanged.
    #[must_use]
    pub fn decay_memory(&self, memory: &Memory, days_since_use: f64) -> f64 {
        self.decay_from(memory.confidence, days_since_use)
    }

    fn decay_from(&self, confidence: f64, days_since_use: f64) -> f64 {
        let c = clamp_unit(confidence);
        if days_since_use <= 0.0 || days_since_use.is_nan() {
            return c;
        }
        let factor = (1.0 - self.config.daily_decay_rate)
            .clamp(0.0, 1.0)
            .powf(days_since_use)
            .max(self.config.min_decay_factor);
        clamp_unit((c * factor).max(self.config.min_confidence).min(c))
    }

    /// Apply an outcome to a copy of the memory, updating usage statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn apply_outcome(&self, memory: &Memory, success: bool) -> (Memory, MemoryUpdate) {
        let mut next = memory.clone();
        next.confidence = self.reinforce_memory(memory, success);
        next.decay_base = None;

        let hits = memory
            .success_rate
            .mul_add(memory.usage_count as f64, if success { 1.0 } else { 0.0 });
        next.usage_count = memory.usage_count.saturating_add(1);
        next.success_rate = clamp_unit(hits / next.usage_count as f64);
        next.last_used = Utc::now().max(memory.last_used);

        let (update_type, reason) = if success {
            (UpdateType::Reinforced, "successful application")
        } else {
            (UpdateType::Weakened, "rejected or corrected application")
        };
        let update = MemoryUpdate::between(memory, &next, update_type, reason);
        (next, update)
    }

    /// Decay a memory by the time elapsed since it was last used. Returns
    /// `None` when nothing changed.
    ///
    /// Decay is computed from the confidence the memory had when it was last
    /// used, so running this again at the same instant is a no-op.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn decay(&self, memory: &Memory, now: DateTime<Utc>) -> Option<(Memory, MemoryUpdate)> {
        let idle = now.signed_duration_since(memory.last_used);
        let days = idle.num_seconds() as f64 / SECONDS_PER_DAY;
        let current = clamp_unit(memory.confidence);
        let base = memory.decay_base.map_or(current, clamp_unit).max(current);
        let confidence = self.decay_from(base, days).min(current);
        if (confidence - memory.confidence).abs() < f64::EPSILON {
            return None;
        }

        let mut next = memory.clone();
        next.confidence = confidence;
        next.decay_base = Some(base);
        let update = MemoryUpdate::between(
            memory,
            &next,
            UpdateType::Decayed,
            format!("unused for {days:.1} days"),
        );
        Some((next, update))
    }

    /// Whether a memory has dropped under the retention floor. Success rate
    /// only counts once the memory has been used often enough.
    #[must_use]
    pub fn should_archive(&self, memory: &Memory) -> bool {
        if memory.archived {
            return false;
        }
        memory.confidence < self.config.archive_confidence
            || (memory.usage_count >= self.config.archive_min_usage
                && memory.success_rate < self.config.archive_success_rate)
    }

    /// Soft-delete. Statistics are kept.
    #[must_use]
    pub fn archive(&self, memory: &Memory) -> (Memory, MemoryUpdate) {
        let mut next = memory.clone();
        next.archived = true;
        let reason = format!(
            "confidence {:.3}, success rate {:.3} under retention floor",
            memory.confidence, memory.success_rate
        );
        let update = MemoryUpdate::between(memory, &next, UpdateType::Archived, reason);
        (next, update)
    }

    /// Read-modify-write of one stored memory under optimistic concurrency.
    ///
    /// On a version conflict the memory is reloaded and the outcome reapplied
    /// to the fresh state, up to `max_update_retries` times.
    pub async fn reinforce_stored(
        &self,
        store: &dyn MemoryStore,
        memory_id: &str,
        success: bool,
    ) -> Result<(Memory, MemoryUpdate)> {
        let mut attempt = 0;
        loop {
            let current = store
                .find_memory(memory_id)
                .await?
                .ok_or_else(|| Error::NotFound(memory_id.to_string()))?;
            let (mut next, update) = self.apply_outcome(&current, success);

            match store.update_memory(&next).await {
                Ok(version) => {
                    next.version = version;
                    debug!(memory_id, version, confidence = next.confidence, "Stored confidence update");
                    return Ok((next, update));
                }
                Err(e) if e.is_conflict() && attempt < self.config.max_update_retries => {
                    attempt += 1;
                    warn!(memory_id, attempt, "Version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use invoicemem_core::{CorrectionMemory, CorrectionAction, ActionType, CorrectionType};
    use serde_json::json;

    fn memory(confidence: f64) -> Memory {
        Memory::correction(
            CorrectionMemory {
                correction_type: CorrectionType::CurrencyFix,
                trigger_conditions: Vec::new(),
                correction_action: CorrectionAction {
                    action_type: ActionType::Set,
                    target_field: "currency".to_string(),
                    new_value: json!("EUR"),
                    search: None,
                },
                validation_rules: Vec::new(),
            },
            confidence,
        )
    }

    #[test]
    fn reinforcement_approaches_but_never_reaches_one() {
        let manager = ConfidenceManager::default();
        let mut m = memory(0.5);
        for _ in 0..200 {
            let next = manager.reinforce_memory(&m, true);
            assert!(next >= m.confidence);
            assert!(next < 1.0);
            m.confidence = next;
        }
        assert!((m.confidence - 0.99).abs() < 1e-9);
    }

    #[test]
    fn reinforcement_step_scales_with_headroom() {
        let manager = ConfidenceManager::default();
        let next = manager.reinforce_memory(&memory(0.5), true);
        assert!((next - 0.55).abs() < 1e-9);
    }

    #[test]
    fn failure_is_floored() {
        let manager = ConfidenceManager::default();
        let mut m = memory(0.8);
        for _ in 0..100 {
            m.confidence = manager.reinforce_memory(&m, false);
        }
        assert!((m.confidence - 0.1).abs() < 1e-9);
        assert!((manager.weaken(&memory(0.05)) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn decay_is_monotonic_and_bounded() {
        let manager = ConfidenceManager::default();
        let m = memory(0.8);
        let mut last = m.confidence;
        for days in [1.0, 10.0, 30.0, 365.0, 10_000.0] {
            let next = manager.decay_memory(&m, days);
            assert!(next <= last);
            assert!(next >= 0.1);
            last = next;
        }
        assert!((last - 0.4).abs() < 1e-9);
        assert!((manager.decay_memory(&m, 0.0) - 0.8).abs() < f64::EPSILON);
        assert!((manager.decay_memory(&memory(0.05), 30.0) - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn outcome_updates_statistics() {
        let manager = ConfidenceManager::default();
        let (once, update) = manager.apply_outcome(&memory(0.6), true);
        assert_eq!(once.usage_count, 1);
        assert!((once.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(update.update_type, UpdateType::Reinforced);
        assert_eq!(update.previous_state.map(|s| s.usage_count), Some(0));

        let (twice, update) = manager.apply_outcome(&once, false);
        assert_eq!(twice.usage_count, 2);
        assert!((twice.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(twice.confidence < once.confidence);
        assert_eq!(update.update_type, UpdateType::Weakened);
    }

    #[test]
    fn decay_uses_last_used() {
        let manager = ConfidenceManager::default();
        let m = memory(0.8);
        assert!(manager.decay(&m, m.last_used).is_none());

        let (decayed, update) = manager.decay(&m, m.last_used + Duration::days(10)).unwrap();
        assert!(decayed.confidence < 0.8);
        assert_eq!(update.update_type, UpdateType::Decayed);
    }

    #[test]
    fn decay_is_idempotent_at_the_same_instant() {
        let manager = ConfidenceManager::default();
        let m = memory(0.8);
        let now = m.last_used + Duration::days(30);

        let (once, _) = manager.decay(&m, now).unwrap();
        assert!(manager.decay(&once, now).is_none());
        assert_eq!(once.decay_base, Some(0.8));

        let (later, _) = manager.decay(&once, now + Duration::days(30)).unwrap();
        let expected = manager.decay_memory(&m, 60.0);
        assert!((later.confidence - expected).abs() < 1e-12);
        assert!(later.is_well_formed());
    }

    #[test]
    fn long_idle_memory_stops_at_decay_bound() {
        let manager = ConfidenceManager::default();
        let mut m = memory(0.8);
        for years in 1..=5 {
            if let Some((next, _)) = manager.decay(&m, m.last_used + Duration::days(365 * years)) {
                m = next;
            }
        }
        assert!((m.confidence - 0.4).abs() < 1e-12);
        assert!(!manager.should_archive(&m));
    }

    #[test]
    fn outcome_after_decay_restarts_from_decayed_value() {
        let manager = ConfidenceManager::default();
        let m = memory(0.8);
        let (decayed, _) = manager.decay(&m, m.last_used + Duration::days(30)).unwrap();
        let (used, _) = manager.apply_outcome(&decayed, true);
        assert_eq!(used.decay_base, None);
        assert!(used.confidence >= decayed.confidence);
        assert!(used.is_well_formed());
    }

    #[test]
    fn archival_thresholds() {
        let manager = ConfidenceManager::default();
        assert!(manager.should_archive(&memory(0.1)));
        assert!(!manager.should_archive(&memory(0.6)));

        let mut unreliable = memory(0.6);
        unreliable.usage_count = 10;
        unreliable.success_rate = 0.2;
        assert!(manager.should_archive(&unreliable));

        let (archived, update) = manager.archive(&unreliable);
        assert!(archived.archived);
        assert!(!manager.should_archive(&archived));
        assert_eq!(update.update_type, UpdateType::Archived);
    }
}
