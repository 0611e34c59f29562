//! Continuation decisions for multi-turn clarification flows.
//!
//! A new message either continues a pending exchange (the user is answering
//! a clarification we asked) or starts fresh. Continuation is intent-specific
//! rather than universal: context is only reused when the stored pending
//! intent is continuable and the new turn's intent is the same one, or the
//! deliberately vague "ambiguous/general" bucket a short answer like
//! "21 jours" classifies into.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entities::{EntitySet, Field};
use crate::state::ConversationState;

/// Conversational goal attached to a turn by the classification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Performance targets for a line at an age (weight, FCR, uniformity)
    PerfTargets,
    /// Health troubleshooting from clinical signs
    HealthDiagnosis,
    /// Feed and nutrition advice
    NutritionAdvice,
    /// Short or vague message that cannot be classified on its own
    AmbiguousGeneral,
    /// Clearly outside the poultry domain
    OutOfDomain,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::PerfTargets => "perf_targets",
            Intent::HealthDiagnosis => "health_diagnosis",
            Intent::NutritionAdvice => "nutrition_advice",
            Intent::AmbiguousGeneral => "ambiguous_general",
            Intent::OutOfDomain => "out_of_domain",
        }
    }

    pub fn from_str(tag: &str) -> Option<Self> {
        match tag {
            "perf_targets" => Some(Intent::PerfTargets),
            "health_diagnosis" => Some(Intent::HealthDiagnosis),
            "nutrition_advice" => Some(Intent::NutritionAdvice),
            "ambiguous_general" => Some(Intent::AmbiguousGeneral),
            "out_of_domain" => Some(Intent::OutOfDomain),
            _ => None,
        }
    }

    /// Whether a clarification flow for this intent may span turns.
    pub fn is_continuable(&self) -> bool {
        matches!(
            self,
            Intent::PerfTargets | Intent::HealthDiagnosis | Intent::NutritionAdvice
        )
    }
}

/// Decide whether the current turn continues a pending clarification flow.
///
/// Absent or expired state never continues. Otherwise the stored pending
/// intent must be continuable, and the new intent must either match it or be
/// the ambiguous/general bucket.
pub fn should_continue(
    state: Option<&ConversationState>,
    new_intent: Intent,
    inactivity_window: Duration,
) -> bool {
    let Some(state) = state else {
        return false;
    };
    if state.is_expired(inactivity_window) {
        return false;
    }
    let Some(pending) = state.pending_intent else {
        return false;
    };
    if !pending.is_continuable() {
        return false;
    }
    new_intent == pending || new_intent == Intent::AmbiguousGeneral
}

/// Entity slots an intent needs before a full answer is possible.
///
/// Order matters: it is the order clarification questions get asked in.
pub fn required_fields(intent: Intent) -> &'static [Field] {
    match intent {
        Intent::PerfTargets => &[Field::Species, Field::Line, Field::Sex, Field::AgeDays],
        Intent::HealthDiagnosis => &[Field::Species, Field::AgeDays, Field::Signs],
        Intent::NutritionAdvice => &[Field::Species, Field::AgeDays],
        Intent::AmbiguousGeneral | Intent::OutOfDomain => &[],
    }
}

/// The ordered list of fields still missing for an intent.
pub fn missing_fields_for(intent: Intent, entities: &EntitySet) -> Vec<Field> {
    required_fields(intent)
        .iter()
        .copied()
        .filter(|field| !entities.has(*field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Species;
    use chrono::{Duration as ChronoDuration, Utc};

    const WINDOW: Duration = Duration::from_secs(600);

    fn state_updated_secs_ago(pending: Option<Intent>, secs: i64) -> ConversationState {
        let mut state = ConversationState::new();
        state.pending_intent = pending;
        state.last_updated = Utc::now() - ChronoDuration::seconds(secs);
        state
    }

    #[test]
    fn fresh_pending_intent_continues_on_same_intent() {
        let state = state_updated_secs_ago(Some(Intent::PerfTargets), 300);
        assert!(should_continue(Some(&state), Intent::PerfTargets, WINDOW));
    }

    #[test]
    fn fresh_pending_intent_continues_on_ambiguous() {
        let state = state_updated_secs_ago(Some(Intent::PerfTargets), 300);
        assert!(should_continue(Some(&state), Intent::AmbiguousGeneral, WINDOW));
    }

    #[test]
    fn expired_state_never_continues() {
        let state = state_updated_secs_ago(Some(Intent::PerfTargets), 900);
        assert!(!should_continue(Some(&state), Intent::AmbiguousGeneral, WINDOW));
        assert!(!should_continue(Some(&state), Intent::PerfTargets, WINDOW));
    }

    #[test]
    fn absent_state_never_continues() {
        assert!(!should_continue(None, Intent::PerfTargets, WINDOW));
    }

    #[test]
    fn topic_switch_does_not_continue() {
        let state = state_updated_secs_ago(Some(Intent::PerfTargets), 60);
        assert!(!should_continue(Some(&state), Intent::HealthDiagnosis, WINDOW));
        assert!(!should_continue(Some(&state), Intent::OutOfDomain, WINDOW));
    }

    #[test]
    fn non_continuable_pending_intent_never_continues() {
        let state = state_updated_secs_ago(Some(Intent::AmbiguousGeneral), 60);
        assert!(!should_continue(Some(&state), Intent::AmbiguousGeneral, WINDOW));

        let state = state_updated_secs_ago(None, 60);
        assert!(!should_continue(Some(&state), Intent::PerfTargets, WINDOW));
    }

    #[test]
    fn missing_fields_keep_clarification_order() {
        let entities = EntitySet::new().with_species(Species::Broiler);
        assert_eq!(
            missing_fields_for(Intent::PerfTargets, &entities),
            vec![Field::Line, Field::Sex, Field::AgeDays]
        );
    }

    #[test]
    fn no_fields_missing_when_all_present() {
        let entities = EntitySet::new()
            .with_species(Species::Broiler)
            .with_age_days(21);
        assert!(missing_fields_for(Intent::NutritionAdvice, &entities).is_empty());
        assert!(missing_fields_for(Intent::AmbiguousGeneral, &entities).is_empty());
    }

    #[test]
    fn intent_tags_round_trip() {
        for intent in [
            Intent::PerfTargets,
            Intent::HealthDiagnosis,
            Intent::NutritionAdvice,
            Intent::AmbiguousGeneral,
            Intent::OutOfDomain,
        ] {
            assert_eq!(Intent::from_str(intent.as_str()), Some(intent));
        }
        assert_eq!(Intent::from_str("weather"), None);
    }
}
