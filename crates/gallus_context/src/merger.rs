//! Multi-turn context fusion.
//!
//! One turn's working entity set is fused from three sources, in a fixed
//! precedence order:
//!
//! 1. the persisted session entities (base),
//! 2. values freshly auto-extracted from the current message (the user just
//!    typed them, so they beat stale session state),
//! 3. the caller-supplied current-turn entities (structured fields from the
//!    surrounding classification step).
//!
//! The single carve-out: a current-turn set that carries no age never erases
//! an established `age_days`. Most domain answers hinge on flock age, and a
//! turn that simply does not mention it must not lose it.
//!
//! This module is pure; the engine feeds it the auto-extracted set so the
//! overlay order stays testable without any cache in the way.

use crate::entities::EntitySet;

/// Fuse session, auto-extracted and current-turn entities.
///
/// The overlay applies present values field by field; `session` is the base
/// and `current` has the last word, except for the age rule above.
pub fn fuse(session: &EntitySet, auto: &EntitySet, current: &EntitySet) -> EntitySet {
    let mut merged = session.clone();

    // Stage 2: freshly extracted values override the session copy.
    if let Some(species) = auto.species {
        merged.species = Some(species);
    }
    if let Some(line) = &auto.line {
        merged.line = Some(line.clone());
    }
    if let Some(sex) = auto.sex {
        merged.sex = Some(sex);
    }
    if let Some(age_days) = auto.age_days {
        merged.age_days = Some(age_days);
    }
    if let Some(signs) = &auto.signs {
        merged.signs = Some(signs.clone());
    }

    // Stage 3: current-turn structured fields overlay the working set.
    if let Some(species) = current.species {
        merged.species = Some(species);
    }
    if let Some(line) = &current.line {
        merged.line = Some(line.clone());
    }
    if let Some(sex) = current.sex {
        merged.sex = Some(sex);
    }
    match current.age_days {
        Some(age_days) => merged.age_days = Some(age_days),
        // An absent incoming age preserves the established one.
        None => {}
    }
    if let Some(signs) = &current.signs {
        merged.signs = Some(signs.clone());
    }

    merged
}
