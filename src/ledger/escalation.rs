//! Punishment escalation
//!
//! Pure decision function turning a warning count into a punishment decision.

use derive_more::Display;

use super::punishment::PunishmentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Decision {
    /// Nothing to do
    #[display("skip")]
    Skip,
    /// Punish the reachable target now (subject to the configured delay)
    #[display("apply")]
    ApplyNow,
    /// Queue the punishment until the target is reachable again
    #[display("defer")]
    Defer,
}

/// Decide what to do after a warning brought an account to `warning_count`
///
/// Rules apply in order: disabled or under threshold skips, bypass skips,
/// a reachable target is punished now, anyone else is deferred.
#[must_use]
pub fn decide(
    warning_count: u64,
    threshold: u64,
    kind: PunishmentKind,
    has_bypass: bool,
    is_reachable: bool,
) -> Decision {
    let below_threshold = kind == PunishmentKind::None || warning_count < threshold;
    if below_threshold || has_bypass {
        Decision::Skip
    } else if is_reachable {
        Decision::ApplyNow
    } else {
        Decision::Defer
    }
}
