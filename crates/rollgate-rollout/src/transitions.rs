use crate::error::RolloutError;
use rollgate_model::RolloutStage;

/// Validates a stage transition against [`allowed_transitions`].
pub fn validate_transition(from: RolloutStage, to: RolloutStage) -> Result<(), RolloutError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(RolloutError::IllegalTransition { from, to })
    }
}

/// Stages reachable from `from` in one step.
///
/// Forward by exactly one stage, plus the rollback edge from every
/// non-terminal stage.
#[must_use]
pub fn allowed_transitions(from: RolloutStage) -> Vec<RolloutStage> {
    use RolloutStage::{Canary10, Canary50, Completed, Full100, NotStarted, RolledBack};
    match from {
        NotStarted => vec![Canary10, RolledBack],
        Canary10 => vec![Canary50, RolledBack],
        Canary50 => vec![Full100, RolledBack],
        Full100 => vec![Completed, RolledBack],
        Completed | RolledBack => vec![],
    }
}

fn allowed(from: RolloutStage, to: RolloutStage) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
