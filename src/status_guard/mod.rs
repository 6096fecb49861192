//! Status Guard (§4.8) — field allow-list and monotonic phase transition
//! rules shared by the Run Store, Event Gateway, and Reconciler.

use crate::error::{Error, Result};
use crate::store::models::Phase;

const RESULT_EXCERPT_MAX_BYTES: usize = 10 * 1024;

/// Whether `from -> to` is a legal phase transition absent a Reconciler
/// override (§4.8): `Pending -> Creating -> Running -> AwaitingInput <-> Running
/// -> {Completed|Failed|Stopped|Error}`. Terminal phases are sticky.
pub fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if from == to {
        return true;
    }
    if from.is_terminal() {
        return false;
    }

    matches!(
        (from, to),
        (Pending, Creating)
            | (Pending, Error)
            | (Creating, Running)
            | (Creating, Error)
            | (Creating, Failed)
            | (Running, AwaitingInput)
            | (AwaitingInput, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Stopped)
            | (Running, Error)
            | (AwaitingInput, Completed)
            | (AwaitingInput, Failed)
            | (AwaitingInput, Stopped)
            | (AwaitingInput, Error)
            | (Creating, Stopped)
            | (Pending, Stopped)
    )
}

/// Validates a proposed phase transition, honoring the Reconciler's
/// `force=true` override (which must still carry a reason elsewhere in the
/// caller's logging, but is not itself gated here).
pub fn check_transition(from: Phase, to: Phase, force: bool) -> Result<()> {
    if force || is_legal_transition(from, to) {
        Ok(())
    } else {
        Err(Error::Conflict(format!(
            "illegal phase transition {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Truncates `result_excerpt` to the 10 KiB limit (§3.1, §4.8), respecting
/// UTF-8 character boundaries.
pub fn truncate_result_excerpt(excerpt: &str) -> String {
    truncate_to_bytes(excerpt, RESULT_EXCERPT_MAX_BYTES)
}

/// Truncates `s` to at most `max_bytes`, walking back to the nearest UTF-8
/// character boundary. Shared by `truncate_result_excerpt` (10 KiB) and the
/// Reconciler's pod termination message truncation (2 KiB, §4.5).
pub fn truncate_to_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_sequence_is_legal() {
        assert!(is_legal_transition(Phase::Pending, Phase::Creating));
        assert!(is_legal_transition(Phase::Creating, Phase::Running));
        assert!(is_legal_transition(Phase::Running, Phase::Completed));
    }

    #[test]
    fn awaiting_input_round_trips_with_running() {
        assert!(is_legal_transition(Phase::Running, Phase::AwaitingInput));
        assert!(is_legal_transition(Phase::AwaitingInput, Phase::Running));
    }

    #[test]
    fn terminal_phases_are_sticky() {
        assert!(!is_legal_transition(Phase::Completed, Phase::Running));
        assert!(!is_legal_transition(Phase::Failed, Phase::Pending));
        assert!(check_transition(Phase::Completed, Phase::Running, false).is_err());
    }

    #[test]
    fn force_overrides_illegal_transition() {
        assert!(check_transition(Phase::Completed, Phase::Running, true).is_ok());
    }

    #[test]
    fn skipping_creating_is_illegal() {
        assert!(!is_legal_transition(Phase::Pending, Phase::Running));
    }

    #[test]
    fn result_excerpt_truncates_to_10kib_on_char_boundary() {
        let huge = "a".repeat(20 * 1024);
        let truncated = truncate_result_excerpt(&huge);
        assert_eq!(truncated.len(), RESULT_EXCERPT_MAX_BYTES);

        let multibyte = "é".repeat(6 * 1024);
        let truncated = truncate_result_excerpt(&multibyte);
        assert!(truncated.len() <= RESULT_EXCERPT_MAX_BYTES);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
