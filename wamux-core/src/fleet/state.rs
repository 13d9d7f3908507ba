//! Consolidated per-session flag state.
//!
//! The lifecycle flags that used to be scattered globals live in one value
//! with set semantics per flag. All sets are sharded concurrent maps, so
//! flag flips never contend with the fleet's hot paths.

use dashmap::DashSet;

/// Which flag set an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    /// Held strictly between socket creation and the first definitive
    /// outcome (open or permanent failure).
    Initializing,
    /// Operator-initiated disconnect; the scheduler must not auto-reconnect.
    VoluntarilyDisconnected,
    /// Web session this controller has assumed ownership of.
    DetectedWeb,
    /// Session saw a post-pairing restart code (515/516).
    RestartPending,
    /// Tagged for the complex restart path (515 flow enabled).
    ComplexRestart,
}

/// The fleet's flag state.
#[derive(Default)]
pub struct FleetState {
    initializing: DashSet<String>,
    voluntarily_disconnected: DashSet<String>,
    detected_web: DashSet<String>,
    restart_pending: DashSet<String>,
    complex_restart: DashSet<String>,
}

impl FleetState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, flag: SessionFlag) -> &DashSet<String> {
        match flag {
            SessionFlag::Initializing => &self.initializing,
            SessionFlag::VoluntarilyDisconnected => &self.voluntarily_disconnected,
            SessionFlag::DetectedWeb => &self.detected_web,
            SessionFlag::RestartPending => &self.restart_pending,
            SessionFlag::ComplexRestart => &self.complex_restart,
        }
    }

    /// Raise a flag. Returns false when it was already set.
    pub fn mark(&self, flag: SessionFlag, session_id: &str) -> bool {
        self.set(flag).insert(session_id.to_string())
    }

    /// Clear a flag. Returns whether it was set.
    pub fn clear(&self, flag: SessionFlag, session_id: &str) -> bool {
        self.set(flag).remove(session_id).is_some()
    }

    /// Whether a flag is set.
    pub fn contains(&self, flag: SessionFlag, session_id: &str) -> bool {
        self.set(flag).contains(session_id)
    }

    /// Remove the session from every flag set. Runs after full cleanup so
    /// no set retains a tombstone.
    pub fn clear_session(&self, session_id: &str) {
        self.initializing.remove(session_id);
        self.voluntarily_disconnected.remove(session_id);
        self.detected_web.remove(session_id);
        self.restart_pending.remove(session_id);
        self.complex_restart.remove(session_id);
    }

    /// Drop flag entries whose session no longer satisfies `known`.
    /// Returns how many entries were removed across all sets.
    ///
    /// The voluntary-disconnect set is exempt: it intentionally outlives
    /// the registry entry so a later event cannot resurrect the session.
    pub fn sweep_stale<F>(&self, known: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for set in [
            &self.initializing,
            &self.detected_web,
            &self.restart_pending,
            &self.complex_restart,
        ] {
            let before = set.len();
            set.retain(|id| known(id));
            removed += before - set.len();
        }
        removed
    }

    /// Number of sessions in a flag set.
    pub fn count(&self, flag: SessionFlag) -> usize {
        self.set(flag).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_clear_contains() {
        let state = FleetState::new();

        assert!(state.mark(SessionFlag::Initializing, "session_1"));
        // Second mark reports already-set.
        assert!(!state.mark(SessionFlag::Initializing, "session_1"));
        assert!(state.contains(SessionFlag::Initializing, "session_1"));

        assert!(state.clear(SessionFlag::Initializing, "session_1"));
        assert!(!state.clear(SessionFlag::Initializing, "session_1"));
        assert!(!state.contains(SessionFlag::Initializing, "session_1"));
    }

    #[test]
    fn test_flags_are_independent() {
        let state = FleetState::new();
        state.mark(SessionFlag::VoluntarilyDisconnected, "session_1");

        assert!(!state.contains(SessionFlag::Initializing, "session_1"));
        assert!(!state.contains(SessionFlag::RestartPending, "session_1"));
        assert!(state.contains(SessionFlag::VoluntarilyDisconnected, "session_1"));
    }

    #[test]
    fn test_clear_session_empties_every_set() {
        let state = FleetState::new();
        for flag in [
            SessionFlag::Initializing,
            SessionFlag::VoluntarilyDisconnected,
            SessionFlag::DetectedWeb,
            SessionFlag::RestartPending,
            SessionFlag::ComplexRestart,
        ] {
            state.mark(flag, "session_1");
        }

        state.clear_session("session_1");

        for flag in [
            SessionFlag::Initializing,
            SessionFlag::VoluntarilyDisconnected,
            SessionFlag::DetectedWeb,
            SessionFlag::RestartPending,
            SessionFlag::ComplexRestart,
        ] {
            assert!(!state.contains(flag, "session_1"), "{flag:?}");
        }
    }

    #[test]
    fn test_sweep_stale_spares_voluntary() {
        let state = FleetState::new();
        state.mark(SessionFlag::Initializing, "session_gone");
        state.mark(SessionFlag::RestartPending, "session_gone");
        state.mark(SessionFlag::VoluntarilyDisconnected, "session_gone");
        state.mark(SessionFlag::Initializing, "session_live");

        let removed = state.sweep_stale(|id| id == "session_live");

        assert_eq!(removed, 2);
        assert!(state.contains(SessionFlag::Initializing, "session_live"));
        assert!(!state.contains(SessionFlag::Initializing, "session_gone"));
        // Voluntary flag survives the sweep.
        assert!(state.contains(SessionFlag::VoluntarilyDisconnected, "session_gone"));
    }
}
