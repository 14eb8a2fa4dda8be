//! Server-side per-client edit throttling.
//!
//! The reference deployment trusted the client to enforce its own cooldown,
//! which a non-conforming client can bypass. This gate re-checks the
//! cooldown on the server, keyed by the stable client identifier, as part
//! of edit acceptance. Rejected edits do not reset the window.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::ClientId;

/// Per-client last-accepted-edit map consulted atomically during edit
/// acceptance.
#[derive(Debug)]
pub struct EditGate {
    cooldown: Duration,
    last_edit: DashMap<ClientId, Instant>,
}

impl EditGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_edit: DashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Accept or reject an edit for the given client.
    ///
    /// On acceptance the client's timestamp is updated in the same map
    /// operation, so two racing edits from one client cannot both pass.
    /// Returns the remaining wait on rejection.
    pub fn check_and_stamp(&self, client: &str) -> Result<(), Duration> {
        self.check_and_stamp_at(client, Instant::now())
    }

    fn check_and_stamp_at(&self, client: &str, now: Instant) -> Result<(), Duration> {
        // The entry guard holds the shard lock, making check + update atomic
        match self.last_edit.entry(client.to_string()) {
            Entry::Occupied(mut entry) => {
                let elapsed = now.saturating_duration_since(*entry.get());
                if elapsed < self.cooldown {
                    return Err(self.cooldown - elapsed);
                }
                entry.insert(now);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(())
            }
        }
    }

    /// Drop tracking for clients that have been idle for longer than the
    /// cooldown; their next edit would be accepted anyway.
    pub fn prune(&self) {
        let now = Instant::now();
        self.last_edit
            .retain(|_, last| now.saturating_duration_since(*last) < self.cooldown);
    }

    pub fn tracked_clients(&self) -> usize {
        self.last_edit.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_edit_allowed() {
        let gate = EditGate::new(Duration::from_secs(30));
        assert!(gate.check_and_stamp("client-1").is_ok());
    }

    #[test]
    fn test_second_edit_within_cooldown_rejected() {
        let gate = EditGate::new(Duration::from_secs(30));
        let start = Instant::now();

        gate.check_and_stamp_at("client-1", start).unwrap();
        let err = gate
            .check_and_stamp_at("client-1", start + Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err, Duration::from_secs(20));
    }

    #[test]
    fn test_rejection_does_not_reset_window() {
        let gate = EditGate::new(Duration::from_secs(30));
        let start = Instant::now();

        gate.check_and_stamp_at("client-1", start).unwrap();
        // Hammering during the window never pushes the deadline out
        for s in 1..5 {
            assert!(gate
                .check_and_stamp_at("client-1", start + Duration::from_secs(s))
                .is_err());
        }
        assert!(gate
            .check_and_stamp_at("client-1", start + Duration::from_secs(30))
            .is_ok());
    }

    #[test]
    fn test_clients_are_independent() {
        let gate = EditGate::new(Duration::from_secs(30));
        let start = Instant::now();

        gate.check_and_stamp_at("client-1", start).unwrap();
        assert!(gate.check_and_stamp_at("client-2", start).is_ok());
    }

    #[test]
    fn test_zero_cooldown_always_allows() {
        let gate = EditGate::new(Duration::ZERO);
        for _ in 0..10 {
            assert!(gate.check_and_stamp("client-1").is_ok());
        }
    }

    #[test]
    fn test_prune_drops_expired_entries() {
        let gate = EditGate::new(Duration::ZERO);
        gate.check_and_stamp("client-1").unwrap();
        gate.check_and_stamp("client-2").unwrap();
        assert_eq!(gate.tracked_clients(), 2);

        gate.prune();
        assert_eq!(gate.tracked_clients(), 0);
    }
}
