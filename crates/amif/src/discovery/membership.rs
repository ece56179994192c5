//! Membership table: what this node believes about every module it has heard of.
//!
//! Records merge as a join-semilattice: for each id only the record with the
//! greatest `(incarnation, state rank, last_updated)` survives (see
//! [`ModuleRecord::supersedes`]). Merging is therefore idempotent and
//! commutative, and an incarnation can never go backwards.
//!
//! Alongside each record the table keeps local timer bookkeeping that is never
//! gossiped: when the entry was last refreshed, when it entered its current
//! state, and when it last changed at all.

use amif_common::{MemberState, MembershipEvent, ModuleRecord};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    record: ModuleRecord,
    /// Last proof of life (local clock)
    refreshed_at: u64,
    /// When the current state (or incarnation) was entered
    state_since: u64,
    /// Last change of any kind; recent changes are gossiped first
    changed_at: u64,
}

impl Entry {
    fn new(record: ModuleRecord, now: u64) -> Self {
        Self {
            record,
            refreshed_at: now,
            state_since: now,
            changed_at: now,
        }
    }
}

/// Result of merging one digest
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Records that replaced (or were added to) the table
    pub changed: Vec<ModuleRecord>,
    /// Externally visible state changes among them
    pub events: Vec<MembershipEvent>,
    /// New local incarnation, if a peer's claim about us had to be refuted
    pub refuted: Option<u64>,
}

/// Map of module id to its winning record
#[derive(Debug, Default)]
pub struct MembershipTable {
    local_id: Option<String>,
    entries: HashMap<String, Entry>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn local_record(&self) -> Option<ModuleRecord> {
        self.local_id.as_ref().and_then(|id| self.get(id))
    }

    pub fn get(&self, id: &str) -> Option<ModuleRecord> {
        self.entries.get(id).map(|e| e.record.clone())
    }

    /// Register the local module as ALIVE.
    ///
    /// If the table already holds a record for this id (an earlier run, or
    /// gossip about a previous life) the incarnation is raised above it.
    pub fn register_local(&mut self, mut record: ModuleRecord, now: u64) -> Option<MembershipEvent> {
        let old_state = match self.entries.get(&record.id) {
            Some(existing) => {
                if existing.record.incarnation >= record.incarnation {
                    record.incarnation = existing.record.incarnation + 1;
                }
                Some(existing.record.state)
            }
            None => None,
        };

        record.state = MemberState::Alive;
        record.last_updated = now;

        self.local_id = Some(record.id.clone());
        let id = record.id.clone();
        self.entries.insert(id.clone(), Entry::new(record, now));

        (old_state != Some(MemberState::Alive)).then(|| MembershipEvent {
            module_id: id,
            old_state,
            new_state: MemberState::Alive,
        })
    }

    /// Advance the local heartbeat so peers see fresh evidence of life
    pub fn heartbeat(&mut self, now: u64) {
        let Some(id) = self.local_id.as_ref() else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(id) {
            entry.record.last_updated = entry.record.last_updated.max(now);
            entry.refreshed_at = now;
            entry.changed_at = now;
        }
    }

    /// Merge a gossip digest
    pub fn merge(&mut self, digest: &[ModuleRecord], now: u64) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for incoming in digest {
            if self.local_id.as_deref() == Some(incoming.id.as_str()) {
                self.merge_local(incoming, now, &mut outcome);
            } else {
                self.merge_remote(incoming, now, &mut outcome);
            }
        }

        outcome
    }

    /// Only we speak for ourselves: any claim that outranks our own record
    /// (suspicion, death, a newer incarnation from a previous life) is
    /// answered by moving our incarnation past it.
    fn merge_local(&mut self, incoming: &ModuleRecord, now: u64, outcome: &mut MergeOutcome) {
        let Some(entry) = self.entries.get_mut(&incoming.id) else {
            return;
        };
        if !incoming.supersedes(&entry.record) {
            return;
        }

        entry.record.incarnation = incoming.incarnation + 1;
        entry.record.state = MemberState::Alive;
        entry.record.last_updated = now;
        entry.refreshed_at = now;
        entry.changed_at = now;

        outcome.refuted = Some(entry.record.incarnation);
        outcome.changed.push(entry.record.clone());
    }

    fn merge_remote(&mut self, incoming: &ModuleRecord, now: u64, outcome: &mut MergeOutcome) {
        let Some(entry) = self.entries.get_mut(&incoming.id) else {
            self.entries
                .insert(incoming.id.clone(), Entry::new(incoming.clone(), now));
            outcome.changed.push(incoming.clone());
            outcome.events.push(MembershipEvent {
                module_id: incoming.id.clone(),
                old_state: None,
                new_state: incoming.state,
            });
            return;
        };

        if !incoming.supersedes(&entry.record) {
            return;
        }

        let old = &entry.record;
        let incarnation_rose = incoming.incarnation > old.incarnation;
        let state_changed = incoming.state != old.state;

        if incoming.is_alive() || incarnation_rose {
            entry.refreshed_at = now;
        }
        if incarnation_rose || state_changed {
            entry.state_since = now;
        }
        if state_changed {
            outcome.events.push(MembershipEvent {
                module_id: incoming.id.clone(),
                old_state: Some(old.state),
                new_state: incoming.state,
            });
        }

        entry.record = incoming.clone();
        entry.changed_at = now;
        outcome.changed.push(incoming.clone());
    }

    /// Run the failure detector.
    ///
    /// ALIVE entries without refresh for `suspect_timeout` become SUSPECT;
    /// SUSPECT entries that stay so for `dead_timeout` become DEAD.
    pub fn advance_timers(&mut self, now: u64, suspect_timeout: u64, dead_timeout: u64) -> Vec<MembershipEvent> {
        let mut events = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if self.local_id.as_deref() == Some(id.as_str()) {
                continue;
            }

            let next = match entry.record.state {
                MemberState::Alive if now.saturating_sub(entry.refreshed_at) >= suspect_timeout => {
                    MemberState::Suspect
                }
                MemberState::Suspect if now.saturating_sub(entry.state_since) >= dead_timeout => {
                    MemberState::Dead
                }
                _ => continue,
            };

            events.push(MembershipEvent {
                module_id: id.clone(),
                old_state: Some(entry.record.state),
                new_state: next,
            });

            entry.record.state = next;
            entry.record.last_updated = now;
            entry.state_since = now;
            entry.changed_at = now;
        }

        events
    }

    /// Drop DEAD entries that have been dead for at least `retention`
    pub fn collect_garbage(&mut self, now: u64, retention: u64) -> Vec<String> {
        let local_id = self.local_id.clone();
        let mut removed = Vec::new();

        self.entries.retain(|id, entry| {
            let expired = entry.record.state == MemberState::Dead
                && now.saturating_sub(entry.state_since) >= retention
                && local_id.as_deref() != Some(id.as_str());
            if expired {
                removed.push(id.clone());
            }
            !expired
        });

        removed
    }

    /// All ALIVE records, local included, ordered by id
    pub fn alive_members(&self) -> Vec<ModuleRecord> {
        let mut members: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.record.is_alive())
            .map(|e| e.record.clone())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// ALIVE records other than our own
    pub fn alive_peers(&self) -> Vec<ModuleRecord> {
        let mut peers = self.alive_members();
        peers.retain(|r| self.local_id.as_deref() != Some(r.id.as_str()));
        peers
    }

    /// Every record, ordered by id
    pub fn snapshot(&self) -> Vec<ModuleRecord> {
        let mut records: Vec<_> = self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Records to gossip: everything if it fits, otherwise our own record
    /// followed by the most recently changed ones.
    pub fn digest(&self, max_entries: usize) -> Vec<ModuleRecord> {
        if self.entries.len() <= max_entries {
            return self.snapshot();
        }

        let mut digest = Vec::with_capacity(max_entries);
        if let Some(local) = self.local_record() {
            digest.push(local);
        }

        let mut others: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|(id, _)| self.local_id.as_deref() != Some(id.as_str()))
            .map(|(_, e)| e)
            .collect();
        others.sort_by(|a, b| {
            b.changed_at
                .cmp(&a.changed_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        let room = max_entries.saturating_sub(digest.len());
        digest.extend(others.into_iter().take(room).map(|e| e.record.clone()));
        digest
    }
}


#[cfg(test)]
mod laws {
    //! Merge laws over arbitrary digests.

    use super::*;
    use proptest::prelude::*;

    fn record_strategy() -> impl Strategy<Value = ModuleRecord> {
        (
            0..4usize,
            0..2usize,
            0..4u64,
            prop_oneof![
                Just(MemberState::Alive),
                Just(MemberState::Suspect),
                Just(MemberState::Dead)
            ],
            0..5u64,
        )
            .prop_map(|(id, addr, incarnation, state, last_updated)| ModuleRecord {
                id: format!("m{}", id),
                address: format!("10.0.0.{}:7946", addr),
                incarnation,
                state,
                last_updated,
            })
    }

    fn digest_strategy() -> impl Strategy<Value = Vec<ModuleRecord>> {
        prop::collection::vec(record_strategy(), 0..8)
    }

    fn merged(digests: &[&[ModuleRecord]]) -> Vec<ModuleRecord> {
        let mut table = MembershipTable::new();
        for digest in digests {
            table.merge(digest, 0);
        }
        table.snapshot()
    }

    proptest! {
        /// Property: merging the same digest twice equals merging it once.
        #[test]
        fn prop_merge_is_idempotent(a in digest_strategy()) {
            prop_assert_eq!(merged(&[&a, &a]), merged(&[&a]));
        }

        /// Property: arrival order of two digests does not matter.
        #[test]
        fn prop_merge_is_commutative(a in digest_strategy(), b in digest_strategy()) {
            prop_assert_eq!(merged(&[&a, &b]), merged(&[&b, &a]));
        }

        /// Property: no record is ever replaced by a lower incarnation.
        #[test]
        fn prop_incarnation_never_decreases(a in digest_strategy(), b in digest_strategy()) {
            let mut table = MembershipTable::new();
            table.merge(&a, 0);
            let before = table.snapshot();
            table.merge(&b, 0);

            for old in before {
                let now = table.get(&old.id).unwrap();
                prop_assert!(now.incarnation >= old.incarnation);
                prop_assert!(!old.supersedes(&now));
            }
        }
    }
}
