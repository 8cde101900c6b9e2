//! Merged view of everything the relays reported.
//!
//! Each record kind lives in a [`RecordMap`] keyed by [`LogicalKey`]. Merging
//! is last-write-wins on `(verified, created_at)`: a higher rank replaces the
//! current record and resets its provenance, an equal rank only records that
//! one more relay holds it. Since neither step depends on arrival order, every
//! interleaving of the same replicas converges to the same state.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use tracing::{debug, trace};

use crate::{
    badges::{AcceptedBadgeSet, BadgeAward, BadgeDefinition, DefinitionKey},
    contacts::{ContactList, ContactListKind},
    event::{kinds, Event},
    keys::Verifier,
    profile::Profile,
};

/// Which record of an author and kind a replica competes for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// One record per author and kind.
    Replaceable,
    /// One record per author, kind and `d` tag.
    Parameterized(String),
    /// Append-only kinds: every id is its own slot.
    Unique(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalKey {
    pub author: String,
    pub kind: u32,
    pub slot: Slot,
}

impl LogicalKey {
    pub fn of(ev: &Event) -> Self {
        let slot = if kinds::is_replaceable(ev.kind) {
            Slot::Replaceable
        } else if kinds::is_parameterized(ev.kind) {
            Slot::Parameterized(ev.d_tag().unwrap_or_default().to_string())
        } else {
            Slot::Unique(ev.id.clone())
        };
        Self {
            author: ev.pubkey.clone(),
            kind: ev.kind,
            slot,
        }
    }

    pub fn replaceable(author: impl Into<String>, kind: u32) -> Self {
        Self {
            author: author.into(),
            kind,
            slot: Slot::Replaceable,
        }
    }

    pub fn parameterized(author: impl Into<String>, kind: u32, d: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            kind,
            slot: Slot::Parameterized(d.into()),
        }
    }
}

/// Relays (or local source labels) known to hold a record.
pub type Provenance = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord<T> {
    pub data: T,
    pub source: Event,
    pub provenance: Provenance,
    pub verified: bool,
}

impl<T> MergedRecord<T> {
    pub fn rank(&self) -> (bool, u64) {
        (self.verified, self.source.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record became current for its key.
    Installed,
    /// The record tied with the current one; provenance grew.
    Replicated,
    /// Outranked, malformed or refused.
    Discarded,
}

/// One typed, last-write-wins map.
#[derive(Debug, Clone)]
pub struct RecordMap<T> {
    records: HashMap<LogicalKey, MergedRecord<T>>,
}

impl<T> Default for RecordMap<T> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

impl<T> RecordMap<T> {
    pub fn merge(&mut self, source: Event, data: T, relay: &str, verified: bool) -> MergeOutcome {
        let key = LogicalKey::of(&source);
        let rank = (verified, source.created_at);
        if let Some(current) = self.records.get_mut(&key) {
            if rank < current.rank() {
                return MergeOutcome::Discarded;
            }
            if rank == current.rank() {
                return if current.provenance.insert(relay.to_string()) {
                    MergeOutcome::Replicated
                } else {
                    MergeOutcome::Discarded
                };
            }
        }
        self.records.insert(
            key,
            MergedRecord {
                data,
                source,
                provenance: Provenance::from([relay.to_string()]),
                verified,
            },
        );
        MergeOutcome::Installed
    }

    pub fn get(&self, key: &LogicalKey) -> Option<&MergedRecord<T>> {
        self.records.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &MergedRecord<T>> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One owner list version, fetched or synthesized locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ListVersion {
    pub id: String,
    pub list: ContactList,
    pub event: Event,
    pub provenance: Provenance,
}

impl ListVersion {
    /// Fetched from a relay rather than built locally.
    pub fn is_signed(&self) -> bool {
        self.event.is_signed()
    }
}

/// Keys the resolution loop still has to look up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    pub definitions: BTreeSet<DefinitionKey>,
    pub issuers: BTreeSet<String>,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.issuers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BadgeInfo {
    pub definition: BadgeDefinition,
    pub event_id: String,
    pub created_at: u64,
    pub issuer_profile: Option<Profile>,
    pub provenance: Provenance,
    /// False for a definition whose signature did not check out.
    pub verified: bool,
}

/// An award joined with whatever is known about its definition and issuer.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardView {
    pub award_id: String,
    pub created_at: u64,
    pub definition: DefinitionKey,
    /// Absent until the definition has been fetched.
    pub badge_info: Option<BadgeInfo>,
    pub issuer_profile: Option<Profile>,
    pub issuer_contacts: Option<ContactList>,
    pub accepted: bool,
    pub provenance: Provenance,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedView {
    pub definition: DefinitionKey,
    pub award_id: String,
    pub relay_hint: Option<String>,
    pub badge_info: Option<BadgeInfo>,
}

/// Everything merged during one session.
pub struct RecordStore {
    owner: String,
    verifier: Arc<dyn Verifier>,
    profiles: RecordMap<Profile>,
    contact_lists: RecordMap<ContactList>,
    awards: RecordMap<BadgeAward>,
    definitions: RecordMap<BadgeDefinition>,
    accepted: RecordMap<AcceptedBadgeSet>,
    history: HashMap<String, ListVersion>,
    local_seq: u64,
    wanted_definitions: BTreeSet<DefinitionKey>,
    wanted_issuers: BTreeSet<String>,
}

impl RecordStore {
    pub fn new(owner: impl Into<String>, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            owner: owner.into(),
            verifier,
            profiles: RecordMap::default(),
            contact_lists: RecordMap::default(),
            awards: RecordMap::default(),
            definitions: RecordMap::default(),
            accepted: RecordMap::default(),
            history: HashMap::new(),
            local_seq: 0,
            wanted_definitions: BTreeSet::new(),
            wanted_issuers: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Merge one record reported by `relay`. Owner records that fail
    /// verification are refused; anyone else's are kept as unverified.
    pub fn ingest(&mut self, ev: Event, relay: &str) -> MergeOutcome {
        let verified = self.verifier.verify(&ev);
        if ev.pubkey == self.owner && !verified {
            debug!(relay, id = %ev.id, kind = ev.kind, "dropping unverified owner record");
            return MergeOutcome::Discarded;
        }
        match ev.kind {
            kinds::PROFILE => {
                let data = Profile::from_event(&ev);
                self.profiles.merge(ev, data, relay, verified)
            }
            kinds::CONTACTS | kinds::RELAY_LIST => {
                let Some(data) = ContactList::from_event(&ev) else {
                    return MergeOutcome::Discarded;
                };
                if ev.pubkey == self.owner {
                    self.record_version(&ev, &data, relay);
                }
                self.contact_lists.merge(ev, data, relay, verified)
            }
            kinds::BADGE_AWARD => {
                let Some(data) = BadgeAward::from_event(&ev) else {
                    return MergeOutcome::Discarded;
                };
                let definition = data.definition.clone();
                let outcome = self.awards.merge(ev, data, relay, verified);
                self.register_interest(definition);
                outcome
            }
            kinds::BADGE_DEFINITION => {
                let Some(data) = BadgeDefinition::from_event(&ev) else {
                    return MergeOutcome::Discarded;
                };
                self.definitions.merge(ev, data, relay, verified)
            }
            kinds::PROFILE_BADGES => {
                let Some(data) = AcceptedBadgeSet::from_event(&ev) else {
                    return MergeOutcome::Discarded;
                };
                self.accepted.merge(ev, data, relay, verified)
            }
            other => {
                trace!(relay, kind = other, "ignoring kind");
                MergeOutcome::Discarded
            }
        }
    }

    fn record_version(&mut self, ev: &Event, list: &ContactList, relay: &str) {
        self.history
            .entry(ev.id.clone())
            .or_insert_with(|| ListVersion {
                id: ev.id.clone(),
                list: list.clone(),
                event: ev.clone(),
                provenance: Provenance::new(),
            })
            .provenance
            .insert(relay.to_string());
    }

    fn register_interest(&mut self, definition: DefinitionKey) {
        self.wanted_issuers.insert(definition.issuer.clone());
        self.wanted_definitions.insert(definition);
    }

    /// Add a locally built owner list (loaded backup, combination) to the
    /// history under `label`. Returns its synthetic id.
    pub fn add_local_list(&mut self, list: ContactList, event: Event, label: &str) -> String {
        self.local_seq += 1;
        let prefix = label
            .trim_start_matches('<')
            .split(':')
            .next()
            .unwrap_or("local");
        let id = format!("{prefix}-{}", self.local_seq);
        let mut event = event;
        event.id = id.clone();
        self.history.insert(
            id.clone(),
            ListVersion {
                id: id.clone(),
                list,
                event,
                provenance: Provenance::from([label.to_string()]),
            },
        );
        id
    }

    /// Every owner list version, newest first.
    pub fn history(&self) -> Vec<&ListVersion> {
        let mut out: Vec<_> = self.history.values().collect();
        out.sort_by(|a, b| {
            b.list
                .created_at
                .cmp(&a.list.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn version(&self, id: &str) -> Option<&ListVersion> {
        self.history.get(id)
    }

    /// Newest signed owner list of `kind`, as fetched from relays. This is
    /// the version installed as current, so ties resolve the same way.
    pub fn latest_fetched(&self, kind: ContactListKind) -> Option<&ListVersion> {
        let current = self.owner_list(kind)?;
        self.history
            .get(&current.source.id)
            .filter(|v| v.is_signed())
    }

    /// Whether version `id` may be re-sent as is: it must be a signed record
    /// and the newest fetched one of its kind.
    pub fn can_rebroadcast(&self, id: &str) -> bool {
        let Some(version) = self.history.get(id) else {
            return false;
        };
        version.is_signed()
            && self
                .latest_fetched(version.list.kind)
                .map_or(false, |latest| latest.id == version.id)
    }

    /// The owner's current list of `kind`.
    pub fn owner_list(&self, kind: ContactListKind) -> Option<&MergedRecord<ContactList>> {
        self.contact_lists
            .get(&LogicalKey::replaceable(&*self.owner, kind.kind()))
    }

    pub fn owner_profile(&self) -> Option<&MergedRecord<Profile>> {
        self.profile(&self.owner)
    }

    pub fn profile(&self, author: &str) -> Option<&MergedRecord<Profile>> {
        self.profiles
            .get(&LogicalKey::replaceable(author, kinds::PROFILE))
    }

    pub fn contact_list(&self, author: &str, kind: ContactListKind) -> Option<&MergedRecord<ContactList>> {
        self.contact_lists
            .get(&LogicalKey::replaceable(author, kind.kind()))
    }

    pub fn definition(&self, key: &DefinitionKey) -> Option<&MergedRecord<BadgeDefinition>> {
        self.definitions.get(&LogicalKey::parameterized(
            &*key.issuer,
            kinds::BADGE_DEFINITION,
            &*key.d,
        ))
    }

    /// The owner's accepted badge set.
    pub fn accepted_set(&self) -> Option<&MergedRecord<AcceptedBadgeSet>> {
        self.accepted.get(&LogicalKey::parameterized(
            &*self.owner,
            kinds::PROFILE_BADGES,
            kinds::PROFILE_BADGES_D,
        ))
    }

    /// Snapshot of the interest registries.
    pub fn interest(&self) -> Interest {
        Interest {
            definitions: self.wanted_definitions.clone(),
            issuers: self.wanted_issuers.clone(),
        }
    }

    fn badge_info(&self, key: &DefinitionKey) -> Option<BadgeInfo> {
        let merged = self.definition(key)?;
        Some(BadgeInfo {
            definition: merged.data.clone(),
            event_id: merged.source.id.clone(),
            created_at: merged.source.created_at,
            issuer_profile: self.profile(&key.issuer).map(|p| p.data.clone()),
            provenance: merged.provenance.clone(),
            verified: merged.verified,
        })
    }

    /// Awards joined with their definitions at read time, newest first.
    pub fn award_views(&self) -> Vec<AwardView> {
        let accepted = self.accepted_set().map(|a| &a.data);
        let mut views: Vec<AwardView> = self
            .awards
            .values()
            .map(|award| {
                let key = &award.data.definition;
                AwardView {
                    award_id: award.source.id.clone(),
                    created_at: award.source.created_at,
                    definition: key.clone(),
                    badge_info: self.badge_info(key),
                    issuer_profile: self.profile(&key.issuer).map(|p| p.data.clone()),
                    issuer_contacts: self
                        .contact_list(&key.issuer, ContactListKind::Contacts)
                        .map(|c| c.data.clone()),
                    accepted: accepted.map_or(false, |set| set.contains(key)),
                    provenance: award.provenance.clone(),
                    verified: award.verified,
                }
            })
            .collect();
        views.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.award_id.cmp(&b.award_id))
        });
        views
    }

    /// Entries of the owner's accepted badge set with definitions resolved.
    pub fn accepted_views(&self) -> Vec<AcceptedView> {
        let Some(set) = self.accepted_set() else {
            return Vec::new();
        };
        set.data
            .entries
            .iter()
            .map(|e| AcceptedView {
                definition: e.definition.clone(),
                award_id: e.award_id.clone(),
                relay_hint: e.relay_hint.clone(),
                badge_info: self.badge_info(&e.definition),
            })
            .collect()
    }

    /// Canonical relays named by fetched owner lists, in first-seen order.
    pub fn discovered_relays(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for version in self.history().into_iter().filter(|v| v.is_signed()) {
            for url in &version.list.relays_normalized {
                if !out.contains(url) {
                    out.push(url.clone());
                }
            }
        }
        out
    }

    pub fn award_count(&self) -> usize {
        self.awards.len()
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }
}
