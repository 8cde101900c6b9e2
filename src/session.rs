//! One aggregation session for one owner.
//!
//! A [`Session`] owns the connection pool and the record store. Logging out or
//! reloading is [`Session::reset`]: every transport is closed, the generation
//! counter moves on, and results still in flight for the old generation are
//! thrown away when they arrive.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    backup,
    badges::{self, AcceptedBadge, DefinitionKey},
    broadcast::{self, BroadcastReport, PublishMode},
    contacts::{self, ContactList, ContactListKind, RelayFlags, RelayMembership},
    error::{Error, Result},
    event::{kinds, unix_now, Event},
    filter::Filter,
    keys::{Signer, Verifier},
    pool::{ConnectionInfo, Opened, Pool},
    relay_url,
    resolver::{self, Resolution},
    store::{Interest, MergeOutcome, RecordStore},
    transport::Connector,
};

/// Well-known relays that accept writes from anyone, used to bootstrap an
/// account that has no contact list yet.
pub const GLOBAL_FAMOUS_FREE: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.current.fyi",
    "wss://relay.snort.social",
    "wss://nostr-pub.semisol.dev",
    "wss://nostr-pub.wellorder.net",
    "wss://offchain.pub",
];

const RECOVERY_RELAYS: usize = 5;

/// Provenance label of records this session signed and sent itself.
pub const PUBLISHED_SOURCE: &str = "<published>";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hex public key whose graph is aggregated.
    pub owner: String,
    /// Relays opened by [`Session::sync`].
    pub relays: Vec<String>,
    pub publish_mode: PublishMode,
    pub resolve_backoff: Duration,
    /// Open relays named in the owner's fetched lists.
    pub auto_connect_discovered: bool,
}

impl SessionConfig {
    pub fn new(owner: impl Into<String>, relays: Vec<String>) -> Self {
        Self {
            owner: owner.into(),
            relays,
            publish_mode: PublishMode::default(),
            resolve_backoff: Duration::from_millis(1500),
            auto_connect_discovered: true,
        }
    }
}

/// State of one generation: its pool and store.
pub(crate) struct Shared {
    pub(crate) pool: Pool,
    owner: String,
    store: Mutex<RecordStore>,
    generation: Arc<AtomicU64>,
    epoch: u64,
}

impl Shared {
    pub(crate) fn new(
        owner: &str,
        connector: Arc<dyn Connector>,
        verifier: Arc<dyn Verifier>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        let epoch = generation.load(Ordering::SeqCst);
        Self {
            pool: Pool::new(connector),
            owner: owner.to_string(),
            store: Mutex::new(RecordStore::new(owner, verifier)),
            generation,
            epoch,
        }
    }

    pub(crate) fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.epoch
    }

    fn lock(&self) -> MutexGuard<'_, RecordStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge results from `relay`. Returns `false`, merging nothing, when the
    /// session has been reset since these results were requested.
    pub(crate) fn merge(&self, events: Vec<Event>, relay: &str) -> bool {
        let mut store = self.lock();
        if !self.is_current() {
            debug!(relay, dropped = events.len(), "discarding results from a previous session");
            return false;
        }
        let mut changed = 0;
        for ev in events {
            if store.ingest(ev, relay) != MergeOutcome::Discarded {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(relay, changed, "merged");
        }
        true
    }

    pub(crate) fn interest(&self) -> Interest {
        self.lock().interest()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        f(&self.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut RecordStore) -> R) -> R {
        f(&mut self.lock())
    }
}

/// What one [`Session::sync`] run did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Relays whose initial batch completed.
    pub loaded: Vec<String>,
    /// Relays that failed, were already open or dropped mid-batch.
    pub skipped: Vec<String>,
    /// Relays opened because a fetched owner list named them.
    pub discovered: Vec<String>,
    /// Resolution rounds across every relay.
    pub resolution_rounds: usize,
    pub connections: Vec<ConnectionInfo>,
}

enum Step {
    Initial { url: String, discovered: Vec<String> },
    Resolved { url: String, resolution: Resolution },
    Skipped { url: String },
}

/// A signed record and how the relays took it.
#[derive(Debug, Clone)]
pub struct Published {
    pub event: Event,
    pub report: BroadcastReport,
}

pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    verifier: Arc<dyn Verifier>,
    signer: Option<Arc<dyn Signer>>,
    generation: Arc<AtomicU64>,
    shared: Mutex<Arc<Shared>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        verifier: Arc<dyn Verifier>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(Shared::new(
            &config.owner,
            connector.clone(),
            verifier.clone(),
            generation.clone(),
        ));
        Self {
            config,
            connector,
            verifier,
            signer,
            generation,
            shared: Mutex::new(shared),
        }
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn current(&self) -> Arc<Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Close everything and start over with empty stores.
    pub fn reset(&self) {
        let old = {
            let mut current = self
                .shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            current.pool.close_all();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let fresh = Arc::new(Shared::new(
                &self.config.owner,
                self.connector.clone(),
                self.verifier.clone(),
                self.generation.clone(),
            ));
            std::mem::replace(&mut *current, fresh)
        };
        info!(generation = old.epoch + 1, "session reset");
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Read the merged state.
    pub fn read<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        self.current().read(f)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.current().pool.snapshot()
    }

    pub fn set_selected(&self, url: &str, selected: bool) -> bool {
        self.current().pool.set_selected(url, selected)
    }

    /// Connect to every configured relay in parallel, run each one's initial
    /// batch and resolution loop, and follow discovered relays, until all of
    /// that work has finished.
    pub async fn sync(&self) -> SyncReport {
        let shared = self.current();
        let mut tasks = JoinSet::new();
        let mut launched = HashSet::new();
        let mut report = SyncReport::default();

        for url in self.config.relays.iter().map(|u| relay_url::normalize(u)) {
            if !relay_url::is_valid_normalized(&url) {
                warn!(relay = %url, "skipping invalid relay");
                continue;
            }
            if launched.insert(url.clone()) {
                tasks.spawn(initial_step(shared.clone(), url, self.config.auto_connect_discovered));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let step = match joined {
                Ok(step) => step,
                Err(e) => {
                    warn!(error = %e, "relay task failed");
                    continue;
                }
            };
            match step {
                Step::Initial { url, discovered } => {
                    let backoff = self.config.resolve_backoff;
                    let resolving = shared.clone();
                    let relay = url.clone();
                    tasks.spawn(async move {
                        let resolution = resolver::resolve(&resolving, &relay, backoff).await;
                        Step::Resolved {
                            url: relay,
                            resolution,
                        }
                    });
                    report.loaded.push(url);
                    for found in discovered {
                        if launched.insert(found.clone()) && !shared.pool.contains(&found) {
                            info!(relay = %found, "connecting to discovered relay");
                            report.discovered.push(found.clone());
                            tasks.spawn(initial_step(
                                shared.clone(),
                                found,
                                self.config.auto_connect_discovered,
                            ));
                        }
                    }
                }
                Step::Resolved { url, resolution } => {
                    debug!(relay = %url, ?resolution, "resolution finished");
                    if let Resolution::Converged { iterations } = resolution {
                        report.resolution_rounds += iterations;
                    }
                }
                Step::Skipped { url } => report.skipped.push(url),
            }
        }
        report.connections = shared.pool.snapshot();
        report
    }

    /// Add a relay typed in by the user. It is connected without an initial
    /// batch.
    pub async fn add_relay(&self, input: &str) -> Result<Opened> {
        let url = relay_url::normalize(input);
        if !relay_url::is_valid_normalized(&url) {
            return Err(Error::InvalidRelayUrl(input.to_string()));
        }
        Ok(self.current().pool.open(&url, true).await)
    }

    /// Load a backup file into the list history. Returns the new list id.
    pub fn load_backup(&self, text: &str, name: &str) -> String {
        let parsed = backup::parse(text);
        let other_user = parsed.from_other_user(&self.config.owner);
        if other_user {
            warn!(file = name, "backup belongs to a different user");
        }
        let now = unix_now();
        let list = ContactList::new(ContactListKind::Contacts, now, parsed.contacts, parsed.relays);
        let draft = contacts::contacts_event_from(&list, &self.config.owner, now);
        let label = backup::source_label(name, other_user);
        self.current()
            .write(|s| s.add_local_list(list, draft, &label))
    }

    /// Render list `id` as a backup file. Returns the file name and text.
    pub fn export(&self, id: &str) -> Result<(String, String)> {
        self.current().read(|s| {
            let version = s
                .version(id)
                .ok_or_else(|| Error::UnknownList(id.to_string()))?;
            let username = s
                .owner_profile()
                .map(|p| p.data.username.clone())
                .unwrap_or_default();
            let text = backup::export(&version.list, &version.provenance, s.owner(), &username)?;
            Ok((backup::file_name(&version.list), text))
        })
    }

    /// Combine several list versions into a new local contacts list.
    pub fn combine(&self, ids: &[String]) -> Result<String> {
        let now = unix_now();
        self.current().write(|s| {
            let lists = ids
                .iter()
                .map(|id| {
                    s.version(id)
                        .map(|v| v.list.clone())
                        .ok_or_else(|| Error::UnknownList(id.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let combined = contacts::combine(&lists, now);
            let draft = contacts::contacts_event_from(&combined, s.owner(), now);
            Ok(s.add_local_list(combined, draft, &format!("<combined: {}>", backup::date_string(now))))
        })
    }

    /// Store a copy of list `id` with its membership replaced.
    pub fn edit_membership(&self, id: &str, relays: RelayMembership) -> Result<String> {
        self.current().write(|s| {
            let list = s
                .version(id)
                .ok_or_else(|| Error::UnknownList(id.to_string()))?
                .list
                .with_membership(relays);
            let draft = contacts::contacts_event_from(&list, s.owner(), list.created_at);
            Ok(s.add_local_list(list, draft, &format!("<edited: {id}>")))
        })
    }

    /// Store a copy of list `id` with canonical relay URLs.
    pub fn normalize_list(&self, id: &str) -> Result<String> {
        let relays = self.list(id)?.relays;
        self.edit_membership(id, contacts::normalize_membership(&relays))
    }

    fn list(&self, id: &str) -> Result<ContactList> {
        self.current()
            .read(|s| s.version(id).map(|v| v.list.clone()))
            .ok_or_else(|| Error::UnknownList(id.to_string()))
    }

    fn signer(&self) -> Result<&dyn Signer> {
        self.signer
            .as_deref()
            .ok_or_else(|| Error::Signing("no signer configured".into()))
    }

    async fn sign_and_publish(&self, draft: Event, targets_from: Option<&ContactList>) -> Result<Published> {
        let signed = broadcast::sign(self.signer()?, draft).await?;
        let shared = self.current();
        shared.merge(vec![signed.clone()], PUBLISHED_SOURCE);
        let targets = broadcast::targets(&shared.pool, self.config.publish_mode, targets_from);
        info!(id = %signed.id, kind = signed.kind, relays = targets.len(), "publishing");
        let report =
            BroadcastReport::collect(broadcast::broadcast(&shared.pool, &signed, targets)).await;
        Ok(Published {
            event: signed,
            report,
        })
    }

    /// Timestamp for a new owner record of `kind`. It must outrank the record
    /// it replaces, even when that one was published within the same second.
    fn next_created_at(&self, kind: u32) -> u64 {
        let current = self.current().read(|s| {
            if kind == kinds::PROFILE_BADGES {
                s.accepted_set().map(|r| r.source.created_at)
            } else {
                ContactListKind::from_kind(kind)
                    .and_then(|k| s.owner_list(k))
                    .map(|r| r.source.created_at)
            }
        });
        let now = unix_now();
        current.map_or(now, |at| now.max(at + 1))
    }

    /// Sign list `id` as a fresh kind 3 record and publish it.
    pub async fn publish_contacts(&self, id: &str) -> Result<Published> {
        let list = self.list(id)?;
        let at = self.next_created_at(kinds::CONTACTS);
        let draft = contacts::contacts_event_from(&list, &self.config.owner, at);
        self.sign_and_publish(draft, Some(&list)).await
    }

    /// Derive a kind 10002 record from list `id` and publish it.
    pub async fn publish_relay_list(&self, id: &str) -> Result<Published> {
        let list = self.list(id)?;
        let at = self.next_created_at(kinds::RELAY_LIST);
        let draft = contacts::relay_list_event_from(&list, &self.config.owner, at);
        self.sign_and_publish(draft, Some(&list)).await
    }

    /// Publish list `id` with the owner followed or unfollowed.
    pub async fn follow_self(&self, id: &str, follow: bool) -> Result<Published> {
        let list = self.list(id)?;
        let edited = list.with_self_follow(&self.config.owner, follow);
        let at = self.next_created_at(kinds::CONTACTS);
        let draft = contacts::contacts_event_from(&edited, &self.config.owner, at);
        self.sign_and_publish(draft, Some(&list)).await
    }

    /// Resend a fetched list unchanged. Only the newest signed version of its
    /// kind qualifies.
    pub async fn rebroadcast(&self, id: &str) -> Result<BroadcastReport> {
        let shared = self.current();
        let version = shared.read(|s| {
            if s.can_rebroadcast(id) {
                s.version(id).cloned().ok_or_else(|| Error::UnknownList(id.to_string()))
            } else if s.version(id).is_none() {
                Err(Error::UnknownList(id.to_string()))
            } else {
                Err(Error::NotLatest(id.to_string()))
            }
        })?;
        let targets = broadcast::targets(&shared.pool, self.config.publish_mode, Some(&version.list));
        info!(id = %version.id, relays = targets.len(), "rebroadcasting");
        Ok(BroadcastReport::collect(broadcast::broadcast(&shared.pool, &version.event, targets)).await)
    }

    fn owner_contacts(&self) -> Option<ContactList> {
        self.current().read(|s| {
            s.owner_list(ContactListKind::Contacts)
                .map(|m| m.data.clone())
        })
    }

    /// Add the given awards to the accepted badge set and publish it. `None`
    /// when every award was already accepted.
    pub async fn accept_badges(&self, award_ids: &[String]) -> Result<Option<Published>> {
        let (tags, badges) = self.current().read(|s| {
            let tags = s
                .accepted_set()
                .map(|a| a.source.tags.clone())
                .unwrap_or_else(badges::empty_set_tags);
            let badges: Vec<AcceptedBadge> = s
                .award_views()
                .into_iter()
                .filter(|v| award_ids.contains(&v.award_id))
                .map(|v| AcceptedBadge {
                    definition: v.definition,
                    award_id: v.award_id,
                    relay_hint: None,
                })
                .collect();
            (tags, badges)
        });
        let Some(tags) = badges::accept_tags(&tags, &badges) else {
            return Ok(None);
        };
        let draft = badges::accepted_set_event(&self.config.owner, self.next_created_at(kinds::PROFILE_BADGES), tags);
        let list = self.owner_contacts();
        self.sign_and_publish(draft, list.as_ref()).await.map(Some)
    }

    /// Remove badges from the accepted set and publish it. `None` when none of
    /// them was accepted.
    pub async fn revoke_badges(&self, keys: &[DefinitionKey]) -> Result<Option<Published>> {
        let tags = self.current().read(|s| {
            s.accepted_set()
                .map(|a| a.source.tags.clone())
                .unwrap_or_else(badges::empty_set_tags)
        });
        let Some(tags) = badges::revoke_tags(&tags, keys) else {
            return Ok(None);
        };
        let draft = badges::accepted_set_event(&self.config.owner, self.next_created_at(kinds::PROFILE_BADGES), tags);
        let list = self.owner_contacts();
        self.sign_and_publish(draft, list.as_ref()).await.map(Some)
    }

    /// Bootstrap an account without a contact list: publish a self-follow
    /// contact list and a matching relay list naming a few well-known free
    /// relays, to those relays and to wherever the profile was found. `None`
    /// when the owner already has a contact list.
    pub async fn recover(&self) -> Result<Option<BroadcastReport>> {
        let shared = self.current();
        let (has_contacts, profile) = shared.read(|s| {
            (
                s.owner_list(ContactListKind::Contacts).is_some(),
                s.owner_profile()
                    .map(|p| (p.source.clone(), p.provenance.clone())),
            )
        });
        if has_contacts {
            return Ok(None);
        }

        let chosen: Vec<String> = GLOBAL_FAMOUS_FREE
            .choose_multiple(&mut rand::thread_rng(), RECOVERY_RELAYS)
            .map(|s| s.to_string())
            .collect();
        let relays: RelayMembership = chosen
            .iter()
            .map(|url| (url.clone(), RelayFlags::BOTH))
            .collect();
        let now = unix_now();
        let owner = &self.config.owner;
        let list = ContactList::new(ContactListKind::Contacts, now, vec![owner.clone()], relays);

        let signer = self.signer()?;
        let kind3 = broadcast::sign(signer, contacts::contacts_event_from(&list, owner, now)).await?;
        let kind10002 =
            broadcast::sign(signer, contacts::relay_list_event_from(&list, owner, now)).await?;

        let mut targets: Vec<String> = Vec::new();
        let profile_relays = profile.iter().flat_map(|(_, from)| from.iter());
        for url in profile_relays.chain(chosen.iter()) {
            let url = relay_url::normalize(url);
            if relay_url::is_valid_normalized(&url) && !targets.contains(&url) {
                targets.push(url);
            }
        }
        for url in &targets {
            if !shared.pool.contains(url) {
                shared.pool.open(url, true).await;
            }
        }

        let mut events: Vec<Event> = profile.into_iter().map(|(ev, _)| ev).collect();
        events.push(kind3.clone());
        events.push(kind10002.clone());
        let mut report = BroadcastReport::default();
        for ev in &events {
            report.merge(BroadcastReport::collect(broadcast::broadcast(&shared.pool, ev, targets.clone())).await);
        }
        shared.merge(vec![kind3, kind10002], PUBLISHED_SOURCE);
        info!(relays = targets.len(), "recovery lists published");
        Ok(Some(report))
    }
}

async fn initial_step(shared: Arc<Shared>, url: String, auto_connect: bool) -> Step {
    if shared.pool.open(&url, false).await != Opened::Fresh {
        return Step::Skipped { url };
    }
    if let Err(e) = initial_batch(&shared, &url).await {
        warn!(relay = %url, error = %e, "initial batch failed");
        return Step::Skipped { url };
    }
    shared.pool.mark_ok(&url);
    let discovered = if auto_connect {
        shared
            .read(|s| s.discovered_relays())
            .into_iter()
            .filter(|u| relay_url::is_valid_normalized(u))
            .collect()
    } else {
        Vec::new()
    };
    Step::Initial { url, discovered }
}

/// Owner profile, lists, awards and accepted badges from one relay.
async fn initial_batch(shared: &Shared, url: &str) -> Result<()> {
    let owner = shared.owner.as_str();
    let profile = shared
        .pool
        .get(url, &Filter::new().authors([owner]).kinds([kinds::PROFILE]))
        .await?;
    shared.merge(profile.into_iter().collect(), url);

    let lists = shared
        .pool
        .query(
            url,
            &[
                Filter::new().authors([owner]).kinds([kinds::CONTACTS]).limit(20),
                Filter::new().authors([owner]).kinds([kinds::RELAY_LIST]).limit(20),
            ],
        )
        .await?;
    let found_lists = lists.len();
    shared.merge(lists, url);

    let badges = shared
        .pool
        .query(
            url,
            &[
                Filter::new().kinds([kinds::BADGE_AWARD]).tag("p", [owner]).limit(1000),
                Filter::new()
                    .authors([owner])
                    .kinds([kinds::PROFILE_BADGES])
                    .tag("d", [kinds::PROFILE_BADGES_D])
                    .limit(1),
            ],
        )
        .await?;
    let found_badges = badges.len();
    shared.merge(badges, url);
    info!(relay = %url, lists = found_lists, badges = found_badges, "ok");
    Ok(())
}
