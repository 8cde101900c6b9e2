//! One connection per relay, each with its own small state machine.
//!
//! ```text
//! connecting ──> connected ──> ok
//!      │             │          │
//!      v             v          v
//!    failed      disconnected <─┘
//!      │             │
//!      └──(retry)────┴──> connecting ──> connected
//! ```
//!
//! `ok` is only reached once the initial query batch for a connection has
//! completed, which the session reports through [`Pool::mark_ok`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    relay_url,
    transport::{Connector, PublishOutcome, RelayTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Ok,
    Failed,
    Disconnected,
}

impl ConnectionState {
    /// Whether queries may be issued.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ok)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ok => "ok",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Read-only view of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub url: String,
    pub state: ConnectionState,
    pub selected: bool,
}

/// What [`Pool::open`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    /// A new connection is up; the caller owes it an initial batch.
    Fresh,
    /// Opened with `retry` set: a reconnect or a manually added relay. No
    /// initial batch is owed.
    Reconnected,
    /// Nothing to do: the entry exists and no retry was requested, or it is
    /// already live.
    AlreadyOpen,
    /// The transport could not be established; the entry is `failed`.
    Failed,
}

struct Slot {
    state: ConnectionState,
    selected: bool,
    transport: Option<Arc<dyn RelayTransport>>,
    /// Identifies the transport a disconnect observer belongs to, so a stale
    /// observer cannot clear a newer connection.
    link: u64,
}

type Slots = Mutex<BTreeMap<String, Slot>>;

/// Owns every relay connection of a session.
pub struct Pool {
    connector: Arc<dyn Connector>,
    slots: Arc<Slots>,
    links: AtomicU64,
    shut: AtomicBool,
}

impl Pool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Arc::new(Mutex::new(BTreeMap::new())),
            links: AtomicU64::new(0),
            shut: AtomicBool::new(false),
        }
    }

    /// Open a connection to `url`. A present entry is left alone unless
    /// `retry` is set and it is `disconnected` or `failed`. Connect failures
    /// are recorded in the entry's state, not returned.
    pub async fn open(&self, url: &str, retry: bool) -> Opened {
        let url = relay_url::normalize(url);
        if self.shut.load(Ordering::SeqCst) {
            return Opened::Failed;
        }
        {
            let mut slots = lock(&self.slots);
            match slots.get_mut(&url) {
                Some(_) if !retry => return Opened::AlreadyOpen,
                Some(slot) => match slot.state {
                    ConnectionState::Disconnected | ConnectionState::Failed => {
                        slot.state = ConnectionState::Connecting;
                    }
                    _ => return Opened::AlreadyOpen,
                },
                None => {
                    slots.insert(
                        url.clone(),
                        Slot {
                            state: ConnectionState::Connecting,
                            selected: false,
                            transport: None,
                            link: 0,
                        },
                    );
                }
            }
        }

        debug!(relay = %url, retry, "connecting");
        let transport = match self.connector.connect(&url).await {
            Ok(t) => t,
            Err(e) => {
                warn!(relay = %url, error = %e, "failed to connect");
                if let Some(slot) = lock(&self.slots).get_mut(&url) {
                    slot.state = ConnectionState::Failed;
                }
                return Opened::Failed;
            }
        };

        let link = self.links.fetch_add(1, Ordering::SeqCst) + 1;
        let installed = {
            let mut slots = lock(&self.slots);
            let live = !self.shut.load(Ordering::SeqCst);
            match slots.get_mut(&url) {
                Some(slot) if live && slot.state == ConnectionState::Connecting => {
                    slot.state = ConnectionState::Connected;
                    slot.transport = Some(transport.clone());
                    slot.link = link;
                    true
                }
                _ => false,
            }
        };
        if !installed {
            transport.close();
            return Opened::Failed;
        }
        self.watch_disconnect(&url, transport, link);
        info!(relay = %url, "connected");
        if retry {
            Opened::Reconnected
        } else {
            Opened::Fresh
        }
    }

    fn watch_disconnect(&self, url: &str, transport: Arc<dyn RelayTransport>, link: u64) {
        let mut closed = transport.closed();
        drop(transport);
        let slots: Weak<Slots> = Arc::downgrade(&self.slots);
        let url = url.to_string();
        tokio::spawn(async move {
            let _ = closed.wait_for(|c| *c).await;
            let Some(slots) = slots.upgrade() else { return };
            let mut slots = lock(&slots);
            if let Some(slot) = slots.get_mut(&url) {
                if slot.link == link && slot.transport.is_some() {
                    slot.transport = None;
                    if slot.state != ConnectionState::Failed {
                        slot.state = ConnectionState::Disconnected;
                    }
                    info!(relay = %url, "disconnected");
                }
            }
        });
    }

    fn usable_transport(&self, url: &str) -> Result<Arc<dyn RelayTransport>> {
        let slots = lock(&self.slots);
        match slots.get(url) {
            Some(slot) if slot.state.is_usable() => slot
                .transport
                .clone()
                .ok_or_else(|| Error::NotConnected(url.to_string())),
            _ => Err(Error::NotConnected(url.to_string())),
        }
    }

    /// Query one relay. Only valid while it is `connected` or `ok`.
    pub async fn query(&self, url: &str, filters: &[Filter]) -> Result<Vec<Event>> {
        let url = relay_url::normalize(url);
        let transport = self.usable_transport(&url)?;
        transport.query(filters).await
    }

    pub async fn get(&self, url: &str, filter: &Filter) -> Result<Option<Event>> {
        let url = relay_url::normalize(url);
        let transport = self.usable_transport(&url)?;
        transport.get(filter).await
    }

    /// Publish to one relay, reconnecting first if it dropped. `None` when
    /// there is still no transport to publish on.
    pub async fn publish(&self, url: &str, event: &Event) -> Option<PublishOutcome> {
        let url = relay_url::normalize(url);
        if self.state(&url) == Some(ConnectionState::Disconnected) {
            self.open(&url, true).await;
        }
        let transport = {
            let slots = lock(&self.slots);
            slots.get(&url)?.transport.clone()?
        };
        match transport.publish(event).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                debug!(relay = %url, error = %e, "publish failed");
                None
            }
        }
    }

    /// Record that the initial batch for `url` finished.
    pub fn mark_ok(&self, url: &str) {
        let url = relay_url::normalize(url);
        if let Some(slot) = lock(&self.slots).get_mut(&url) {
            if slot.state == ConnectionState::Connected {
                slot.state = ConnectionState::Ok;
            }
        }
    }

    pub fn set_selected(&self, url: &str, selected: bool) -> bool {
        let url = relay_url::normalize(url);
        match lock(&self.slots).get_mut(&url) {
            Some(slot) => {
                slot.selected = selected;
                true
            }
            None => false,
        }
    }

    pub fn state(&self, url: &str) -> Option<ConnectionState> {
        let url = relay_url::normalize(url);
        lock(&self.slots).get(&url).map(|s| s.state)
    }

    pub fn contains(&self, url: &str) -> bool {
        lock(&self.slots).contains_key(&relay_url::normalize(url))
    }

    /// Every connection, ordered by URL.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        lock(&self.slots)
            .iter()
            .map(|(url, slot)| ConnectionInfo {
                url: url.clone(),
                state: slot.state,
                selected: slot.selected,
            })
            .collect()
    }

    /// Close every transport. Later opens fail; in-flight queries end with
    /// an error from their transport.
    pub fn close_all(&self) {
        self.shut.store(true, Ordering::SeqCst);
        let transports: Vec<_> = {
            let mut slots = lock(&self.slots);
            slots
                .values_mut()
                .filter_map(|slot| {
                    if slot.state != ConnectionState::Failed {
                        slot.state = ConnectionState::Disconnected;
                    }
                    slot.transport.take()
                })
                .collect()
        };
        for transport in transports {
            transport.close();
        }
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, BTreeMap<String, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryNetwork, Reply};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn open_success_then_ok() {
        let net = MemoryNetwork::new();
        net.relay("wss://a.example");
        let pool = Pool::new(net.clone());
        assert_eq!(pool.open("wss://a.example/", false).await, Opened::Fresh);
        assert_eq!(pool.state("wss://a.example"), Some(ConnectionState::Connected));
        pool.mark_ok("wss://a.example");
        assert_eq!(pool.state("wss://a.example"), Some(ConnectionState::Ok));
        assert_eq!(pool.open("wss://a.example", false).await, Opened::AlreadyOpen);
        assert_eq!(pool.open("wss://a.example", true).await, Opened::AlreadyOpen);
        assert_eq!(net.connect_count("wss://a.example"), 1);
    }

    #[tokio::test]
    async fn failure_is_a_state_not_an_error() {
        let net = MemoryNetwork::new();
        let pool = Pool::new(net.clone());
        assert_eq!(pool.open("wss://down.example", false).await, Opened::Failed);
        assert_eq!(pool.state("wss://down.example"), Some(ConnectionState::Failed));
        assert!(matches!(
            pool.query("wss://down.example", &[Filter::new()]).await,
            Err(Error::NotConnected(_))
        ));
        // no retry: the entry is left as is
        assert_eq!(pool.open("wss://down.example", false).await, Opened::AlreadyOpen);
        net.relay("wss://down.example");
        assert_eq!(pool.open("wss://down.example", true).await, Opened::Reconnected);
        assert_eq!(pool.state("wss://down.example"), Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn disconnect_drops_transport_and_publish_reconnects() {
        let net = MemoryNetwork::new();
        let relay = net.relay("wss://a.example");
        let pool = Pool::new(net.clone());
        pool.open("wss://a.example", false).await;
        pool.mark_ok("wss://a.example");

        net.disconnect("wss://a.example");
        settle().await;
        assert_eq!(
            pool.state("wss://a.example"),
            Some(ConnectionState::Disconnected)
        );
        assert!(pool.query("wss://a.example", &[Filter::new()]).await.is_err());

        let ev = Event::draft("p", 1, 1, vec![], "");
        assert_eq!(
            pool.publish("wss://a.example", &ev).await,
            Some(PublishOutcome::Accepted)
        );
        assert_eq!(net.connect_count("wss://a.example"), 2);
        assert_eq!(pool.state("wss://a.example"), Some(ConnectionState::Connected));
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test]
    async fn publish_without_transport_is_a_no_op() {
        let net = MemoryNetwork::new();
        net.relay("wss://a.example").set_reply(Reply::Accept);
        let pool = Pool::new(net.clone());
        pool.open("wss://a.example", false).await;
        net.take_down("wss://a.example");
        net.disconnect("wss://a.example");
        settle().await;

        let ev = Event::draft("p", 1, 1, vec![], "");
        assert_eq!(pool.publish("wss://a.example", &ev).await, None);
        assert_eq!(pool.state("wss://a.example"), Some(ConnectionState::Failed));
        assert_eq!(pool.publish("wss://unknown.example", &ev).await, None);
    }

    #[tokio::test]
    async fn stale_observer_leaves_new_connection_alone() {
        let net = MemoryNetwork::new();
        net.relay("wss://a.example");
        let pool = Pool::new(net.clone());
        pool.open("wss://a.example", false).await;
        net.disconnect("wss://a.example");
        settle().await;
        pool.open("wss://a.example", true).await;
        settle().await;
        assert_eq!(pool.state("wss://a.example"), Some(ConnectionState::Connected));
        assert!(pool.query("wss://a.example", &[Filter::new()]).await.is_ok());
    }

    #[tokio::test]
    async fn close_all_shuts_everything() {
        let net = MemoryNetwork::new();
        net.relay("wss://a.example");
        net.relay("wss://b.example");
        let pool = Pool::new(net.clone());
        pool.open("wss://a.example", false).await;
        pool.open("wss://b.example", false).await;
        pool.open("wss://c.example", false).await;
        assert!(pool.set_selected("wss://b.example", true));
        assert!(!pool.set_selected("wss://z.example", true));

        pool.close_all();
        let snap = pool.snapshot();
        assert_eq!(
            snap.iter().map(|c| c.state).collect::<Vec<_>>(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Disconnected,
                ConnectionState::Failed
            ]
        );
        assert!(snap[1].selected);
        assert_eq!(pool.open("wss://d.example", false).await, Opened::Failed);
        assert!(!pool.contains("wss://d.example"));
    }
}
