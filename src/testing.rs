//! In-memory relays for exercising the pool, resolver and session without
//! sockets.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    transport::{Connector, PublishOutcome, RelayTransport},
};

/// How a memory relay answers `EVENT`.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject(String),
    Silent,
}

/// One simulated relay: stored events plus a log of what was published.
pub struct MemoryRelay {
    events: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    reply: Mutex<Reply>,
    queries: AtomicUsize,
}

impl MemoryRelay {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            reply: Mutex::new(Reply::Accept),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn store(&self, ev: Event) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn answer(&self, filters: &[Filter]) -> Vec<Event> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for f in filters {
            let mut hits: Vec<&Event> = events.iter().filter(|e| f.matches(e)).collect();
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let limit = f.limit.map_or(usize::MAX, |l| l as usize);
            for ev in hits.into_iter().take(limit) {
                if seen.insert(ev.id.clone()) {
                    out.push(ev.clone());
                }
            }
        }
        out
    }
}

/// A set of memory relays reachable by URL. Unknown URLs refuse to connect.
#[derive(Default)]
pub struct MemoryNetwork {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
    links: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a reachable relay.
    pub fn relay(&self, url: &str) -> Arc<MemoryRelay> {
        self.relays
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryRelay::new()))
            .clone()
    }

    /// Make `url` unreachable for future connects.
    pub fn take_down(&self, url: &str) {
        self.relays.lock().unwrap().remove(url);
    }

    /// Drop the live connection to `url`, as if the relay hung up.
    pub fn disconnect(&self, url: &str) {
        if let Some(link) = self.links.lock().unwrap().remove(url) {
            link.send_replace(true);
        }
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.connects.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayTransport>> {
        *self.connects.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let relay = self
            .relays
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("{url}: connection refused")))?;
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        self.links
            .lock()
            .unwrap()
            .insert(url.to_string(), closed.clone());
        Ok(Arc::new(MemoryTransport {
            url: url.to_string(),
            relay,
            closed,
        }))
    }
}

struct MemoryTransport {
    url: String,
    relay: Arc<MemoryRelay>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::NotConnected(self.url.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        Ok(self.relay.answer(filters))
    }

    async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        self.ensure_open()?;
        let reply = self.relay.reply.lock().unwrap().clone();
        let duplicate = self
            .relay
            .published
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.id == event.id);
        Ok(match reply {
            Reply::Accept if duplicate => PublishOutcome::Seen,
            Reply::Accept => {
                self.relay.published.lock().unwrap().push(event.clone());
                self.relay.store(event.clone());
                PublishOutcome::Accepted
            }
            Reply::Reject(msg) => PublishOutcome::Rejected(msg),
            Reply::Silent => PublishOutcome::Unacknowledged,
        })
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
