//! The NIP-01 conversation with a single relay.
//!
//! [`RelayTransport`] is the seam the pool talks through; [`WsTransport`] is
//! the WebSocket implementation. One reader task demultiplexes incoming frames
//! to whichever subscription or publish is waiting for them, so queries and
//! publishes on the same connection can overlap.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::{req_message, subscription_id, Filter},
};

/// How a relay answered a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// `OK true`.
    Accepted,
    /// The relay already had the event (`duplicate:` prefix).
    Seen,
    /// `OK false` with the relay's reason.
    Rejected(String),
    /// No acknowledgment arrived within the wait.
    Unacknowledged,
}

impl PublishOutcome {
    /// Interpret an `["OK", id, accepted, message]` frame.
    pub fn from_ok(accepted: bool, message: &str) -> Self {
        if message.starts_with("duplicate:") {
            PublishOutcome::Seen
        } else if accepted {
            PublishOutcome::Accepted
        } else {
            PublishOutcome::Rejected(message.to_string())
        }
    }
}

/// An established connection to one relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Normalized relay URL.
    fn url(&self) -> &str;

    /// Subscribe with every filter at once and collect stored events until
    /// end-of-stored-events.
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>>;

    /// Subscribe, take the first event and unsubscribe.
    async fn get(&self, filter: &Filter) -> Result<Option<Event>> {
        let mut filter = filter.clone();
        filter.limit = Some(1);
        Ok(self.query(&[filter]).await?.into_iter().next())
    }

    /// Send an event and wait for the relay's acknowledgment.
    async fn publish(&self, event: &Event) -> Result<PublishOutcome>;

    /// Flips to `true` once the connection is gone.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close the connection. Pending requests end with an error.
    fn close(&self);
}

/// Opens transports. Failures are reported, never retried here.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayTransport>>;
}

/// Connects over WebSocket, optionally through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub tor_socks: Option<String>,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            tor_socks: None,
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayTransport>> {
        let ws = timeout(
            self.connect_timeout,
            connect_ws(url, self.tor_socks.as_deref()),
        )
        .await
        .map_err(|_| Error::Transport(format!("{url}: connect timed out")))??;
        let transport = WsTransport::spawn(url, ws, self.query_timeout, self.ack_timeout);
        Ok(Arc::new(transport))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidRelayUrl(format!("{relay}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidRelayUrl(format!("{relay}: missing port")))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Transport(format!("{relay}: socks: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Transport(format!("{relay}: {e}")))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

enum Incoming {
    Event(Event),
    Eose,
    Closed(String),
}

#[derive(Default)]
struct Pending {
    subs: HashMap<String, mpsc::UnboundedSender<Incoming>>,
    acks: HashMap<String, oneshot::Sender<PublishOutcome>>,
}

/// WebSocket-backed [`RelayTransport`].
pub struct WsTransport {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<Pending>>,
    closed: Arc<watch::Sender<bool>>,
    seq: AtomicU64,
    query_timeout: Duration,
    ack_timeout: Duration,
    reader: JoinHandle<()>,
}

impl WsTransport {
    fn spawn(url: &str, ws: WsStream, query_timeout: Duration, ack_timeout: Duration) -> Self {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(txt)) => dispatch(&url, &pending, &txt),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(relay = %url, error = %e, "read failed");
                            break;
                        }
                    }
                }
                debug!(relay = %url, "disconnected");
                mark_closed(&pending, &closed);
            })
        };

        Self {
            url: url.to_string(),
            outbound,
            pending,
            closed,
            seq: AtomicU64::new(0),
            query_timeout,
            ack_timeout,
            reader,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::NotConnected(self.url.clone()));
        }
        Ok(())
    }

    fn send(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(Message::Text(frame.to_string()))
            .map_err(|_| Error::Transport(format!("{}: connection closed", self.url)))
    }

    fn subscribe(&self, filters: &[Filter]) -> Result<(String, mpsc::UnboundedReceiver<Incoming>)> {
        self.ensure_open()?;
        let sub = subscription_id(&self.url, self.seq.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).subs.insert(sub.clone(), tx);
        if let Err(e) = self.send(req_message(&sub, filters)) {
            lock(&self.pending).subs.remove(&sub);
            return Err(e);
        }
        Ok((sub, rx))
    }

    fn unsubscribe(&self, sub: &str) {
        lock(&self.pending).subs.remove(sub);
        let _ = self.send(serde_json::json!(["CLOSE", sub]));
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let (sub, mut rx) = self.subscribe(filters)?;
        let mut events = Vec::new();
        let finished = timeout(self.query_timeout, async {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Incoming::Event(ev) => {
                        if filters.iter().any(|f| f.matches(&ev)) {
                            events.push(ev);
                        } else {
                            debug!(relay = %self.url, id = %ev.id, "dropping event outside filter");
                        }
                    }
                    Incoming::Eose => return Ok(()),
                    Incoming::Closed(reason) => {
                        return Err(Error::Protocol(format!("subscription closed: {reason}")))
                    }
                }
            }
            Err(Error::Transport(format!("{}: connection closed", self.url)))
        })
        .await;
        self.unsubscribe(&sub);
        match finished {
            Ok(Ok(())) => Ok(events),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(relay = %self.url, collected = events.len(), "query timed out before EOSE");
                Ok(events)
            }
        }
    }

    async fn get(&self, filter: &Filter) -> Result<Option<Event>> {
        let mut filter = filter.clone();
        filter.limit = Some(1);
        let filters = [filter];
        let (sub, mut rx) = self.subscribe(&filters)?;
        let found = timeout(self.query_timeout, async {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Incoming::Event(ev) if filters[0].matches(&ev) => return Ok(Some(ev)),
                    Incoming::Event(_) => {}
                    Incoming::Eose => return Ok(None),
                    Incoming::Closed(reason) => {
                        return Err(Error::Protocol(format!("subscription closed: {reason}")))
                    }
                }
            }
            Err(Error::Transport(format!("{}: connection closed", self.url)))
        })
        .await;
        self.unsubscribe(&sub);
        found.unwrap_or(Ok(None))
    }

    async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).acks.insert(event.id.clone(), tx);
        if let Err(e) = self.send(serde_json::json!(["EVENT", event])) {
            lock(&self.pending).acks.remove(&event.id);
            return Err(e);
        }
        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "{}: connection closed before acknowledgment",
                self.url
            ))),
            Err(_) => {
                lock(&self.pending).acks.remove(&event.id);
                Ok(PublishOutcome::Unacknowledged)
            }
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        mark_closed(&self.pending, &self.closed);
        self.reader.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop every waiter so in-flight requests end, then announce the loss.
fn mark_closed(pending: &Mutex<Pending>, closed: &watch::Sender<bool>) {
    {
        let mut p = lock(pending);
        p.subs.clear();
        p.acks.clear();
    }
    closed.send_replace(true);
}

/// Route one relay frame to whoever is waiting for it.
fn dispatch(url: &str, pending: &Mutex<Pending>, txt: &str) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        debug!(relay = %url, "ignoring non-JSON frame");
        return;
    };
    let Some(arr) = val.as_array() else {
        return;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            let Some(sub) = arr[1].as_str() else { return };
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(ev) => {
                    if let Some(tx) = lock(pending).subs.get(sub) {
                        let _ = tx.send(Incoming::Event(ev));
                    }
                }
                Err(e) => debug!(relay = %url, error = %e, "malformed event"),
            }
        }
        Some("EOSE") => {
            if let Some(sub) = arr.get(1).and_then(|v| v.as_str()) {
                if let Some(tx) = lock(pending).subs.get(sub) {
                    let _ = tx.send(Incoming::Eose);
                }
            }
        }
        Some("CLOSED") => {
            if let Some(sub) = arr.get(1).and_then(|v| v.as_str()) {
                let reason = arr.get(2).and_then(|v| v.as_str()).unwrap_or_default();
                if let Some(tx) = lock(pending).subs.get(sub) {
                    let _ = tx.send(Incoming::Closed(reason.to_string()));
                }
            }
        }
        Some("OK") if arr.len() >= 3 => {
            let Some(id) = arr[1].as_str() else { return };
            let accepted = arr[2].as_bool().unwrap_or(false);
            let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
            if let Some(tx) = lock(pending).acks.remove(id) {
                let _ = tx.send(PublishOutcome::from_ok(accepted, message));
            }
        }
        Some("NOTICE") => {
            let msg = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            warn!(relay = %url, notice = msg, "relay notice");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn sample_event(id: &str, kind: u32, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind,
            created_at,
            tags: vec![Tag::new(["p", "me"])],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn connector() -> WsConnector {
        WsConnector {
            ack_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_secs(2),
            ..WsConnector::default()
        }
    }

    #[test]
    fn ok_frames_map_to_outcomes() {
        assert_eq!(PublishOutcome::from_ok(true, ""), PublishOutcome::Accepted);
        assert_eq!(
            PublishOutcome::from_ok(true, "duplicate: already have this event"),
            PublishOutcome::Seen
        );
        assert_eq!(
            PublishOutcome::from_ok(false, "duplicate: seen"),
            PublishOutcome::Seen
        );
        assert_eq!(
            PublishOutcome::from_ok(false, "blocked: pubkey not admitted"),
            PublishOutcome::Rejected("blocked: pubkey not admitted".into())
        );
    }

    #[tokio::test]
    async fn query_collects_until_eose_and_closes_subscription() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req: Value = match ws.next().await {
                Some(Ok(TMsg::Text(txt))) => serde_json::from_str(&txt).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            };
            assert_eq!(req[0], "REQ");
            let sub = req[1].as_str().unwrap().to_string();
            assert_eq!(req[2]["kinds"], serde_json::json!([3]));
            for ev in [sample_event("aa11", 3, 1), sample_event("bb22", 1, 2), sample_event("cc33", 3, 3)] {
                ws.send(TMsg::Text(serde_json::json!(["EVENT", sub, ev]).to_string()))
                    .await
                    .unwrap();
            }
            ws.send(TMsg::Text(serde_json::json!(["EOSE", sub]).to_string()))
                .await
                .unwrap();
            match ws.next().await {
                Some(Ok(TMsg::Text(txt))) => {
                    let close: Value = serde_json::from_str(&txt).unwrap();
                    assert_eq!(close, serde_json::json!(["CLOSE", sub]));
                }
                other => panic!("expected CLOSE, got {other:?}"),
            }
        });

        let transport = connector()
            .connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let events = transport
            .query(&[Filter::new().kinds([3])])
            .await
            .unwrap();
        // the kind 1 event does not match the filter and is dropped
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["aa11", "cc33"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn publish_maps_ok_and_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut count = 0;
            while let Some(Ok(msg)) = ws.next().await {
                let TMsg::Text(txt) = msg else { continue };
                let frame: Value = serde_json::from_str(&txt).unwrap();
                let id = frame[1]["id"].as_str().unwrap().to_string();
                count += 1;
                let reply = match count {
                    1 => serde_json::json!(["OK", id, true, ""]),
                    2 => serde_json::json!(["OK", id, false, "blocked: pubkey not admitted"]),
                    _ => continue,
                };
                ws.send(TMsg::Text(reply.to_string())).await.unwrap();
            }
        });

        let transport = connector()
            .connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        assert_eq!(
            transport.publish(&sample_event("e1", 3, 1)).await.unwrap(),
            PublishOutcome::Accepted
        );
        assert_eq!(
            transport.publish(&sample_event("e2", 3, 1)).await.unwrap(),
            PublishOutcome::Rejected("blocked: pubkey not admitted".into())
        );
        assert_eq!(
            transport.publish(&sample_event("e3", 3, 1)).await.unwrap(),
            PublishOutcome::Unacknowledged
        );
        transport.close();
        server.abort();
    }

    #[tokio::test]
    async fn closed_watch_fires_when_relay_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let transport = connector()
            .connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let mut closed = transport.closed();
        tokio::time::timeout(Duration::from_secs(2), closed.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            transport.query(&[Filter::new()]).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connector().connect(&format!("ws://{addr}")).await.is_err());
    }
}
