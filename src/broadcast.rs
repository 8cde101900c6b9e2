//! Signing and fan-out publishing.

use std::{fmt, str::FromStr};

use futures_util::{stream::FuturesUnordered, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    contacts::ContactList,
    error::{Error, Result},
    event::Event,
    keys::{compute_id, Signer},
    pool::Pool,
    transport::PublishOutcome,
};

/// Rejection some relays send to everyone not on their allow list. Expected,
/// so not worth reporting.
const NOT_ADMITTED: &str = "blocked: pubkey not admitted";

/// Which pooled connections receive a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Relays in the relay membership of the list being published.
    #[default]
    Registered,
    /// Every pooled connection.
    All,
    /// Connections explicitly selected in the pool.
    Selected,
}

impl FromStr for PublishMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "registered" => Ok(PublishMode::Registered),
            "all" => Ok(PublishMode::All),
            "selected" => Ok(PublishMode::Selected),
            other => Err(Error::Protocol(format!("unknown publish mode: {other}"))),
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishMode::Registered => "registered",
            PublishMode::All => "all",
            PublishMode::Selected => "selected",
        })
    }
}

/// Pooled relays a publish goes to under `mode`. `registered` relies on the
/// membership of `list`; without one it targets nothing.
pub fn targets(pool: &Pool, mode: PublishMode, list: Option<&ContactList>) -> Vec<String> {
    let connections = pool.snapshot();
    connections
        .into_iter()
        .filter(|c| match mode {
            PublishMode::All => true,
            PublishMode::Selected => c.selected,
            PublishMode::Registered => {
                list.map_or(false, |l| l.relays_normalized.contains(&c.url))
            }
        })
        .map(|c| c.url)
        .collect()
}

/// Fill in the id and have `signer` sign `draft`. Nothing is sent on failure.
pub async fn sign(signer: &dyn Signer, mut draft: Event) -> Result<Event> {
    if draft.pubkey != signer.public_key() {
        return Err(Error::Signing(format!(
            "draft author {} is not the signer",
            draft.pubkey
        )));
    }
    draft.id = compute_id(&draft)?;
    let expected = draft.id.clone();
    let signed = signer.sign(draft).await?;
    if signed.id != expected || !signed.is_signed() {
        return Err(Error::Signing("signer returned a different event".into()));
    }
    Ok(signed)
}

/// Per-relay result of one publish. `outcome` is `None` when there was no
/// connection to publish on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub relay: String,
    pub outcome: Option<PublishOutcome>,
}

/// Publish `event` to every relay in `targets` concurrently, yielding each
/// relay's outcome as it arrives.
pub fn broadcast<'a>(
    pool: &'a Pool,
    event: &'a Event,
    targets: Vec<String>,
) -> impl Stream<Item = RelayOutcome> + 'a {
    debug!(id = %event.id, relays = targets.len(), "broadcasting");
    targets
        .into_iter()
        .map(|relay| async move {
            let outcome = pool.publish(&relay, event).await;
            RelayOutcome { relay, outcome }
        })
        .collect::<FuturesUnordered<_>>()
}

/// Aggregated outcomes of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub accepted: Vec<String>,
    pub seen: Vec<String>,
    /// Rejections worth showing: relay and reason.
    pub failed: Vec<(String, String)>,
    /// Unacknowledged or not-admitted results, kept out of `failed`.
    pub suppressed: Vec<String>,
    pub unreachable: Vec<String>,
}

impl BroadcastReport {
    pub fn record(&mut self, result: RelayOutcome) {
        let RelayOutcome { relay, outcome } = result;
        match outcome {
            Some(PublishOutcome::Accepted) => {
                info!(relay = %relay, "broadcasted");
                self.accepted.push(relay);
            }
            Some(PublishOutcome::Seen) => {
                debug!(relay = %relay, "already seen");
                self.seen.push(relay);
            }
            Some(PublishOutcome::Rejected(reason)) if reason == NOT_ADMITTED => {
                debug!(relay = %relay, "not admitted");
                self.suppressed.push(relay);
            }
            Some(PublishOutcome::Rejected(reason)) => {
                warn!(relay = %relay, reason = %reason, "failed to broadcast");
                self.failed.push((relay, reason));
            }
            Some(PublishOutcome::Unacknowledged) => self.suppressed.push(relay),
            None => self.unreachable.push(relay),
        }
    }

    /// Drain a broadcast stream into a report.
    pub async fn collect(stream: impl Stream<Item = RelayOutcome>) -> Self {
        let mut report = Self::default();
        futures_util::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            report.record(result);
        }
        report
    }

    /// Relays that now hold the event.
    pub fn delivered(&self) -> usize {
        self.accepted.len() + self.seen.len()
    }

    pub fn merge(&mut self, other: BroadcastReport) {
        self.accepted.extend(other.accepted);
        self.seen.extend(other.seen);
        self.failed.extend(other.failed);
        self.suppressed.extend(other.suppressed);
        self.unreachable.extend(other.unreachable);
    }
}
