//! Subscription filters and `REQ` framing.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Filter parameters used when building a Nostr subscription filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to specific authors.
    pub authors: Vec<String>,
    /// Restrict to event kinds.
    pub kinds: Vec<u32>,
    /// Tag filters keyed by single-letter tag name (e.g. `p`, `d`).
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Maximum number of events requested.
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors.extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.trim_start_matches('#').to_string();
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `ev` satisfies this filter. Relays are untrusted, so results
    /// are re-checked against the filters that requested them.
    pub fn matches(&self, ev: &crate::event::Event) -> bool {
        if !self.authors.is_empty() && !self.authors.iter().any(|a| a == &ev.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&ev.kind) {
            return false;
        }
        if self.since.map_or(false, |s| ev.created_at < s) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            values.is_empty() || ev.tag_values(name).any(|v| values.iter().any(|w| w == v))
        })
    }

    /// Convert the filter into the JSON object sent inside `REQ`. Empty lists
    /// are omitted rather than sent as "match nothing".
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.authors.is_empty() {
            map.insert(
                "authors".into(),
                Value::Array(self.authors.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(
                format!("#{tag}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }
}

/// Build a `REQ` frame carrying every filter in one subscription.
pub fn req_message(sub_id: &str, filters: &[Filter]) -> Value {
    let mut frame = vec![Value::String("REQ".into()), Value::String(sub_id.into())];
    frame.extend(filters.iter().map(|f| Value::Object(f.to_json())));
    Value::Array(frame)
}

/// Subscription id unique per relay connection: a short relay hash plus a
/// per-connection counter, kept well under common relay length limits.
pub fn subscription_id(relay_url: &str, seq: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(relay_url.as_bytes());
    let relay_hash = hex::encode(hasher.finalize());
    let mut id = format!("rg-{}-{seq}", &relay_hash[..8]);
    if id.len() > 48 {
        id.truncate(48);
    }
    id
}
