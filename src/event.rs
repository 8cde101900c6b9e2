//! Nostr event model.

use serde::{Deserialize, Serialize};

/// Event kinds this crate reads or writes.
pub mod kinds {
    /// Profile metadata, one per author.
    pub const PROFILE: u32 = 0;
    /// Follow list with relay membership embedded as JSON content.
    pub const CONTACTS: u32 = 3;
    /// Badge award, append-only.
    pub const BADGE_AWARD: u32 = 8;
    /// Relay list with membership expressed as `r` tags.
    pub const RELAY_LIST: u32 = 10002;
    /// The set of badges an author chose to display.
    pub const PROFILE_BADGES: u32 = 30008;
    /// Badge definition, keyed by issuer and `d` tag.
    pub const BADGE_DEFINITION: u32 = 30009;

    /// Well-known `d` tag of the accepted badge set.
    pub const PROFILE_BADGES_D: &str = "profile_badges";

    /// Replaceable kinds keep a single record per author and kind.
    pub fn is_replaceable(kind: u32) -> bool {
        kind == PROFILE || kind == CONTACTS || (10000..20000).contains(&kind)
    }

    /// Parameterized replaceable kinds keep a single record per author, kind
    /// and `d` tag.
    pub fn is_parameterized(kind: u32) -> bool {
        (30000..40000).contains(&kind)
    }
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The ones this crate cares about:
///
/// - `p` – a followed or awarded author's public key
/// - `r` – a relay URL, optionally followed by a `read`/`write` marker
/// - `a` – a reference to a parameterized event, `30009:<pubkey>:<d>`
/// - `e` – a reference to another event ID, optionally with a relay hint
/// - `d` – unique identifier for parameterized replaceable events
///
/// Each tag is stored verbatim so uncommon or custom tags survive a republish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// The tag name, e.g. `p`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The first value after the name.
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    /// Element at `index`, counting the name as zero.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == Some(name)
    }
}

/// Core Nostr event exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 3,
///   "created_at": 1700000000,
///   "tags": [["p", "82341f..."]],
///   "content": "{\"wss://nos.lol\":{\"read\":true,\"write\":true}}",
///   "sig": "deadbeef"
/// }
/// ```
///
/// Locally synthesized events (loaded backups, combined lists, drafts awaiting
/// a signature) carry an empty `sig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    #[serde(default)]
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `3` or `30009`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over the event hash.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Draft an unsigned event. `id` and `sig` are filled in by signing.
    pub fn draft(
        pubkey: impl Into<String>,
        kind: u32,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        Event {
            id: String::new(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    /// Whether the event carries a signature at all. Says nothing about
    /// whether that signature is valid.
    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty()
    }

    /// Value of the first tag named `name`.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.is(name)).and_then(Tag::value)
    }

    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.is(name))
            .filter_map(Tag::value)
    }

    /// The `d` tag, if any.
    pub fn d_tag(&self) -> Option<&str> {
        self.first_tag_value("d")
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_unsigned_event_without_id_or_sig() {
        let ev: Event = serde_json::from_value(serde_json::json!({
            "pubkey": "p",
            "kind": 3,
            "created_at": 5,
            "tags": [["p", "a"], ["p", "b", "wss://r"]],
        }))
        .unwrap();
        assert!(!ev.is_signed());
        assert!(ev.id.is_empty());
        assert_eq!(ev.tag_values("p").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(ev.tags[1].get(2), Some("wss://r"));
    }

    #[test]
    fn kind_classes() {
        assert!(kinds::is_replaceable(kinds::PROFILE));
        assert!(kinds::is_replaceable(kinds::CONTACTS));
        assert!(kinds::is_replaceable(kinds::RELAY_LIST));
        assert!(!kinds::is_replaceable(kinds::BADGE_AWARD));
        assert!(kinds::is_parameterized(kinds::BADGE_DEFINITION));
        assert!(kinds::is_parameterized(kinds::PROFILE_BADGES));
        assert!(!kinds::is_parameterized(kinds::BADGE_AWARD));
    }

    #[test]
    fn d_tag_uses_first_match() {
        let ev = Event::draft(
            "p",
            kinds::BADGE_DEFINITION,
            1,
            vec![Tag::new(["d", "first"]), Tag::new(["d", "second"])],
            "",
        );
        assert_eq!(ev.d_tag(), Some("first"));
    }
}
