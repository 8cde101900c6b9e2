//! Contact lists (kind 3) and relay lists (kind 10002).
//!
//! Both kinds carry a relay membership map; only kind 3 carries follows. Kind
//! 3 stores membership as a JSON object in `content`:
//!
//! ```json
//! {"wss://nos.lol": {"read": true, "write": true}}
//! ```
//!
//! while kind 10002 uses `r` tags with an optional `read`/`write` marker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    event::{kinds, Event, Tag},
    relay_url,
};

/// Read/write permission of one relay in a membership map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    pub read: bool,
    pub write: bool,
}

impl RelayFlags {
    pub const BOTH: RelayFlags = RelayFlags {
        read: true,
        write: true,
    };

    fn or(self, other: RelayFlags) -> RelayFlags {
        RelayFlags {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }
}

/// Relay URL (as written by the author) to permissions.
pub type RelayMembership = BTreeMap<String, RelayFlags>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContactListKind {
    Contacts,
    Relays,
}

impl ContactListKind {
    pub fn from_kind(kind: u32) -> Option<Self> {
        match kind {
            kinds::CONTACTS => Some(ContactListKind::Contacts),
            kinds::RELAY_LIST => Some(ContactListKind::Relays),
            _ => None,
        }
    }

    pub fn kind(self) -> u32 {
        match self {
            ContactListKind::Contacts => kinds::CONTACTS,
            ContactListKind::Relays => kinds::RELAY_LIST,
        }
    }
}

/// The logical content shared by kind 3 and kind 10002 records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactList {
    pub kind: ContactListKind,
    pub created_at: u64,
    /// Followed author keys, in tag order. Always empty for relay lists.
    pub contacts: Vec<String>,
    pub relays: RelayMembership,
    /// Canonical, de-duplicated forms of the keys of `relays`.
    pub relays_normalized: Vec<String>,
}

impl ContactList {
    pub fn new(
        kind: ContactListKind,
        created_at: u64,
        contacts: Vec<String>,
        relays: RelayMembership,
    ) -> Self {
        let relays_normalized = normalized_urls(&relays);
        Self {
            kind,
            created_at,
            contacts,
            relays,
            relays_normalized,
        }
    }

    /// Parse a kind 3 or kind 10002 record. Other kinds yield `None`.
    pub fn from_event(ev: &Event) -> Option<Self> {
        let kind = ContactListKind::from_kind(ev.kind)?;
        let (contacts, relays) = match kind {
            ContactListKind::Contacts => (
                ev.tag_values("p").map(str::to_string).collect(),
                membership_from_content(&ev.content),
            ),
            ContactListKind::Relays => (Vec::new(), membership_from_r_tags(&ev.tags)),
        };
        Some(Self::new(kind, ev.created_at, contacts, relays))
    }

    /// Replace the relay membership, keeping follows.
    pub fn with_membership(&self, relays: RelayMembership) -> Self {
        Self::new(self.kind, self.created_at, self.contacts.clone(), relays)
    }

    /// Follow or unfollow `owner` itself. The owner ends up last when followed.
    pub fn with_self_follow(&self, owner: &str, follow: bool) -> Self {
        let mut contacts: Vec<String> =
            self.contacts.iter().filter(|c| *c != owner).cloned().collect();
        if follow {
            contacts.push(owner.to_string());
        }
        Self::new(self.kind, self.created_at, contacts, self.relays.clone())
    }

    pub fn follows(&self, pubkey: &str) -> bool {
        self.contacts.iter().any(|c| c == pubkey)
    }
}

/// Parse the kind 3 content object. Malformed content is an empty map; a flag
/// missing from an entry defaults to `true`.
pub fn membership_from_content(content: &str) -> RelayMembership {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) else {
        return RelayMembership::new();
    };
    obj.into_iter()
        .map(|(url, flags)| {
            let flag = |name: &str| flags.get(name).and_then(Value::as_bool).unwrap_or(true);
            (
                url,
                RelayFlags {
                    read: flag("read"),
                    write: flag("write"),
                },
            )
        })
        .collect()
}

/// Parse `r` tags. A tag without marker grants both permissions; repeated
/// tags for one URL accumulate.
pub fn membership_from_r_tags(tags: &[Tag]) -> RelayMembership {
    let mut out = RelayMembership::new();
    for tag in tags.iter().filter(|t| t.is("r")) {
        let Some(url) = tag.value() else { continue };
        let flags = match tag.get(2) {
            Some("read") => RelayFlags {
                read: true,
                write: false,
            },
            Some("write") => RelayFlags {
                read: false,
                write: true,
            },
            _ => RelayFlags::BOTH,
        };
        out.entry(url.to_string())
            .and_modify(|f| *f = f.or(flags))
            .or_insert(flags);
    }
    out
}

fn normalized_urls(relays: &RelayMembership) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in relays.keys().map(|u| relay_url::normalize(u)) {
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Rewrite membership keys to their canonical form, merging duplicates by
/// OR-ing their flags.
pub fn normalize_membership(relays: &RelayMembership) -> RelayMembership {
    let mut out = RelayMembership::new();
    for (url, flags) in relays {
        out.entry(relay_url::normalize(url))
            .and_modify(|f| *f = f.or(*flags))
            .or_insert(*flags);
    }
    out
}

/// Merge several lists into one contacts list: follows are unioned in first
/// seen order and the first list naming a relay decides its flags.
pub fn combine<'a>(lists: impl IntoIterator<Item = &'a ContactList>, created_at: u64) -> ContactList {
    let mut contacts: Vec<String> = Vec::new();
    let mut relays = RelayMembership::new();
    for list in lists {
        for c in &list.contacts {
            if !contacts.contains(c) {
                contacts.push(c.clone());
            }
        }
        for (url, flags) in &list.relays {
            relays.entry(url.clone()).or_insert(*flags);
        }
    }
    ContactList::new(ContactListKind::Contacts, created_at, contacts, relays)
}

/// Draft a kind 3 record carrying `list`'s follows and membership.
pub fn contacts_event_from(list: &ContactList, pubkey: &str, created_at: u64) -> Event {
    let tags = list.contacts.iter().map(|c| Tag::new(["p", c.as_str()])).collect();
    let content = serde_json::to_string(&list.relays).unwrap_or_else(|_| "{}".into());
    Event::draft(pubkey, kinds::CONTACTS, created_at, tags, content)
}

/// Draft a kind 10002 record expressing `list`'s membership as `r` tags.
/// Relays with neither permission are left out.
pub fn relay_list_event_from(list: &ContactList, pubkey: &str, created_at: u64) -> Event {
    let tags = list
        .relays
        .iter()
        .filter_map(|(url, flags)| match (flags.read, flags.write) {
            (true, true) => Some(Tag::new(["r", url.as_str()])),
            (true, false) => Some(Tag::new(["r", url.as_str(), "read"])),
            (false, true) => Some(Tag::new(["r", url.as_str(), "write"])),
            (false, false) => None,
        })
        .collect();
    Event::draft(pubkey, kinds::RELAY_LIST, created_at, tags, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(read: bool, write: bool) -> RelayFlags {
        RelayFlags { read, write }
    }

    #[test]
    fn parses_kind3() {
        let ev = Event::draft(
            "me",
            kinds::CONTACTS,
            10,
            vec![Tag::new(["p", "a"]), Tag::new(["e", "x"]), Tag::new(["p", "b"])],
            r#"{"wss://nos.lol/":{"read":true,"write":false},"nos.lol":{"write":true},"wss://x.y":{}}"#,
        );
        let list = ContactList::from_event(&ev).unwrap();
        assert_eq!(list.kind, ContactListKind::Contacts);
        assert_eq!(list.contacts, vec!["a", "b"]);
        assert_eq!(list.relays["wss://nos.lol/"], flags(true, false));
        assert_eq!(list.relays["nos.lol"], flags(true, true));
        assert_eq!(list.relays["wss://x.y"], RelayFlags::BOTH);
        assert_eq!(list.relays_normalized, vec!["wss://nos.lol", "wss://x.y"]);
    }

    #[test]
    fn malformed_content_is_empty_membership() {
        let ev = Event::draft("me", kinds::CONTACTS, 1, vec![], "not json");
        assert!(ContactList::from_event(&ev).unwrap().relays.is_empty());
        let ev = Event::draft("me", kinds::CONTACTS, 1, vec![], "[1,2]");
        assert!(ContactList::from_event(&ev).unwrap().relays.is_empty());
    }

    #[test]
    fn parses_kind10002_markers() {
        let ev = Event::draft(
            "me",
            kinds::RELAY_LIST,
            10,
            vec![
                Tag::new(["r", "wss://a.example"]),
                Tag::new(["r", "wss://b.example", "read"]),
                Tag::new(["r", "wss://c.example", "write"]),
                Tag::new(["r", "wss://c.example", "read"]),
                Tag::new(["p", "ignored"]),
            ],
            "",
        );
        let list = ContactList::from_event(&ev).unwrap();
        assert_eq!(list.kind, ContactListKind::Relays);
        assert!(list.contacts.is_empty());
        assert_eq!(list.relays["wss://a.example"], RelayFlags::BOTH);
        assert_eq!(list.relays["wss://b.example"], flags(true, false));
        assert_eq!(list.relays["wss://c.example"], RelayFlags::BOTH);
    }

    #[test]
    fn other_kinds_are_not_lists() {
        assert!(ContactList::from_event(&Event::draft("me", 1, 1, vec![], "")).is_none());
    }

    #[test]
    fn normalize_membership_ors_duplicates() {
        let mut m = RelayMembership::new();
        m.insert("wss://nos.lol/".into(), flags(true, false));
        m.insert("nos.lol".into(), flags(false, true));
        m.insert("wss://a.b".into(), flags(false, false));
        let n = normalize_membership(&m);
        assert_eq!(n.len(), 2);
        assert_eq!(n["wss://nos.lol"], RelayFlags::BOTH);
        assert_eq!(n["wss://a.b"], flags(false, false));
    }

    #[test]
    fn combine_unions_follows_and_keeps_first_flags() {
        let mut r1 = RelayMembership::new();
        r1.insert("wss://a".into(), flags(true, false));
        let mut r2 = RelayMembership::new();
        r2.insert("wss://a".into(), RelayFlags::BOTH);
        r2.insert("wss://b".into(), RelayFlags::BOTH);
        let l1 = ContactList::new(ContactListKind::Contacts, 1, vec!["x".into(), "y".into()], r1);
        let l2 = ContactList::new(ContactListKind::Relays, 2, vec!["y".into(), "z".into()], r2);
        let c = combine([&l1, &l2], 99);
        assert_eq!(c.kind, ContactListKind::Contacts);
        assert_eq!(c.created_at, 99);
        assert_eq!(c.contacts, vec!["x", "y", "z"]);
        assert_eq!(c.relays["wss://a"], flags(true, false));
        assert_eq!(c.relays["wss://b"], RelayFlags::BOTH);
    }

    #[test]
    fn self_follow_toggles() {
        let l = ContactList::new(
            ContactListKind::Contacts,
            1,
            vec!["me".into(), "a".into()],
            RelayMembership::new(),
        );
        let un = l.with_self_follow("me", false);
        assert_eq!(un.contacts, vec!["a"]);
        let re = un.with_self_follow("me", true);
        assert_eq!(re.contacts, vec!["a", "me"]);
        assert!(re.follows("me"));
    }

    #[test]
    fn event_drafts_carry_list_content() {
        let mut m = RelayMembership::new();
        m.insert("wss://a".into(), RelayFlags::BOTH);
        m.insert("wss://r".into(), flags(true, false));
        m.insert("wss://w".into(), flags(false, true));
        m.insert("wss://none".into(), flags(false, false));
        let l = ContactList::new(ContactListKind::Contacts, 1, vec!["x".into()], m.clone());

        let k3 = contacts_event_from(&l, "me", 50);
        assert_eq!(k3.kind, kinds::CONTACTS);
        assert_eq!(k3.created_at, 50);
        assert_eq!(ContactList::from_event(&k3).unwrap().relays, m);
        assert_eq!(k3.tag_values("p").collect::<Vec<_>>(), vec!["x"]);

        let k10002 = relay_list_event_from(&l, "me", 50);
        assert_eq!(
            k10002.tags,
            vec![
                Tag::new(["r", "wss://a"]),
                Tag::new(["r", "wss://r", "read"]),
                Tag::new(["r", "wss://w", "write"]),
            ]
        );
    }
}
