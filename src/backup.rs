//! Plain-text follow list backups.
//!
//! ```text
//! # nostr-followings-2users_2023-11-14_22-13-20.txt @alice
//! # pubkey: npub1...
//! # relays: {"wss://nos.lol":{"read":true,"write":true}}
//! # from: ["wss://nos.lol"]
//! 82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2
//! npub1...  # a comment
//! ```
//!
//! Lines end with CRLF. Readers accept any line ending.

use chrono::DateTime;
use tracing::debug;

use crate::{
    contacts::{membership_from_content, ContactList, RelayMembership},
    error::Result,
    keys::{npub_encode, parse_pubkey},
    store::Provenance,
};

const PUBKEY_HEADER: &str = "# pubkey: ";
const RELAYS_HEADER: &str = "# relays: ";
const FROM_HEADER: &str = "# from: ";

/// Parsed backup file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backup {
    /// Hex public key from the `# pubkey:` header.
    pub pubkey: Option<String>,
    /// A `# pubkey:` header was present but named no readable key.
    pub unreadable_pubkey: bool,
    pub relays: RelayMembership,
    pub from: Vec<String>,
    pub contacts: Vec<String>,
}

impl Backup {
    /// Whether the file cannot be shown to belong to `owner`.
    pub fn from_other_user(&self, owner: &str) -> bool {
        self.unreadable_pubkey || self.pubkey.as_deref().is_some_and(|pk| pk != owner)
    }
}

/// UTC timestamp in a form safe for file names and labels.
pub fn date_string(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|at| at.format("%Y-%m-%d_%H-%M-%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// File name used when exporting `list`.
pub fn file_name(list: &ContactList) -> String {
    format!(
        "nostr-followings-{}users_{}.txt",
        list.contacts.len(),
        date_string(list.created_at)
    )
}

/// Render `list` as a backup file owned by `owner`.
pub fn export(
    list: &ContactList,
    provenance: &Provenance,
    owner: &str,
    username: &str,
) -> Result<String> {
    let mut lines = vec![
        format!("# {} @{username}", file_name(list)),
        format!("{PUBKEY_HEADER}{}", npub_encode(owner)?),
        format!("{RELAYS_HEADER}{}", serde_json::to_string(&list.relays)?),
        format!("{FROM_HEADER}{}", serde_json::to_string(provenance)?),
    ];
    lines.extend(list.contacts.iter().cloned());
    lines.push(String::new());
    Ok(lines.join("\r\n"))
}

/// Parse a backup file. Follow lines that are neither hex keys nor valid
/// `npub` strings are skipped. An unreadable `# pubkey:` header only marks
/// the file as someone else's.
pub fn parse(text: &str) -> Backup {
    let mut backup = Backup::default();
    for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        if line.starts_with('#') {
            if let Some(rest) = line.strip_prefix(PUBKEY_HEADER) {
                match parse_pubkey(rest.trim()) {
                    Ok(key) => backup.pubkey = Some(key),
                    Err(e) => {
                        debug!(header = rest, error = %e, "unreadable pubkey header");
                        backup.unreadable_pubkey = true;
                    }
                }
            } else if let Some(rest) = line.strip_prefix(RELAYS_HEADER) {
                backup.relays = membership_from_content(rest);
            } else if let Some(rest) = line.strip_prefix(FROM_HEADER) {
                backup.from = serde_json::from_str(rest).unwrap_or_default();
            }
            continue;
        }
        let entry = strip_comment(line).trim();
        if entry.is_empty() {
            continue;
        }
        match parse_pubkey(entry) {
            Ok(key) => backup.contacts.push(key),
            Err(e) => debug!(entry, error = %e, "skipping backup line"),
        }
    }
    backup
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Provenance label for a loaded backup.
pub fn source_label(name: &str, from_other_user: bool) -> String {
    if from_other_user {
        format!("<backupFromDifferentUser: {name}>")
    } else {
        format!("<backup: {name}>")
    }
}
