//! Badge definitions (30009), awards (8) and the accepted badge set (30008).

use std::fmt;

use crate::event::{kinds, Event, Tag};

/// Identity of a badge definition: issuer plus `d` tag.
///
/// Written in `a` tags as `30009:<issuer>:<d>`. Only the first two colons
/// separate fields, so `d` may itself contain colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionKey {
    pub issuer: String,
    pub d: String,
}

impl DefinitionKey {
    pub fn new(issuer: impl Into<String>, d: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            d: d.into(),
        }
    }

    /// Parse an `a` tag value. Anything but a non-empty issuer under kind
    /// 30009 is rejected.
    pub fn parse(a: &str) -> Option<Self> {
        let mut parts = a.splitn(3, ':');
        let kind = parts.next()?;
        let issuer = parts.next()?;
        let d = parts.next()?;
        if kind.parse::<u32>().ok()? != kinds::BADGE_DEFINITION || issuer.is_empty() {
            return None;
        }
        Some(Self::new(issuer, d))
    }

    /// The key a kind 30009 record defines.
    pub fn of_definition(ev: &Event) -> Option<Self> {
        (ev.kind == kinds::BADGE_DEFINITION)
            .then(|| Self::new(ev.pubkey.clone(), ev.d_tag().unwrap_or_default()))
    }

    pub fn a_tag(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", kinds::BADGE_DEFINITION, self.issuer, self.d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeDefinition {
    pub key: DefinitionKey,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub thumb: Option<String>,
}

impl BadgeDefinition {
    pub fn from_event(ev: &Event) -> Option<Self> {
        let key = DefinitionKey::of_definition(ev)?;
        let field = |name: &str| ev.first_tag_value(name).map(str::to_string);
        Some(Self {
            key,
            name: field("name"),
            description: field("description"),
            image: field("image"),
            thumb: field("thumb"),
        })
    }
}

/// A kind 8 award. Only the first `a` tag counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeAward {
    pub definition: DefinitionKey,
    pub awardees: Vec<String>,
}

impl BadgeAward {
    pub fn from_event(ev: &Event) -> Option<Self> {
        if ev.kind != kinds::BADGE_AWARD {
            return None;
        }
        let definition = DefinitionKey::parse(ev.first_tag_value("a")?)?;
        Some(Self {
            definition,
            awardees: ev.tag_values("p").map(str::to_string).collect(),
        })
    }
}

/// One entry of the accepted badge set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBadge {
    pub definition: DefinitionKey,
    pub award_id: String,
    pub relay_hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedBadgeSet {
    pub entries: Vec<AcceptedBadge>,
}

impl AcceptedBadgeSet {
    /// Replay the tag sequence `d, a, e, e, a, e, …`: each `e` pairs with the
    /// closest preceding `a`. An `e` with no usable `a` before it is skipped.
    pub fn from_event(ev: &Event) -> Option<Self> {
        if ev.kind != kinds::PROFILE_BADGES || ev.d_tag() != Some(kinds::PROFILE_BADGES_D) {
            return None;
        }
        let mut entries = Vec::new();
        let mut last_a: Option<DefinitionKey> = None;
        for tag in &ev.tags {
            match tag.name() {
                Some("a") => last_a = tag.value().and_then(DefinitionKey::parse),
                Some("e") => {
                    if let (Some(definition), Some(award_id)) = (&last_a, tag.value()) {
                        entries.push(AcceptedBadge {
                            definition: definition.clone(),
                            award_id: award_id.to_string(),
                            relay_hint: tag.get(2).filter(|s| !s.is_empty()).map(str::to_string),
                        });
                    }
                }
                _ => {}
            }
        }
        Some(Self { entries })
    }

    pub fn contains(&self, key: &DefinitionKey) -> bool {
        self.entries.iter().any(|e| &e.definition == key)
    }
}

/// Tags of a fresh accepted badge set.
pub fn empty_set_tags() -> Vec<Tag> {
    vec![Tag::new(["d", kinds::PROFILE_BADGES_D])]
}

/// Append `a`/`e` pairs for every badge not already referenced anywhere in
/// `tags`. `None` when nothing would change.
pub fn accept_tags(tags: &[Tag], badges: &[AcceptedBadge]) -> Option<Vec<Tag>> {
    let mut out = tags.to_vec();
    for badge in badges {
        let a = badge.definition.a_tag();
        if out.iter().any(|t| t.value() == Some(a.as_str())) {
            continue;
        }
        out.push(Tag::new(["a", a.as_str()]));
        let mut e = vec!["e".to_string(), badge.award_id.clone()];
        if let Some(hint) = &badge.relay_hint {
            e.push(hint.clone());
        }
        out.push(Tag(e));
    }
    (out.len() != tags.len()).then_some(out)
}

/// Drop each `a` tag naming one of `keys` together with the `e` tags that
/// follow it. `None` when nothing would change.
pub fn revoke_tags(tags: &[Tag], keys: &[DefinitionKey]) -> Option<Vec<Tag>> {
    let mut out = Vec::with_capacity(tags.len());
    let mut dropping = false;
    for tag in tags {
        if tag.is("a") {
            dropping = tag
                .value()
                .and_then(DefinitionKey::parse)
                .map_or(false, |k| keys.contains(&k));
        } else if !tag.is("e") {
            dropping = false;
        }
        if !dropping {
            out.push(tag.clone());
        }
    }
    (out.len() != tags.len()).then_some(out)
}

/// Draft the kind 30008 record for `tags`.
pub fn accepted_set_event(pubkey: &str, created_at: u64, tags: Vec<Tag>) -> Event {
    Event::draft(pubkey, kinds::PROFILE_BADGES, created_at, tags, "")
}
