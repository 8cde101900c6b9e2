//! Profile metadata (kind 0).

use serde_json::Value;

use crate::event::Event;

/// Display fields of a kind 0 record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub username: String,
    pub about: String,
    pub picture: String,
}

impl Profile {
    /// Parse the JSON content of a kind 0 record. Malformed content yields an
    /// empty profile; fields of the wrong type are ignored.
    pub fn from_event(ev: &Event) -> Self {
        let content = serde_json::from_str::<Value>(&ev.content).unwrap_or(Value::Null);
        let field = |key: &str| {
            content
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Profile {
            display_name: field("display_name").unwrap_or_default(),
            username: field("username").or_else(|| field("name")).unwrap_or_default(),
            about: field("about").unwrap_or_default(),
            picture: field("picture").unwrap_or_default(),
        }
    }

    /// Best label for a human: display name, then username.
    pub fn label(&self) -> Option<&str> {
        [&self.display_name, &self.username]
            .into_iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}
