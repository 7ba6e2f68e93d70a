//! Context addressing
//!
//! Computes a stable hierarchical key from a frontend location
//! (server/category/channel/thread, DM, API chat). The address is the sole
//! primary key for memory records — no surrogate id exists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel name carried by placeholder components for absent levels
pub const DUMMY_NAME: &str = "none";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Frontend {
    Discord,
    Telegram,
    Api,
}

impl fmt::Display for Frontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Frontend::Discord => "discord",
            Frontend::Telegram => "telegram",
            Frontend::Api => "api",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Server,
    Category,
    Channel,
    Thread,
    Dm,
    Dummy,
}

/// One level of the location hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Component {
    pub kind: ComponentKind,
    pub id: u64,
    pub name: String,
}

impl Component {
    pub fn new(kind: ComponentKind, id: u64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    /// Placeholder for a level that does not exist at this location
    pub fn dummy() -> Self {
        Self {
            kind: ComponentKind::Dummy,
            id: 0,
            name: DUMMY_NAME.to_string(),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.kind == ComponentKind::Dummy
    }
}

/// Supported inbound location shapes, as reported by frontend adapters
#[derive(Debug, Clone)]
pub enum Location {
    GuildChannel {
        guild_id: u64,
        guild_name: String,
        category: Option<(u64, String)>,
        channel_id: u64,
        channel_name: String,
    },
    Thread {
        guild_id: u64,
        guild_name: String,
        category: Option<(u64, String)>,
        channel_id: u64,
        channel_name: String,
        thread_id: u64,
        thread_name: String,
    },
    /// Forum posts behave like threads whose parent is the forum channel
    ForumPost {
        guild_id: u64,
        guild_name: String,
        category: Option<(u64, String)>,
        forum_id: u64,
        forum_name: String,
        post_id: u64,
        post_name: String,
    },
    DirectMessage {
        user_id: u64,
        user_name: String,
    },
    /// HTTP surface: arbitrary string chat ids mapped to stable numeric ids
    ApiChat {
        chat_id: String,
    },
}

/// Flat exact-match lookup form of an address
pub type AddressQuery = BTreeMap<String, String>;

/// Deterministic key for one conversation's memory record.
///
/// Every level is always populated; absent levels carry the dummy component.
/// Lookup equality is defined over numeric ids only, so renaming a channel
/// does not orphan its record. Names survive in `as_path()` for logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAddress {
    pub frontend: Frontend,
    pub server: Component,
    pub category: Component,
    pub channel: Component,
    pub thread: Component,
}

impl ContextAddress {
    /// Map a frontend location to its address. Total: every supported shape
    /// produces a fully populated address.
    pub fn from_location(location: &Location) -> Self {
        match location {
            Location::GuildChannel {
                guild_id,
                guild_name,
                category,
                channel_id,
                channel_name,
            } => Self {
                frontend: Frontend::Discord,
                server: Component::new(ComponentKind::Server, *guild_id, guild_name.clone()),
                category: category_component(category),
                channel: Component::new(ComponentKind::Channel, *channel_id, channel_name.clone()),
                thread: Component::dummy(),
            },
            Location::Thread {
                guild_id,
                guild_name,
                category,
                channel_id,
                channel_name,
                thread_id,
                thread_name,
            } => Self {
                frontend: Frontend::Discord,
                server: Component::new(ComponentKind::Server, *guild_id, guild_name.clone()),
                category: category_component(category),
                channel: Component::new(ComponentKind::Channel, *channel_id, channel_name.clone()),
                thread: Component::new(ComponentKind::Thread, *thread_id, thread_name.clone()),
            },
            Location::ForumPost {
                guild_id,
                guild_name,
                category,
                forum_id,
                forum_name,
                post_id,
                post_name,
            } => Self {
                frontend: Frontend::Discord,
                server: Component::new(ComponentKind::Server, *guild_id, guild_name.clone()),
                category: category_component(category),
                channel: Component::new(ComponentKind::Channel, *forum_id, forum_name.clone()),
                thread: Component::new(ComponentKind::Thread, *post_id, post_name.clone()),
            },
            Location::DirectMessage { user_id, user_name } => Self {
                frontend: Frontend::Discord,
                server: Component::dummy(),
                category: Component::dummy(),
                channel: Component::new(ComponentKind::Dm, *user_id, user_name.clone()),
                thread: Component::dummy(),
            },
            Location::ApiChat { chat_id } => Self {
                frontend: Frontend::Api,
                server: Component::dummy(),
                category: Component::dummy(),
                channel: Component::new(
                    ComponentKind::Channel,
                    stable_numeric_id(chat_id),
                    chat_id.clone(),
                ),
                thread: Component::dummy(),
            },
        }
    }

    /// Flat key/value mapping for exact-match lookups against the store
    pub fn as_query(&self) -> AddressQuery {
        let mut query = BTreeMap::new();
        query.insert("frontend".to_string(), self.frontend.to_string());
        query.insert("server_id".to_string(), self.server.id.to_string());
        query.insert("category_id".to_string(), self.category.id.to_string());
        query.insert("channel_id".to_string(), self.channel.id.to_string());
        query.insert("thread_id".to_string(), self.thread.id.to_string());
        query
    }

    /// Single-string form of `as_query()`, used as the store primary key
    pub fn canonical_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.frontend, self.server.id, self.category.id, self.channel.id, self.thread.id
        )
    }

    /// Human-readable path for logs and debugging only.
    ///
    /// Never use this as a lookup key: it is built from names and is not
    /// collision-free across renames.
    pub fn as_path(&self) -> String {
        let mut parts = vec![self.frontend.to_string()];
        for component in [&self.server, &self.category, &self.channel, &self.thread] {
            if !component.is_dummy() {
                parts.push(component.name.clone());
            }
        }
        parts.join("/")
    }
}

// Address equality is query equality, not name equality.
impl PartialEq for ContextAddress {
    fn eq(&self, other: &Self) -> bool {
        self.as_query() == other.as_query()
    }
}

impl Eq for ContextAddress {}

impl std::hash::Hash for ContextAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_key().hash(state);
    }
}

fn category_component(category: &Option<(u64, String)>) -> Component {
    match category {
        Some((id, name)) => Component::new(ComponentKind::Category, *id, name.clone()),
        None => Component::dummy(),
    }
}

/// Derive a stable numeric id from an arbitrary string identifier
pub fn stable_numeric_id(input: &str) -> u64 {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild_channel() -> Location {
        Location::GuildChannel {
            guild_id: 42,
            guild_name: "trading-floor".to_string(),
            category: Some((7, "general".to_string())),
            channel_id: 100,
            channel_name: "market-chat".to_string(),
        }
    }

    #[test]
    fn test_same_location_same_query() {
        let a = ContextAddress::from_location(&guild_channel());
        let b = ContextAddress::from_location(&guild_channel());
        assert_eq!(a.as_query(), b.as_query());
        assert_eq!(a, b);
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn test_rename_does_not_change_query() {
        let before = ContextAddress::from_location(&guild_channel());
        let after = ContextAddress::from_location(&Location::GuildChannel {
            guild_id: 42,
            guild_name: "trading-floor".to_string(),
            category: Some((7, "general".to_string())),
            channel_id: 100,
            channel_name: "renamed-chat".to_string(),
        });

        assert_eq!(before, after);
        assert_ne!(before.as_path(), after.as_path());
    }

    #[test]
    fn test_dm_fills_dummy_levels() {
        let address = ContextAddress::from_location(&Location::DirectMessage {
            user_id: 9,
            user_name: "sam".to_string(),
        });

        assert!(address.server.is_dummy());
        assert!(address.category.is_dummy());
        assert!(address.thread.is_dummy());
        assert_eq!(address.server.id, 0);
        assert_eq!(address.server.name, DUMMY_NAME);
        assert_eq!(address.channel.kind, ComponentKind::Dm);
        assert_eq!(address.channel.id, 9);
    }

    #[test]
    fn test_thread_and_parent_channel_differ() {
        let channel = ContextAddress::from_location(&guild_channel());
        let thread = ContextAddress::from_location(&Location::Thread {
            guild_id: 42,
            guild_name: "trading-floor".to_string(),
            category: Some((7, "general".to_string())),
            channel_id: 100,
            channel_name: "market-chat".to_string(),
            thread_id: 555,
            thread_name: "deep-dive".to_string(),
        });

        assert_ne!(channel, thread);
        assert_ne!(channel.canonical_key(), thread.canonical_key());
    }

    #[test]
    fn test_forum_post_maps_like_thread() {
        let post = ContextAddress::from_location(&Location::ForumPost {
            guild_id: 42,
            guild_name: "trading-floor".to_string(),
            category: None,
            forum_id: 200,
            forum_name: "ideas".to_string(),
            post_id: 777,
            post_name: "new-strategy".to_string(),
        });

        assert_eq!(post.channel.id, 200);
        assert_eq!(post.thread.id, 777);
        assert_eq!(post.thread.kind, ComponentKind::Thread);
        assert!(post.category.is_dummy());
    }

    #[test]
    fn test_api_chat_stable_numeric_id() {
        let a = ContextAddress::from_location(&Location::ApiChat {
            chat_id: "session-abc".to_string(),
        });
        let b = ContextAddress::from_location(&Location::ApiChat {
            chat_id: "session-abc".to_string(),
        });
        let c = ContextAddress::from_location(&Location::ApiChat {
            chat_id: "session-xyz".to_string(),
        });

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.channel.id != 0);
    }

    #[test]
    fn test_path_skips_dummy_levels() {
        let address = ContextAddress::from_location(&Location::DirectMessage {
            user_id: 9,
            user_name: "sam".to_string(),
        });
        assert_eq!(address.as_path(), "discord/sam");
    }
}
