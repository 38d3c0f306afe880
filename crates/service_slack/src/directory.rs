use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use service_plugin::message::{UserDirectory, UserEntry};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connector::{ChatConnection, ConnectorError};

pub const DEFAULT_CHANNEL: &str = "general";

/// Snapshot of channels and users, with a direct message channel per human
/// user. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    channel_names: HashMap<String, String>,
    channel_ids: HashMap<String, String>,
    users: UserDirectory,
    user_names: HashMap<String, String>,
    built_at: Option<DateTime<Utc>>,
}

impl Directory {
    pub async fn build(conn: &dyn ChatConnection) -> Result<Self, ConnectorError> {
        let listing = conn.list_directory().await?;
        let mut dir = Directory { built_at: Some(Utc::now()), ..Default::default() };

        for channel in listing.channels {
            dir.channel_ids.insert(channel.name.clone(), channel.id.clone());
            dir.channel_names.insert(channel.id, channel.name);
        }

        for member in listing.members.into_iter().filter(|m| !m.deleted) {
            let channel_id = if member.is_bot {
                None
            } else {
                match conn.open_direct_channel(&member.id).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(user = %member.name, error = %e, "could not open direct channel");
                        None
                    }
                }
            };
            if let Some(dm) = &channel_id {
                dir.channel_names.insert(dm.clone(), member.name.clone());
            }
            dir.user_names.insert(member.id.clone(), member.name.clone());
            dir.users.insert(
                member.name.clone(),
                UserEntry {
                    id: member.id,
                    name: member.name,
                    real_name: member.real_name,
                    is_bot: member.is_bot,
                    channel_id,
                },
            );
        }

        debug!(channels = dir.channel_ids.len(), users = dir.users.len(), "directory built");
        Ok(dir)
    }

    /// Where to post for `target`: a channel name, a user name or user id
    /// (their direct channel). Unknown targets are returned unchanged.
    pub fn resolve_target(&self, target: Option<&str>) -> String {
        let target = target.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_CHANNEL);
        if let Some(id) = self.channel_ids.get(target) {
            return id.clone();
        }
        let user = self
            .users
            .get(target)
            .or_else(|| self.user_names.get(target).and_then(|name| self.users.get(name)));
        if let Some(dm) = user.and_then(|u| u.channel_id.clone()) {
            return dm;
        }
        target.to_owned()
    }

    pub fn channel_name(&self, channel_id: &str) -> Option<&str> {
        self.channel_names.get(channel_id).map(String::as_str)
    }

    pub fn user_name(&self, user_id: &str) -> Option<&str> {
        self.user_names.get(user_id).map(String::as_str)
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }
}

/// Shared handle to the current directory. Readers always see one complete
/// snapshot; a rebuild only swaps the pointer once it has finished.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    current: RwLock<Arc<Directory>>,
}

impl DirectoryCache {
    pub async fn get(&self) -> Arc<Directory> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn rebuild(&self, conn: &dyn ChatConnection) -> Result<Arc<Directory>, ConnectorError> {
        let fresh = Arc::new(Directory::build(conn).await?);
        *self.current.write().await = Arc::clone(&fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChannelEntry, DirectoryListing, MemberEntry};
    use crate::testing::MockConnection;

    fn listing() -> DirectoryListing {
        DirectoryListing {
            channels: vec![
                ChannelEntry { id: "C1".into(), name: "general".into() },
                ChannelEntry { id: "C2".into(), name: "ops".into() },
            ],
            members: vec![
                MemberEntry { id: "U1".into(), name: "alice".into(), real_name: Some("Alice".into()), is_bot: false, deleted: false },
                MemberEntry { id: "B1".into(), name: "helper".into(), real_name: None, is_bot: true, deleted: false },
                MemberEntry { id: "U9".into(), name: "gone".into(), real_name: None, is_bot: false, deleted: true },
            ],
        }
    }

    #[tokio::test]
    async fn resolves_channels_and_users() {
        let conn = MockConnection::with_listing(listing());
        let dir = Directory::build(&conn).await.unwrap();

        assert_eq!(dir.resolve_target(None), "C1");
        assert_eq!(dir.resolve_target(Some("ops")), "C2");
        assert_eq!(dir.resolve_target(Some("alice")), "D-U1");
        assert_eq!(dir.resolve_target(Some("U1")), "D-U1");
        assert_eq!(dir.resolve_target(Some("random")), "random");
        assert_eq!(dir.channel_name("D-U1"), Some("alice"));
        assert_eq!(dir.user_name("U1"), Some("alice"));
    }

    #[tokio::test]
    async fn bots_get_no_direct_channel_and_deleted_users_are_dropped() {
        let conn = MockConnection::with_listing(listing());
        let dir = Directory::build(&conn).await.unwrap();

        assert_eq!(dir.users()["helper"].channel_id, None);
        assert!(!dir.users().contains_key("gone"));
        assert_eq!(conn.opened_direct_channels().await, vec!["U1".to_string()]);
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_previous_snapshot() {
        let conn = MockConnection::with_listing(listing());
        let cache = DirectoryCache::default();
        cache.rebuild(&conn).await.unwrap();
        let before = cache.get().await;

        conn.fail_listing(true);
        assert!(cache.rebuild(&conn).await.is_err());
        assert!(Arc::ptr_eq(&before, &cache.get().await));
    }
}
