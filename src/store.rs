//! Document store: record models and the access trait.
//!
//! Field and collection names are the wire format; changing them orphans
//! existing deployments.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::{doc, DateTime};
use futures_util::TryStreamExt;
use mongodb::{options::IndexOptions, Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};

/// Processed-message markers age out after 7 days; a message id seen again
/// past the window is treated as new.
pub const PROCESSED_RETENTION: Duration = Duration::from_secs(604_800);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub removal_date: DateTime,
    pub warn_date: DateTime,
    // absent until the warning has been sent; queried with $exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warned: Option<bool>,
}

impl UserRecord {
    pub const COLLECTION: &'static str = "users";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: i64,
    pub channel_name: String,
}

impl ChannelRecord {
    pub const COLLECTION: &'static str = "channels";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub invite_link: String,
    pub channel_id: i64,
    pub user_id: i64,
    pub created_at: DateTime,
}

impl InviteRecord {
    pub const COLLECTION: &'static str = "invites";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLinkRecord {
    pub forwarded_message_id: i32,
    pub user_id: i64,
}

impl RelayLinkRecord {
    pub const COLLECTION: &'static str = "forwarded_messages";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub message_id: i32,
    pub created_at: DateTime,
}

impl ProcessedRecord {
    pub const COLLECTION: &'static str = "processed_messages";
}

/// All persistent state flows through here; nothing is cached elsewhere.
#[async_trait]
pub trait Store: Send + Sync {
    /// Full-document upsert keyed on `user_id`: last write wins, and a
    /// record without `warned` resets the flag.
    async fn upsert_user(&self, user: &UserRecord) -> Result<()>;
    async fn users_to_warn(&self, now: DateTime) -> Result<Vec<UserRecord>>;
    async fn users_to_remove(&self, now: DateTime) -> Result<Vec<UserRecord>>;
    async fn mark_warned(&self, user_id: i64) -> Result<()>;
    async fn delete_user(&self, user_id: i64) -> Result<()>;
    async fn all_users(&self) -> Result<Vec<UserRecord>>;

    /// Returns false when the channel id is already present.
    async fn add_channel(&self, channel: &ChannelRecord) -> Result<bool>;
    /// Returns false when the channel id was not present.
    async fn remove_channel(&self, channel_id: i64) -> Result<bool>;
    async fn list_channels(&self) -> Result<Vec<ChannelRecord>>;

    async fn insert_invite(&self, invite: &InviteRecord) -> Result<()>;
    async fn invites_for(&self, channel_id: i64, user_id: i64) -> Result<Vec<InviteRecord>>;
    async fn expired_invites(&self, cutoff: DateTime) -> Result<Vec<InviteRecord>>;
    /// Deleting an absent link is a no-op, so racing sweeps are harmless.
    async fn delete_invite(&self, link: &str) -> Result<()>;

    async fn insert_relay_link(&self, link: &RelayLinkRecord) -> Result<()>;
    async fn relay_target(&self, forwarded_message_id: i32) -> Result<Option<i64>>;

    async fn mark_processed(&self, message_id: i32, at: DateTime) -> Result<()>;
    /// A marker only counts while younger than the retention cutoff, so the
    /// server-side TTL purge lag never suppresses a legitimate forward.
    async fn is_processed(&self, message_id: i32, cutoff: DateTime) -> Result<bool>;
}

pub struct MongoStore {
    users: Collection<UserRecord>,
    channels: Collection<ChannelRecord>,
    invites: Collection<InviteRecord>,
    relay_links: Collection<RelayLinkRecord>,
    processed: Collection<ProcessedRecord>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("connect to document store")?;
        let db = client.database(database);
        let store = Self {
            users: db.collection(UserRecord::COLLECTION),
            channels: db.collection(ChannelRecord::COLLECTION),
            invites: db.collection(InviteRecord::COLLECTION),
            relay_links: db.collection(RelayLinkRecord::COLLECTION),
            processed: db.collection(ProcessedRecord::COLLECTION),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let ttl = IndexModel::builder()
            .keys(doc! { "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(PROCESSED_RETENTION)
                    .build(),
            )
            .build();
        self.processed
            .create_index(ttl)
            .await
            .context("create ttl index on processed_messages")?;
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.users
            .replace_one(doc! { "user_id": user.user_id }, user)
            .upsert(true)
            .await
            .context("upsert user")?;
        Ok(())
    }

    async fn users_to_warn(&self, now: DateTime) -> Result<Vec<UserRecord>> {
        let cursor = self
            .users
            .find(doc! { "warn_date": { "$lte": now }, "warned": { "$exists": false } })
            .await
            .context("query users to warn")?;
        Ok(cursor.try_collect().await?)
    }

    async fn users_to_remove(&self, now: DateTime) -> Result<Vec<UserRecord>> {
        let cursor = self
            .users
            .find(doc! { "removal_date": { "$lte": now } })
            .await
            .context("query users to remove")?;
        Ok(cursor.try_collect().await?)
    }

    async fn mark_warned(&self, user_id: i64) -> Result<()> {
        self.users
            .update_one(doc! { "user_id": user_id }, doc! { "$set": { "warned": true } })
            .await
            .context("mark user warned")?;
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<()> {
        self.users
            .delete_one(doc! { "user_id": user_id })
            .await
            .context("delete user")?;
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        let cursor = self.users.find(doc! {}).await.context("list users")?;
        Ok(cursor.try_collect().await?)
    }

    async fn add_channel(&self, channel: &ChannelRecord) -> Result<bool> {
        let existing = self
            .channels
            .find_one(doc! { "channel_id": channel.channel_id })
            .await
            .context("look up channel")?;
        if existing.is_some() {
            return Ok(false);
        }
        self.channels
            .insert_one(channel)
            .await
            .context("insert channel")?;
        Ok(true)
    }

    async fn remove_channel(&self, channel_id: i64) -> Result<bool> {
        let result = self
            .channels
            .delete_one(doc! { "channel_id": channel_id })
            .await
            .context("delete channel")?;
        Ok(result.deleted_count > 0)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        let cursor = self.channels.find(doc! {}).await.context("list channels")?;
        Ok(cursor.try_collect().await?)
    }

    async fn insert_invite(&self, invite: &InviteRecord) -> Result<()> {
        self.invites
            .insert_one(invite)
            .await
            .context("insert invite")?;
        Ok(())
    }

    async fn invites_for(&self, channel_id: i64, user_id: i64) -> Result<Vec<InviteRecord>> {
        let cursor = self
            .invites
            .find(doc! { "channel_id": channel_id, "user_id": user_id })
            .await
            .context("query invites for user")?;
        Ok(cursor.try_collect().await?)
    }

    async fn expired_invites(&self, cutoff: DateTime) -> Result<Vec<InviteRecord>> {
        let cursor = self
            .invites
            .find(doc! { "created_at": { "$lte": cutoff } })
            .await
            .context("query expired invites")?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_invite(&self, link: &str) -> Result<()> {
        self.invites
            .delete_one(doc! { "invite_link": link })
            .await
            .context("delete invite")?;
        Ok(())
    }

    async fn insert_relay_link(&self, link: &RelayLinkRecord) -> Result<()> {
        self.relay_links
            .insert_one(link)
            .await
            .context("insert relay link")?;
        Ok(())
    }

    async fn relay_target(&self, forwarded_message_id: i32) -> Result<Option<i64>> {
        let found = self
            .relay_links
            .find_one(doc! { "forwarded_message_id": forwarded_message_id })
            .await
            .context("look up relay link")?;
        Ok(found.map(|r| r.user_id))
    }

    async fn mark_processed(&self, message_id: i32, at: DateTime) -> Result<()> {
        self.processed
            .insert_one(ProcessedRecord {
                message_id,
                created_at: at,
            })
            .await
            .context("insert processed marker")?;
        Ok(())
    }

    async fn is_processed(&self, message_id: i32, cutoff: DateTime) -> Result<bool> {
        let found = self
            .processed
            .find_one(doc! { "message_id": message_id, "created_at": { "$gt": cutoff } })
            .await
            .context("look up processed marker")?;
        Ok(found.is_some())
    }
}
