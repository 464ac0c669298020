//! In-memory doubles for the store and the platform seam, used by the unit
//! tests. Semantics mirror the production implementations: the same cutoff
//! rules, the same idempotent deletes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bson::DateTime;
use dashmap::DashMap;
use teloxide::types::{ChatId, InlineKeyboardMarkup, MessageId, UserId};

use crate::config::MessagesConfig;
use crate::error::SendError;
use crate::outbound::Outbound;
use crate::store::{
    ChannelRecord, InviteRecord, ProcessedRecord, RelayLinkRecord, Store, UserRecord,
};
use crate::AppContext;

pub fn ctx_with(store: Arc<MemStore>, outbound: Arc<RecordingOutbound>) -> AppContext {
    AppContext {
        admin_id: UserId(999),
        store,
        outbound,
        pending: DashMap::new(),
        messages: MessagesConfig::default(),
    }
}

#[derive(Default)]
pub struct MemStore {
    users: Mutex<Vec<UserRecord>>,
    channels: Mutex<Vec<ChannelRecord>>,
    invites: Mutex<Vec<InviteRecord>>,
    relay_links: Mutex<Vec<RelayLinkRecord>>,
    processed: Mutex<Vec<ProcessedRecord>>,
}

impl MemStore {
    pub async fn relay_link_count(&self) -> usize {
        self.relay_links.lock().unwrap().len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users.retain(|u| u.user_id != user.user_id);
        users.push(user.clone());
        Ok(())
    }

    async fn users_to_warn(&self, now: DateTime) -> Result<Vec<UserRecord>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.warn_date <= now && u.warned.is_none())
            .cloned()
            .collect())
    }

    async fn users_to_remove(&self, now: DateTime) -> Result<Vec<UserRecord>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.removal_date <= now)
            .cloned()
            .collect())
    }

    async fn mark_warned(&self, user_id: i64) -> Result<()> {
        for user in self.users.lock().unwrap().iter_mut() {
            if user.user_id == user_id {
                user.warned = Some(true);
            }
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<()> {
        self.users.lock().unwrap().retain(|u| u.user_id != user_id);
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.users.lock().unwrap().clone())
    }

    async fn add_channel(&self, channel: &ChannelRecord) -> Result<bool> {
        let mut channels = self.channels.lock().unwrap();
        if channels.iter().any(|c| c.channel_id == channel.channel_id) {
            return Ok(false);
        }
        channels.push(channel.clone());
        Ok(true)
    }

    async fn remove_channel(&self, channel_id: i64) -> Result<bool> {
        let mut channels = self.channels.lock().unwrap();
        let before = channels.len();
        channels.retain(|c| c.channel_id != channel_id);
        Ok(channels.len() < before)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn insert_invite(&self, invite: &InviteRecord) -> Result<()> {
        self.invites.lock().unwrap().push(invite.clone());
        Ok(())
    }

    async fn invites_for(&self, channel_id: i64, user_id: i64) -> Result<Vec<InviteRecord>> {
        Ok(self
            .invites
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.channel_id == channel_id && i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn expired_invites(&self, cutoff: DateTime) -> Result<Vec<InviteRecord>> {
        Ok(self
            .invites
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.created_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn delete_invite(&self, link: &str) -> Result<()> {
        self.invites.lock().unwrap().retain(|i| i.invite_link != link);
        Ok(())
    }

    async fn insert_relay_link(&self, link: &RelayLinkRecord) -> Result<()> {
        self.relay_links.lock().unwrap().push(link.clone());
        Ok(())
    }

    async fn relay_target(&self, forwarded_message_id: i32) -> Result<Option<i64>> {
        Ok(self
            .relay_links
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.forwarded_message_id == forwarded_message_id)
            .map(|l| l.user_id))
    }

    async fn mark_processed(&self, message_id: i32, at: DateTime) -> Result<()> {
        self.processed.lock().unwrap().push(ProcessedRecord {
            message_id,
            created_at: at,
        });
        Ok(())
    }

    async fn is_processed(&self, message_id: i32, cutoff: DateTime) -> Result<bool> {
        Ok(self
            .processed
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.message_id == message_id && p.created_at > cutoff))
    }
}

/// Records every platform call; failures are scripted per chat or channel.
#[derive(Default)]
pub struct RecordingOutbound {
    /// (chat, text)
    pub texts: Mutex<Vec<(i64, String)>>,
    /// (chat, text, button count)
    pub keyboards: Mutex<Vec<(i64, String, usize)>>,
    /// (chat, message id)
    pub deleted: Mutex<Vec<(i64, i32)>>,
    /// (to, from, message id, forwarded id)
    pub forwards: Mutex<Vec<(i64, i64, i32, i32)>>,
    /// (to, from, message id)
    pub copies: Mutex<Vec<(i64, i64, i32)>>,
    /// channel id per created link
    pub created_invites: Mutex<Vec<i64>>,
    /// (channel id, link)
    pub revoked: Mutex<Vec<(i64, String)>>,
    /// (chat, user)
    pub bans: Mutex<Vec<(i64, i64)>>,
    /// (chat, user)
    pub unbans: Mutex<Vec<(i64, i64)>>,

    blocked_chats: Mutex<HashSet<i64>>,
    failing_invite_channels: Mutex<HashSet<i64>>,
    failing_ban_chats: Mutex<HashSet<i64>>,
    failing_revocation_chats: Mutex<HashSet<i64>>,

    next_id: AtomicI32,
}

impl RecordingOutbound {
    pub fn block_chat(&self, chat: i64) {
        self.blocked_chats.lock().unwrap().insert(chat);
    }

    pub fn fail_invites_for(&self, channel: i64) {
        self.failing_invite_channels.lock().unwrap().insert(channel);
    }

    pub fn fail_bans_in(&self, chat: i64) {
        self.failing_ban_chats.lock().unwrap().insert(chat);
    }

    pub fn fail_revocations_in(&self, chat: i64) {
        self.failing_revocation_chats.lock().unwrap().insert(chat);
    }

    fn next_message_id(&self) -> i32 {
        1000 + self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_reachable(&self, chat: ChatId) -> Result<(), SendError> {
        if self.blocked_chats.lock().unwrap().contains(&chat.0) {
            Err(SendError::Blocked)
        } else {
            Ok(())
        }
    }

    fn scripted_failure() -> SendError {
        SendError::Platform(teloxide::RequestError::Api(teloxide::ApiError::Unknown(
            "scripted failure".into(),
        )))
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId, SendError> {
        self.check_reachable(chat)?;
        self.texts.lock().unwrap().push((chat.0, text.to_string()));
        Ok(MessageId(self.next_message_id()))
    }

    async fn send_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId, SendError> {
        self.check_reachable(chat)?;
        let buttons = keyboard.inline_keyboard.iter().map(|row| row.len()).sum();
        self.keyboards
            .lock()
            .unwrap()
            .push((chat.0, text.to_string(), buttons));
        Ok(MessageId(self.next_message_id()))
    }

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), SendError> {
        self.deleted.lock().unwrap().push((chat.0, id.0));
        Ok(())
    }

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        id: MessageId,
    ) -> Result<MessageId, SendError> {
        self.check_reachable(to)?;
        let forwarded = self.next_message_id();
        self.forwards
            .lock()
            .unwrap()
            .push((to.0, from.0, id.0, forwarded));
        Ok(MessageId(forwarded))
    }

    async fn copy_message(
        &self,
        to: ChatId,
        from: ChatId,
        id: MessageId,
    ) -> Result<(), SendError> {
        self.check_reachable(to)?;
        self.copies.lock().unwrap().push((to.0, from.0, id.0));
        Ok(())
    }

    async fn display_name(&self, _user: UserId) -> Option<String> {
        None
    }

    async fn create_invite_link(&self, chat: ChatId) -> Result<String, SendError> {
        if self.failing_invite_channels.lock().unwrap().contains(&chat.0) {
            return Err(Self::scripted_failure());
        }
        self.created_invites.lock().unwrap().push(chat.0);
        let n = self.next_message_id();
        Ok(format!("https://t.me/+warden{}x{}", chat.0.unsigned_abs(), n))
    }

    async fn revoke_invite_link(&self, chat: ChatId, link: &str) -> Result<(), SendError> {
        if self.failing_revocation_chats.lock().unwrap().contains(&chat.0) {
            return Err(Self::scripted_failure());
        }
        self.revoked.lock().unwrap().push((chat.0, link.to_string()));
        Ok(())
    }

    async fn ban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError> {
        if self.failing_ban_chats.lock().unwrap().contains(&chat.0) {
            return Err(Self::scripted_failure());
        }
        self.bans.lock().unwrap().push((chat.0, user.0 as i64));
        Ok(())
    }

    async fn unban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError> {
        self.unbans.lock().unwrap().push((chat.0, user.0 as i64));
        Ok(())
    }
}
