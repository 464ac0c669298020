use std::time::Duration;

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{ChatId, InlineKeyboardMarkup, MessageId, UserId},
    RequestError,
};
use tracing::{debug, warn};

use crate::error::SendError;

/// Cap on how many times a single call is re-issued after the platform asks
/// to slow down. Each wait honors the platform-provided delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Issues `make()` and, on a rate-limit signal, sleeps for the announced
/// delay and rebuilds the request. Only the failed call is re-issued, so a
/// side effect that already completed is never re-run.
pub async fn request_with_backoff<R, F>(
    ctx: &str,
    policy: &RetryPolicy,
    make: F,
) -> Result<<R::Payload as Payload>::Output, RequestError>
where
    F: Fn() -> R,
    R: Request<Err = RequestError> + HasPayload,
{
    let mut attempt: u32 = 0;
    loop {
        match make().send().await {
            Err(RequestError::RetryAfter(delay)) if attempt < policy.max_attempts => {
                attempt += 1;
                let secs = u64::from(delay.seconds());
                warn!(
                    "rate limited ({ctx}): waiting {secs}s before retry {attempt}/{}",
                    policy.max_attempts
                );
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            Err(RequestError::RetryAfter(delay)) => {
                warn!("rate limited ({ctx}): retry budget exhausted, giving up");
                return Err(RequestError::RetryAfter(delay));
            }
            other => return other,
        }
    }
}

/// The platform operations the engine consumes. Everything is a single call;
/// rate-limit handling lives below this seam.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId, SendError>;

    async fn send_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId, SendError>;

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), SendError>;

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        id: MessageId,
    ) -> Result<MessageId, SendError>;

    async fn copy_message(&self, to: ChatId, from: ChatId, id: MessageId)
        -> Result<(), SendError>;

    /// Best-effort profile lookup; `None` never blocks the caller.
    async fn display_name(&self, user: UserId) -> Option<String>;

    /// Creates a fresh single-use (member limit 1) invite link.
    async fn create_invite_link(&self, chat: ChatId) -> Result<String, SendError>;

    async fn revoke_invite_link(&self, chat: ChatId, link: &str) -> Result<(), SendError>;

    async fn ban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError>;

    async fn unban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError>;
}

pub struct BotOutbound {
    bot: Bot,
    policy: RetryPolicy,
}

impl BotOutbound {
    pub fn new(bot: Bot, policy: RetryPolicy) -> Self {
        Self { bot, policy }
    }
}

#[async_trait]
impl Outbound for BotOutbound {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId, SendError> {
        let msg = request_with_backoff("send_message", &self.policy, || {
            self.bot.send_message(chat, text)
        })
        .await?;
        Ok(msg.id)
    }

    async fn send_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId, SendError> {
        let msg = request_with_backoff("send_message", &self.policy, || {
            self.bot.send_message(chat, text).reply_markup(keyboard.clone())
        })
        .await?;
        Ok(msg.id)
    }

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), SendError> {
        request_with_backoff("delete_message", &self.policy, || {
            self.bot.delete_message(chat, id)
        })
        .await?;
        Ok(())
    }

    async fn forward_message(
        &self,
        to: ChatId,
        from: ChatId,
        id: MessageId,
    ) -> Result<MessageId, SendError> {
        let msg = request_with_backoff("forward_message", &self.policy, || {
            self.bot.forward_message(to, from, id)
        })
        .await?;
        Ok(msg.id)
    }

    async fn copy_message(
        &self,
        to: ChatId,
        from: ChatId,
        id: MessageId,
    ) -> Result<(), SendError> {
        request_with_backoff("copy_message", &self.policy, || {
            self.bot.copy_message(to, from, id)
        })
        .await?;
        Ok(())
    }

    async fn display_name(&self, user: UserId) -> Option<String> {
        let chat = ChatId(user.0 as i64);
        match request_with_backoff("get_chat", &self.policy, || self.bot.get_chat(chat)).await {
            Ok(profile) => profile
                .first_name()
                .map(str::to_owned)
                .or_else(|| profile.title().map(str::to_owned)),
            Err(e) => {
                debug!("get_chat failed for {user}: {e}");
                None
            }
        }
    }

    async fn create_invite_link(&self, chat: ChatId) -> Result<String, SendError> {
        let link = request_with_backoff("create_chat_invite_link", &self.policy, || {
            self.bot.create_chat_invite_link(chat).member_limit(1)
        })
        .await?;
        Ok(link.invite_link)
    }

    async fn revoke_invite_link(&self, chat: ChatId, link: &str) -> Result<(), SendError> {
        request_with_backoff("revoke_chat_invite_link", &self.policy, || {
            self.bot.revoke_chat_invite_link(chat, link)
        })
        .await?;
        Ok(())
    }

    async fn ban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError> {
        request_with_backoff("ban_chat_member", &self.policy, || {
            self.bot.ban_chat_member(chat, user)
        })
        .await?;
        Ok(())
    }

    async fn unban_member(&self, chat: ChatId, user: UserId) -> Result<(), SendError> {
        request_with_backoff("unban_chat_member", &self.policy, || {
            self.bot.unban_chat_member(chat, user)
        })
        .await?;
        Ok(())
    }
}
