use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId};
use tracing::{info, warn};
use url::Url;

use crate::config::format_template;
use crate::outbound::Outbound;
use crate::store::{InviteRecord, Store, UserRecord};
use crate::AppContext;

const DECISION_PREFIX: &str = "d";

/// An outstanding accept/reject prompt. Lives only in memory: a restart
/// clears the table and stale buttons answer "already handled or expired".
#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
    pub prompt_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    fn tag(self) -> &'static str {
        match self {
            Verdict::Accept => "a",
            Verdict::Reject => "r",
        }
    }
}

pub fn decision_token(verdict: Verdict, user: UserId) -> String {
    format!("{DECISION_PREFIX}:{}:{}", verdict.tag(), user.0)
}

pub fn parse_decision_token(data: &str) -> Option<(Verdict, UserId)> {
    let parts: Vec<&str> = data.split(':').collect();
    if parts.len() != 3 || parts[0] != DECISION_PREFIX {
        return None;
    }
    let verdict = match parts[1] {
        "a" => Verdict::Accept,
        "r" => Verdict::Reject,
        _ => return None,
    };
    let user_id = parts[2].parse::<u64>().ok()?;
    Some((verdict, UserId(user_id)))
}

fn decision_keyboard(user: UserId) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "Accept User",
            decision_token(Verdict::Accept, user),
        )],
        vec![InlineKeyboardButton::callback(
            "Reject User",
            decision_token(Verdict::Reject, user),
        )],
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Accepted,
    Rejected,
    AlreadyHandled,
    NotAllowed,
    Malformed,
}

impl DecisionOutcome {
    pub fn answer_text(self) -> &'static str {
        match self {
            DecisionOutcome::Accepted => "User accepted.",
            DecisionOutcome::Rejected => "User rejected.",
            DecisionOutcome::AlreadyHandled => "This request was already handled or has expired.",
            DecisionOutcome::NotAllowed => "Only the admin can decide on join requests.",
            DecisionOutcome::Malformed => "Malformed decision data.",
        }
    }
}

pub async fn request_join(ctx: &AppContext, user: UserId, display_name: &str) {
    let user_chat = ChatId(user.0 as i64);
    let prompt = format!(
        "New user started the bot:\nID: {}\nName: {}",
        user.0, display_name
    );

    match ctx
        .outbound
        .send_keyboard(ctx.admin_chat(), &prompt, decision_keyboard(user))
        .await
    {
        Ok(prompt_id) => {
            ctx.pending.insert(
                user.0 as i64,
                PendingDecision {
                    display_name: display_name.to_string(),
                    requested_at: Utc::now(),
                    prompt_id,
                },
            );
            if let Err(e) = ctx
                .outbound
                .send_text(user_chat, ctx.messages.request_received())
                .await
            {
                warn!("join acknowledgement to {user} failed: {e}");
            }
            info!("join request from {user} forwarded to the admin");
        }
        Err(e) => {
            // no false acknowledgement when the prompt never reached the admin
            warn!("could not deliver join request from {user} to the admin: {e}");
            let _ = ctx
                .outbound
                .send_text(
                    user_chat,
                    "The admin cannot be reached right now. Please try again later.",
                )
                .await;
        }
    }
}

pub async fn decide(
    ctx: &AppContext,
    data: &str,
    from: UserId,
    prompt: Option<(ChatId, MessageId)>,
) -> DecisionOutcome {
    let Some((verdict, user)) = parse_decision_token(data) else {
        return DecisionOutcome::Malformed;
    };
    if from != ctx.admin_id {
        return DecisionOutcome::NotAllowed;
    }
    // the first press consumes the entry; a double-click lands here
    let Some((_, pending)) = ctx.pending.remove(&(user.0 as i64)) else {
        return DecisionOutcome::AlreadyHandled;
    };

    let display_name = match ctx.outbound.display_name(user).await {
        Some(name) => name,
        None if !pending.display_name.is_empty() => pending.display_name.clone(),
        None => "Unknown User".to_string(),
    };

    let (prompt_chat, prompt_id) = prompt.unwrap_or((ctx.admin_chat(), pending.prompt_id));
    if let Err(e) = ctx.outbound.delete_message(prompt_chat, prompt_id).await {
        warn!("could not delete the decision prompt for {user}: {e}");
    }

    let waited = Utc::now() - pending.requested_at;
    info!(
        "admin decision for {user} arrived after {}s",
        waited.num_seconds()
    );

    match verdict {
        Verdict::Accept => {
            accept(ctx, user, &display_name).await;
            DecisionOutcome::Accepted
        }
        Verdict::Reject => {
            reject(ctx, user, &display_name).await;
            DecisionOutcome::Rejected
        }
    }
}

/// Issues one single-use invite link per known channel and delivers them to
/// the user in a single message. Channels are handled independently: a
/// failure on one is logged and skipped, links already issued still count.
async fn accept(ctx: &AppContext, user: UserId, display_name: &str) {
    let channels = match ctx.store.list_channels().await {
        Ok(channels) => channels,
        Err(e) => {
            warn!("accept for {user}: listing channels failed: {e:#}");
            ctx.notify_admin(&format!(
                "Accepting user {} failed: could not read the channel list.",
                user.0
            ))
            .await;
            return;
        }
    };

    let now = bson::DateTime::now();
    let mut issued: Vec<(String, String)> = Vec::new();
    for channel in &channels {
        let chat = ChatId(channel.channel_id);

        // one active invite per (channel, user): retire stale rows first
        match ctx.store.invites_for(channel.channel_id, user.0 as i64).await {
            Ok(stale) => {
                for invite in stale {
                    if let Err(e) = ctx
                        .outbound
                        .revoke_invite_link(chat, &invite.invite_link)
                        .await
                    {
                        warn!(
                            "revoking stale invite for {user} in channel {}: {e}",
                            channel.channel_id
                        );
                    }
                    if let Err(e) = ctx.store.delete_invite(&invite.invite_link).await {
                        warn!("deleting stale invite row: {e:#}");
                    }
                }
            }
            Err(e) => warn!(
                "stale-invite lookup for channel {} failed: {e:#}",
                channel.channel_id
            ),
        }

        let link = match ctx.outbound.create_invite_link(chat).await {
            Ok(link) => link,
            Err(e) => {
                warn!(
                    "creating an invite link for channel {} failed: {e}",
                    channel.channel_id
                );
                continue;
            }
        };
        if let Err(e) = ctx
            .store
            .insert_invite(&InviteRecord {
                invite_link: link.clone(),
                channel_id: channel.channel_id,
                user_id: user.0 as i64,
                created_at: now,
            })
            .await
        {
            warn!(
                "recording the invite for channel {} failed: {e:#}",
                channel.channel_id
            );
        }
        issued.push((channel.channel_name.clone(), link));
    }

    let mut rows = Vec::new();
    for (name, link) in &issued {
        match Url::parse(link) {
            Ok(link) => rows.push(vec![InlineKeyboardButton::url(name.clone(), link)]),
            Err(e) => warn!("invite link for '{name}' is not a valid URL: {e}"),
        }
    }

    match ctx
        .outbound
        .send_keyboard(
            ChatId(user.0 as i64),
            ctx.messages.accepted(),
            InlineKeyboardMarkup::new(rows),
        )
        .await
    {
        Ok(_) => {
            info!("accepted {user}: {} invite link(s) delivered", issued.len());
            ctx.notify_admin(&format!(
                "User {} ({display_name}) has received the acceptance message.",
                user.0
            ))
            .await;
        }
        Err(e) if e.is_blocked() => {
            ctx.notify_admin(&format!(
                "User {} ({display_name}) has blocked the bot. Cannot send invite links.",
                user.0
            ))
            .await;
        }
        Err(e) => {
            warn!("acceptance message to {user} failed: {e}");
            ctx.notify_admin(&format!(
                "Delivering invite links to user {} failed.",
                user.0
            ))
            .await;
        }
    }
}

async fn reject(ctx: &AppContext, user: UserId, display_name: &str) {
    let keyboard = match Url::parse(ctx.messages.contact_url()) {
        Ok(contact) => InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(
            "Contact admin".to_string(),
            contact,
        )]]),
        Err(_) => InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new()),
    };

    match ctx
        .outbound
        .send_keyboard(ChatId(user.0 as i64), ctx.messages.rejected(), keyboard)
        .await
    {
        Ok(_) => {
            ctx.notify_admin(&format!(
                "User {} ({display_name}) has received the rejection message.",
                user.0
            ))
            .await;
        }
        Err(e) if e.is_blocked() => {
            ctx.notify_admin(&format!(
                "User {} ({display_name}) has blocked the bot. Cannot send rejection message.",
                user.0
            ))
            .await;
        }
        Err(e) => warn!("rejection message to {user} failed: {e}"),
    }
}

/// Upserts the subscription window for a user and notifies them of the
/// local wall-clock removal instant. Returns the formatted date for the
/// admin confirmation.
pub async fn set_removal(
    ctx: &AppContext,
    user_id: i64,
    days: i64,
    now: DateTime<Utc>,
) -> Result<String> {
    let removal = now + chrono::Duration::days(days);
    let warn_at = removal - chrono::Duration::hours(24);

    let display_name = ctx.outbound.display_name(UserId(user_id as u64)).await;
    ctx.store
        .upsert_user(&UserRecord {
            user_id,
            display_name,
            removal_date: bson::DateTime::from_chrono(removal),
            warn_date: bson::DateTime::from_chrono(warn_at),
            warned: None,
        })
        .await?;

    let formatted = removal
        .with_timezone(&Local)
        .format("%Y-%m-%d at %H:%M:%S")
        .to_string();
    let mut vars = HashMap::new();
    vars.insert("date", formatted.clone());
    let text = format_template(ctx.messages.removal_scheduled(), &vars);

    match ctx.outbound.send_text(ChatId(user_id), &text).await {
        Ok(_) => {}
        Err(e) if e.is_blocked() => {
            ctx.notify_admin(&format!(
                "User {user_id} has blocked the bot. Cannot send removal date notification.",
            ))
            .await;
        }
        Err(e) => warn!("removal date notification to {user_id} failed: {e}"),
    }

    Ok(formatted)
}

/// One warning per user, one attempt: the flag flips even when the send
/// failed, so a blocked user does not get re-tried every tick.
pub async fn sweep_warnings(ctx: &AppContext, now: DateTime<Utc>) {
    let due = match ctx
        .store
        .users_to_warn(bson::DateTime::from_chrono(now))
        .await
    {
        Ok(due) => due,
        Err(e) => {
            warn!("warning sweep: query failed: {e:#}");
            return;
        }
    };

    for user in due {
        match ctx
            .outbound
            .send_text(ChatId(user.user_id), ctx.messages.warning())
            .await
        {
            Ok(_) => info!("warned user {} ahead of removal", user.user_id),
            Err(e) if e.is_blocked() => {
                ctx.notify_admin(&format!(
                    "User {} has blocked the bot. Cannot send warning.",
                    user.user_id
                ))
                .await;
            }
            Err(e) => warn!("warning to {} failed: {e}", user.user_id),
        }
        if let Err(e) = ctx.store.mark_warned(user.user_id).await {
            warn!("marking {} as warned failed: {e:#}", user.user_id);
        }
    }
}

/// Expels every user whose removal date has passed: per channel, revoke and
/// delete their invites, then ban and immediately unban (the platform has no
/// kick primitive for channels). Channel failures are logged and skipped;
/// the user record is deleted regardless, so removal is never retried.
pub async fn sweep_removals(ctx: &AppContext, now: DateTime<Utc>) {
    let due = match ctx
        .store
        .users_to_remove(bson::DateTime::from_chrono(now))
        .await
    {
        Ok(due) => due,
        Err(e) => {
            warn!("removal sweep: query failed: {e:#}");
            return;
        }
    };

    for user in due {
        let channels = match ctx.store.list_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(
                    "removal sweep: listing channels failed, user {} retried next tick: {e:#}",
                    user.user_id
                );
                continue;
            }
        };

        let member = UserId(user.user_id as u64);
        for channel in &channels {
            let chat = ChatId(channel.channel_id);
            match ctx.store.invites_for(channel.channel_id, user.user_id).await {
                Ok(invites) => {
                    for invite in invites {
                        if let Err(e) = ctx
                            .outbound
                            .revoke_invite_link(chat, &invite.invite_link)
                            .await
                        {
                            warn!(
                                "revoking invite for {} in channel {}: {e}",
                                user.user_id, channel.channel_id
                            );
                        }
                        if let Err(e) = ctx.store.delete_invite(&invite.invite_link).await {
                            warn!("deleting invite row: {e:#}");
                        }
                    }
                }
                Err(e) => warn!(
                    "invite lookup for channel {} failed: {e:#}",
                    channel.channel_id
                ),
            }

            if let Err(e) = ctx.outbound.ban_member(chat, member).await {
                warn!(
                    "banning {} in channel {} failed: {e}",
                    user.user_id, channel.channel_id
                );
                continue;
            }
            if let Err(e) = ctx.outbound.unban_member(chat, member).await {
                warn!(
                    "unbanning {} in channel {} failed: {e}",
                    user.user_id, channel.channel_id
                );
            }
        }

        match ctx
            .outbound
            .send_text(ChatId(user.user_id), ctx.messages.removed())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_blocked() => {
                ctx.notify_admin(&format!(
                    "User {} has blocked the bot. Cannot send removal notification.",
                    user.user_id
                ))
                .await;
            }
            Err(e) => warn!("removal notice to {} failed: {e}", user.user_id),
        }

        if let Err(e) = ctx.store.delete_user(user.user_id).await {
            warn!("deleting user record {} failed: {e:#}", user.user_id);
        }
        info!(
            "removed user {} across {} channel(s)",
            user.user_id,
            channels.len()
        );
    }
}

/// Revokes invite links older than one hour, whether or not they were used.
/// The row is deleted even when the platform revocation fails, bounding
/// store growth; deleting an already-removed row is a no-op.
pub async fn sweep_expired_invites(ctx: &AppContext, now: DateTime<Utc>) {
    let cutoff = bson::DateTime::from_chrono(now - chrono::Duration::hours(1));
    let expired = match ctx.store.expired_invites(cutoff).await {
        Ok(expired) => expired,
        Err(e) => {
            warn!("invite sweep: query failed: {e:#}");
            return;
        }
    };

    for invite in expired {
        if let Err(e) = ctx
            .outbound
            .revoke_invite_link(ChatId(invite.channel_id), &invite.invite_link)
            .await
        {
            warn!("revoking expired invite {}: {e}", invite.invite_link);
        }
        if let Err(e) = ctx.store.delete_invite(&invite.invite_link).await {
            warn!("deleting expired invite row: {e:#}");
        } else {
            info!(
                "revoked expired invite link for channel {}",
                invite.channel_id
            );
        }
    }
}
