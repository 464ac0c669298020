use chrono::{DateTime, Utc};
use teloxide::types::{ChatId, MessageId};
use tracing::{debug, info, warn};

use crate::outbound::Outbound;
use crate::store::{RelayLinkRecord, Store, PROCESSED_RETENTION};
use crate::AppContext;

fn marker_cutoff(now: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(now - chrono::Duration::seconds(PROCESSED_RETENTION.as_secs() as i64))
}

/// Forwards an end-user private message to the admin exactly once per
/// message id within the retention window, and records the mapping needed to
/// route the admin's eventual reply back.
pub async fn relay_inbound(ctx: &AppContext, sender: ChatId, message_id: MessageId, now: DateTime<Utc>) {
    match ctx.store.is_processed(message_id.0, marker_cutoff(now)).await {
        Ok(true) => {
            debug!("message {} already processed, dropping duplicate", message_id.0);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!("processed-marker lookup failed: {e:#}");
            return;
        }
    }

    let forwarded = match ctx
        .outbound
        .forward_message(ctx.admin_chat(), sender, message_id)
        .await
    {
        Ok(forwarded) => forwarded,
        Err(e) => {
            // no marker written: a platform redelivery gets another chance
            warn!("forwarding message {} from {sender} failed: {e}", message_id.0);
            return;
        }
    };

    if let Err(e) = ctx
        .store
        .insert_relay_link(&RelayLinkRecord {
            forwarded_message_id: forwarded.0,
            user_id: sender.0,
        })
        .await
    {
        warn!("recording the relay link failed: {e:#}");
    }
    if let Err(e) = ctx
        .store
        .mark_processed(message_id.0, bson::DateTime::from_chrono(now))
        .await
    {
        warn!("recording the processed marker failed: {e:#}");
    }

    if let Err(e) = ctx
        .outbound
        .send_text(sender, ctx.messages.forwarded_ack())
        .await
    {
        debug!("forward acknowledgement to {sender} failed: {e}");
    }
    info!("forwarded message {} from {sender} to the admin", message_id.0);
}

/// Routes an admin reply back to the user the replied-to forward came from.
pub async fn relay_admin_reply(ctx: &AppContext, replied_to: MessageId, text: Option<&str>) {
    let target = match ctx.store.relay_target(replied_to.0).await {
        Ok(target) => target,
        Err(e) => {
            warn!("relay-link lookup failed: {e:#}");
            return;
        }
    };
    let Some(user_id) = target else {
        ctx.notify_admin("No linked user found for this message.").await;
        return;
    };
    let Some(text) = text else {
        ctx.notify_admin("Only text replies can be delivered. Please reply with text.")
            .await;
        return;
    };

    match ctx.outbound.send_text(ChatId(user_id), text).await {
        Ok(_) => ctx.notify_admin("Reply sent to user.").await,
        Err(e) if e.is_blocked() => ctx.notify_admin("User has blocked the bot.").await,
        Err(e) => {
            warn!("delivering the reply to {user_id} failed: {e}");
            ctx.notify_admin("Delivering the reply failed.").await;
        }
    }
}

/// Copies the template message to every tracked user. Per-user failures are
/// swallowed; one report goes to the admin after the full pass.
pub async fn broadcast(ctx: &AppContext, from: ChatId, template: MessageId) {
    let users = match ctx.store.all_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!("broadcast: listing users failed: {e:#}");
            ctx.notify_admin("Broadcast failed: could not read the user list.").await;
            return;
        }
    };

    let total = users.len();
    let mut delivered = 0usize;
    for user in users {
        match ctx
            .outbound
            .copy_message(ChatId(user.user_id), from, template)
            .await
        {
            Ok(()) => delivered += 1,
            Err(e) => debug!("broadcast to {} failed: {e}", user.user_id),
        }
    }
    ctx.notify_admin(&format!("Broadcast sent to {delivered} of {total} users."))
        .await;
}
