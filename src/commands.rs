use chrono::Utc;
use teloxide::types::MessageId;
use tracing::{debug, warn};

use crate::store::{ChannelRecord, Store};
use crate::{lifecycle, relay, AppContext};

/// What the admin's message replied to, when it replied to anything.
#[derive(Debug, Clone)]
pub struct ReplyInfo {
    pub message_id: MessageId,
    /// (channel id, channel title) when the replied-to message was forwarded
    /// from a channel.
    pub forwarded_channel: Option<(i64, String)>,
}

pub async fn handle_admin_command(ctx: &AppContext, text: &str, reply: Option<ReplyInfo>) {
    let trimmed = text.trim();
    let command = trimmed.split_whitespace().next().unwrap_or("");
    match command {
        "/addchannel" => add_channel(ctx, reply).await,
        "/removechannel" => remove_channel(ctx, reply).await,
        "/listchannels" => list_channels(ctx).await,
        "/setremoval" => set_removal(ctx, trimmed).await,
        "/broadcast" => broadcast(ctx, reply).await,
        other => debug!("ignoring unknown admin command {other:?}"),
    }
}

async fn add_channel(ctx: &AppContext, reply: Option<ReplyInfo>) {
    let Some((channel_id, channel_name)) = reply.and_then(|r| r.forwarded_channel) else {
        ctx.notify_admin("Please reply to a message forwarded from the channel you want to add.")
            .await;
        return;
    };

    match ctx
        .store
        .add_channel(&ChannelRecord {
            channel_id,
            channel_name: channel_name.clone(),
        })
        .await
    {
        Ok(true) => {
            ctx.notify_admin(&format!("Channel '{channel_name}' added successfully."))
                .await
        }
        Ok(false) => ctx.notify_admin("Channel already added.").await,
        Err(e) => {
            warn!("adding channel {channel_id} failed: {e:#}");
            ctx.notify_admin("Adding the channel failed.").await;
        }
    }
}

async fn remove_channel(ctx: &AppContext, reply: Option<ReplyInfo>) {
    let Some((channel_id, _)) = reply.and_then(|r| r.forwarded_channel) else {
        ctx.notify_admin("Please reply to a message forwarded from the channel you want to remove.")
            .await;
        return;
    };

    match ctx.store.remove_channel(channel_id).await {
        Ok(true) => ctx.notify_admin("Channel removed successfully.").await,
        Ok(false) => ctx.notify_admin("Channel not found.").await,
        Err(e) => {
            warn!("removing channel {channel_id} failed: {e:#}");
            ctx.notify_admin("Removing the channel failed.").await;
        }
    }
}

async fn list_channels(ctx: &AppContext) {
    match ctx.store.list_channels().await {
        Ok(channels) if channels.is_empty() => ctx.notify_admin("No channels added.").await,
        Ok(channels) => {
            let listing = channels
                .iter()
                .map(|c| format!("{} (ID: {})", c.channel_name, c.channel_id))
                .collect::<Vec<_>>()
                .join("\n");
            ctx.notify_admin(&format!("Added channels:\n{listing}")).await;
        }
        Err(e) => {
            warn!("listing channels failed: {e:#}");
            ctx.notify_admin("Listing the channels failed.").await;
        }
    }
}

fn parse_set_removal(text: &str) -> Option<(i64, i64)> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let user_id = parts[1].parse::<i64>().ok()?;
    let days = parts[2].parse::<i64>().ok()?;
    Some((user_id, days))
}

async fn set_removal(ctx: &AppContext, text: &str) {
    let Some((user_id, days)) = parse_set_removal(text) else {
        ctx.notify_admin("Usage: /setremoval <user_id> <days>").await;
        return;
    };

    match lifecycle::set_removal(ctx, user_id, days, Utc::now()).await {
        Ok(date) => {
            ctx.notify_admin(&format!("Removal date set for user {user_id} on {date}."))
                .await
        }
        Err(e) => {
            warn!("setting the removal date for {user_id} failed: {e:#}");
            ctx.notify_admin("Setting the removal date failed.").await;
        }
    }
}

async fn broadcast(ctx: &AppContext, reply: Option<ReplyInfo>) {
    let Some(reply) = reply else {
        ctx.notify_admin("Please reply to a message to broadcast it.").await;
        return;
    };
    relay::broadcast(ctx, ctx.admin_chat(), reply.message_id).await;
}
