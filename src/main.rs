mod commands;
mod config;
mod error;
mod http;
mod lifecycle;
mod outbound;
mod relay;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{CallbackQuery, ChatId, Message, MessageId, UserId},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::MessagesConfig;
use crate::lifecycle::PendingDecision;
use crate::outbound::{BotOutbound, Outbound, RetryPolicy};
use crate::store::{MongoStore, Store};

/// Everything the handlers and sweeps need, built once at startup and passed
/// by reference. There is no other shared state.
pub struct AppContext {
    pub admin_id: UserId,
    pub store: Arc<dyn Store>,
    pub outbound: Arc<dyn Outbound>,
    pub pending: DashMap<i64, PendingDecision>,
    pub messages: MessagesConfig,
}

impl AppContext {
    pub fn admin_chat(&self) -> ChatId {
        ChatId(self.admin_id.0 as i64)
    }

    pub async fn notify_admin(&self, text: &str) {
        if let Err(e) = self.outbound.send_text(self.admin_chat(), text).await {
            warn!("notifying the admin failed: {e}");
        }
    }
}

async fn route_message(ctx: &AppContext, msg: &Message) {
    if !msg.chat.is_private() {
        return;
    }
    let Some(from) = msg.from.as_ref() else {
        return;
    };
    let text = msg.text().unwrap_or("");

    if text.split_whitespace().next() == Some("/start") {
        lifecycle::request_join(ctx, from.id, &from.full_name()).await;
        return;
    }

    if from.id == ctx.admin_id {
        if text.starts_with('/') {
            let reply = msg.reply_to_message().map(|replied| commands::ReplyInfo {
                message_id: replied.id,
                forwarded_channel: replied.forward_from_chat().map(|chat| {
                    (
                        chat.id.0,
                        chat.title().unwrap_or("(unnamed channel)").to_string(),
                    )
                }),
            });
            commands::handle_admin_command(ctx, text, reply).await;
        } else if let Some(replied) = msg.reply_to_message() {
            relay::relay_admin_reply(ctx, replied.id, msg.text()).await;
        }
        return;
    }

    relay::relay_inbound(ctx, msg.chat.id, msg.id, Utc::now()).await;
}

async fn handle_callback(bot: &Bot, ctx: &AppContext, q: CallbackQuery) {
    let Some(data) = q.data.clone() else {
        let _ = bot.answer_callback_query(q.id).send().await;
        return;
    };

    let prompt: Option<(ChatId, MessageId)> = q.message.as_ref().map(|m| (m.chat().id, m.id()));
    let outcome = lifecycle::decide(ctx, &data, q.from.id, prompt).await;

    if let Err(e) = bot
        .answer_callback_query(q.id)
        .text(outcome.answer_text())
        .send()
        .await
    {
        warn!("answering callback query failed: {e}");
    }
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(
            |ctx: Arc<AppContext>, msg: Message| async move {
                route_message(&ctx, &msg).await;
                Ok(())
            },
        ))
        .branch(Update::filter_callback_query().endpoint(
            |bot: Bot, ctx: Arc<AppContext>, q: CallbackQuery| async move {
                handle_callback(&bot, &ctx, q).await;
                Ok(())
            },
        ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path =
        config::parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = config::load_config(&config_path)?;
    config::validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bot = Bot::new(cfg.bot.token.clone());

    let store = MongoStore::connect(&cfg.store.uri, cfg.store.database()).await?;

    let policy = RetryPolicy {
        max_attempts: cfg.runtime.send_retry_attempts(),
    };
    let ctx = Arc::new(AppContext {
        admin_id: UserId(cfg.bot.admin_id),
        store: Arc::new(store),
        outbound: Arc::new(BotOutbound::new(bot.clone(), policy)),
        pending: DashMap::new(),
        messages: cfg.messages.clone(),
    });

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let port = cfg.http.port;
    let h_http = tokio::spawn(async move {
        http::run_http_server(port).await;
    });

    // subscription reconciliation: warnings first, then removals
    let ctx_sub = ctx.clone();
    let mut shutdown_rx_sub = shutdown_tx.subscribe();
    let sub_secs = cfg.runtime.subscription_sweep_secs();
    let h_sub = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sub_secs));
        loop {
            tokio::select! {
                _ = shutdown_rx_sub.recv() => { break; }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    lifecycle::sweep_warnings(&ctx_sub, now).await;
                    lifecycle::sweep_removals(&ctx_sub, now).await;
                }
            }
        }
    });

    // invite links expire one hour after issuance, used or not
    let ctx_inv = ctx.clone();
    let mut shutdown_rx_inv = shutdown_tx.subscribe();
    let inv_secs = cfg.runtime.invite_sweep_secs();
    let h_inv = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(inv_secs));
        loop {
            tokio::select! {
                _ = shutdown_rx_inv.recv() => { break; }
                _ = ticker.tick() => {
                    lifecycle::sweep_expired_invites(&ctx_inv, Utc::now()).await;
                }
            }
        }
    });

    info!("starting channel-warden (admin id {})", cfg.bot.admin_id);

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![ctx.clone()])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_sub.await;
    let _ = h_inv.await;
    h_http.abort();

    Ok(())
}
