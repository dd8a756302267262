use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::{error, info, warn};

use crate::core::events::{EventBus, SignalType};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::notify::NotificationSink;
use crate::core::store::Priority;

const HELP_TEXT: &str = "Commands:\n\
    /approve <proposal-id>\n\
    /reject <proposal-id> [reason]\n\
    /retry <intent-id>\n\
    /cancel <intent-id>";

/// A chat command that maps onto a runtime user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Approve(String),
    Reject { id: String, reason: Option<String> },
    Retry(String),
    Cancel(String),
    Help,
}

impl UserCommand {
    /// Parse `/verb <id> [rest]`. Bot-name suffixes (`/approve@bot`) are accepted.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().splitn(3, char::is_whitespace);
        let verb = parts.next()?.strip_prefix('/')?;
        let verb = verb.split('@').next().unwrap_or(verb);
        let id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (verb, id) {
            ("help" | "start", _) => Some(UserCommand::Help),
            ("approve", Some(id)) => Some(UserCommand::Approve(id.to_string())),
            ("reject", Some(id)) => Some(UserCommand::Reject {
                id: id.to_string(),
                reason: rest.map(str::to_string),
            }),
            ("retry", Some(id)) => Some(UserCommand::Retry(id.to_string())),
            ("cancel", Some(id)) => Some(UserCommand::Cancel(id.to_string())),
            _ => None,
        }
    }

    /// Signal payload consumed by the runtime. `None` for local-only commands.
    pub fn signal_data(&self) -> Option<serde_json::Value> {
        match self {
            UserCommand::Approve(id) => Some(json!({"action": "approve", "id": id})),
            UserCommand::Reject { id, reason } => {
                Some(json!({"action": "reject", "id": id, "reason": reason}))
            }
            UserCommand::Retry(id) => Some(json!({"action": "retry", "id": id})),
            UserCommand::Cancel(id) => Some(json!({"action": "cancel", "id": id})),
            UserCommand::Help => None,
        }
    }
}

/// Sends alerts to one configured chat.
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send_message(&self, text: &str) -> Result<()> {
        self.bot.send_message(self.chat_id, text).await?;
        Ok(())
    }
}

/// Turns chat commands from the owner's chat into high-priority signals.
pub struct TelegramInterface {
    token: String,
    chat_id: Option<i64>,
    bus: Arc<EventBus>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TelegramInterface {
    pub fn new(token: String, chat_id: Option<i64>, bus: Arc<EventBus>) -> Self {
        Self {
            token,
            chat_id,
            bus,
            task: None,
        }
    }

    async fn start_bot(&mut self) -> Result<()> {
        let bot_client = Bot::new(&self.token);

        let commands = vec![
            teloxide::types::BotCommand::new("approve", "Advance a proposal one stage"),
            teloxide::types::BotCommand::new("reject", "Reject a proposal"),
            teloxide::types::BotCommand::new("retry", "Retry a failed intent"),
            teloxide::types::BotCommand::new("cancel", "Cancel a pending intent"),
            teloxide::types::BotCommand::new("help", "Show all available commands"),
        ];
        if let Err(e) = bot_client.set_my_commands(commands).await {
            error!("Failed to set telegram bot commands: {}", e);
        }

        let allowed_chat = self.chat_id;
        let bus = self.bus.clone();
        self.task = Some(tokio::spawn(async move {
            teloxide::repl(bot_client, move |bot: Bot, msg: Message| {
                let bus = bus.clone();
                async move {
                    let chat_id = msg.chat.id.0;
                    if allowed_chat.is_some_and(|allowed| allowed != chat_id) {
                        warn!(chat_id, "Ignoring message from unpaired chat");
                        return Ok(());
                    }
                    let Some(text) = msg.text() else {
                        return Ok(());
                    };
                    let Some(command) = UserCommand::parse(text) else {
                        let _ = bot.send_message(msg.chat.id, HELP_TEXT).await;
                        return Ok(());
                    };
                    match command.signal_data() {
                        Some(data) => {
                            info!(chat_id, ?command, "Telegram command received");
                            let source = format!("telegram:{}", chat_id);
                            bus.signal(SignalType::Telegram, &source, data, Priority::High);
                            let _ = bot.send_message(msg.chat.id, "👍 Queued").await;
                        }
                        None => {
                            let _ = bot.send_message(msg.chat.id, HELP_TEXT).await;
                        }
                    }
                    Ok(())
                }
            })
            .await;
        }));
        Ok(())
    }
}

#[async_trait]
impl LifecycleComponent for TelegramInterface {
    async fn on_init(&mut self) -> Result<()> {
        info!("Telegram interface initializing...");
        if self.chat_id.is_none() {
            warn!("No telegram chat_id configured, accepting commands from any chat");
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        info!("Telegram interface starting...");
        if let Err(e) = self.start_bot().await {
            error!("Telegram bot crashed: {}", e);
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Telegram interface shutting down...");
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}
