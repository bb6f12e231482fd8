use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

use crate::traits::Dispatcher;

/// Send-only Telegram delivery. Inbound chat handling lives outside this
/// crate; the daemon only ever pushes notifications.
pub struct TelegramDispatcher {
    bot: Bot,
}

impl TelegramDispatcher {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
        }
    }
}

#[async_trait]
impl Dispatcher for TelegramDispatcher {
    async fn send_text(&self, chat_id: &str, body: &str) -> bool {
        let id: i64 = match chat_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(chat_id, "Undeliverable: chat id is not numeric");
                return false;
            }
        };

        match self.bot.send_message(ChatId(id), body.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(chat_id, "Telegram send failed: {}", e);
                false
            }
        }
    }
}
