use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode,
};
use tracing::debug;

use crate::platform::{Button, ButtonAction, ClassifiedUpdate, Keyboard, Messenger};

// Inbound wire types. Only the fields the bot reads; everything else is ignored.

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

/// Decide what kind of update this is.
///
/// A callback press wins over a message. Presses without an attached message
/// (inline-mode buttons) have no chat to answer into and are ignored.
pub fn classify(update: &Update) -> ClassifiedUpdate {
    if let Some(cq) = &update.callback_query {
        return match &cq.message {
            Some(msg) => ClassifiedUpdate::CallbackPress {
                callback_id: cq.id.clone(),
                chat_id: msg.chat.id,
                user_id: cq.from.id,
                data: cq.data.clone(),
            },
            None => ClassifiedUpdate::Ignored,
        };
    }

    match &update.message {
        Some(msg) => ClassifiedUpdate::TextMessage {
            chat_id: msg.chat.id,
            user_id: msg.from.as_ref().map(|u| u.id),
            text: msg.text.clone(),
        },
        None => ClassifiedUpdate::Ignored,
    }
}

/// `Messenger` backed by the Telegram Bot API
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<()> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(inline_markup(keyboard)?);
        }
        request
            .await
            .with_context(|| format!("sendMessage to chat {chat_id} failed"))?;
        debug!("Sent message to chat {}", chat_id);
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        document_url: &str,
        caption: Option<&str>,
    ) -> Result<()> {
        let url = reqwest::Url::parse(document_url)
            .with_context(|| format!("Invalid document URL: {document_url}"))?;
        let mut request = self
            .bot
            .send_document(ChatId(chat_id), InputFile::url(url))
            .parse_mode(ParseMode::Html);
        if let Some(caption) = caption {
            request = request.caption(caption);
        }
        request
            .await
            .with_context(|| format!("sendDocument to chat {chat_id} failed"))?;
        debug!("Sent document to chat {}", chat_id);
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.bot
            .answer_callback_query(CallbackQueryId(callback_id.to_string()))
            .await
            .with_context(|| format!("answerCallbackQuery {callback_id} failed"))?;
        Ok(())
    }
}

fn inline_markup(keyboard: &Keyboard) -> Result<InlineKeyboardMarkup> {
    let rows = keyboard
        .iter()
        .map(|row| row.iter().map(inline_button).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;
    Ok(InlineKeyboardMarkup::new(rows))
}

fn inline_button(button: &Button) -> Result<InlineKeyboardButton> {
    match &button.action {
        ButtonAction::Callback(token) => Ok(InlineKeyboardButton::callback(
            button.label.clone(),
            token.as_str(),
        )),
        ButtonAction::Url(url) => {
            let url = reqwest::Url::parse(url)
                .with_context(|| format!("Invalid button URL for '{}': {url}", button.label))?;
            Ok(InlineKeyboardButton::url(button.label.clone(), url))
        }
    }
}
