pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::bot::CallbackToken;

/// An inbound update reduced to what the dispatcher routes on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedUpdate {
    /// A plain message. `text` is passed through exactly as received.
    TextMessage {
        chat_id: i64,
        user_id: Option<u64>,
        text: Option<String>,
    },
    /// An inline button press. Ids come from the message the button was attached to.
    CallbackPress {
        callback_id: String,
        chat_id: i64,
        user_id: u64,
        data: Option<String>,
    },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    Callback(CallbackToken),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn callback(label: &str, token: CallbackToken) -> Self {
        Self {
            label: label.to_string(),
            action: ButtonAction::Callback(token),
        }
    }

    pub fn url(label: &str, url: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// Inline keyboard layout, one `Vec` per row
pub type Keyboard = Vec<Vec<Button>>;

/// Outbound side of the chat platform
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>)
        -> Result<()>;

    /// Send a document by URL; the platform fetches it.
    async fn send_document(
        &self,
        chat_id: i64,
        document_url: &str,
        caption: Option<&str>,
    ) -> Result<()>;

    /// Confirm a button press so the client stops showing a spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}
