use std::sync::Arc;

use anyhow::Result;
use teloxide::utils::html;
use tracing::{debug, info, warn};

use crate::platform::{Button, ClassifiedUpdate, Keyboard, Messenger};
use crate::subscription::SubscriptionOracle;

const START_COMMAND: &str = "/start";

/// Conversation steps carried as inline-button callback data.
///
/// The token is the whole state: nothing is remembered between updates, so a
/// redelivered press replays the same response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackToken {
    ClaimGuide,
    CheckSubscription,
    SendGuide,
}

impl CallbackToken {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaimGuide => "start_get_guide",
            Self::CheckSubscription => "check_sub",
            Self::SendGuide => "send_guide",
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "start_get_guide" => Some(Self::ClaimGuide),
            "check_sub" => Some(Self::CheckSubscription),
            "send_guide" => Some(Self::SendGuide),
            _ => None,
        }
    }
}

/// Per-deployment values the conversation interpolates
#[derive(Debug, Clone)]
pub struct GuideContent {
    /// Bare channel name, no '@'
    pub channel_name: String,
    pub channel_link: String,
    pub document_url: String,
    pub pick_tour_url: String,
}

/// Count of outbound calls made for one update
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn track(&mut self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(e) => {
                self.failed += 1;
                warn!("Failed to {}: {:#}", what, e);
            }
        }
    }
}

/// Stateless handler for classified updates.
///
/// Never fails: every outbound error is logged and counted in the report.
pub struct Dispatcher {
    messenger: Arc<dyn Messenger>,
    oracle: Arc<dyn SubscriptionOracle>,
    content: GuideContent,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        oracle: Arc<dyn SubscriptionOracle>,
        content: GuideContent,
    ) -> Self {
        Self {
            messenger,
            oracle,
            content,
        }
    }

    pub async fn dispatch(&self, update: ClassifiedUpdate) -> DispatchReport {
        let mut report = DispatchReport::default();

        match update {
            ClassifiedUpdate::TextMessage {
                chat_id,
                user_id,
                text,
            } => {
                let text = text.unwrap_or_default();
                info!("Message from user {:?} in chat {}: {}", user_id, chat_id, text);
                self.handle_text(chat_id, &text, &mut report).await;
            }
            ClassifiedUpdate::CallbackPress {
                callback_id,
                chat_id,
                user_id,
                data,
            } => {
                let result = self.messenger.answer_callback(&callback_id).await;
                report.track("answer callback", result);

                match data.as_deref().and_then(CallbackToken::parse) {
                    Some(token) => {
                        info!("Callback {:?} from user {} in chat {}", token, user_id, chat_id);
                        self.handle_callback(token, chat_id, user_id, &mut report)
                            .await;
                    }
                    None => debug!("Ignoring unknown callback data {:?}", data),
                }
            }
            ClassifiedUpdate::Ignored => debug!("Nothing to dispatch"),
        }

        report
    }

    async fn handle_text(&self, chat_id: i64, text: &str, report: &mut DispatchReport) {
        if text.starts_with(START_COMMAND) {
            let keyboard = vec![vec![Button::callback(
                "Забрать гайд",
                CallbackToken::ClaimGuide,
            )]];
            self.send(report, chat_id, &self.welcome_text(), Some(&keyboard))
                .await;
            return;
        }

        // Messages go out as HTML; user text must not be parsed as markup
        let echo = format!("Вы написали: {}", html::escape(text));
        self.send(report, chat_id, &echo, None).await;
    }

    async fn handle_callback(
        &self,
        token: CallbackToken,
        chat_id: i64,
        user_id: u64,
        report: &mut DispatchReport,
    ) {
        match token {
            CallbackToken::ClaimGuide => {
                let text = format!(
                    "Отлично! 🎁\n\
                     Чтобы получить гайд, подпишись на канал Саши:\n\
                     👉 {}\n\
                     После подписки нажми кнопку ниже.",
                    self.content.channel_link
                );
                self.send(report, chat_id, &text, Some(&self.subscribe_keyboard()))
                    .await;
            }
            CallbackToken::CheckSubscription => {
                self.send(report, chat_id, "Проверяю подписку… секунду ⏳", None)
                    .await;

                if self.is_subscribed(user_id).await {
                    let keyboard = vec![vec![Button::callback(
                        "Получить гайд",
                        CallbackToken::SendGuide,
                    )]];
                    self.send(
                        report,
                        chat_id,
                        "Супер! ✅\nПодписка есть — держи обещанный подарок 🎁",
                        Some(&keyboard),
                    )
                    .await;
                } else {
                    self.send(
                        report,
                        chat_id,
                        "Похоже, подписка не найдена 😕\n\
                         Подпишись на канал и нажми «Я подписан».",
                        Some(&self.subscribe_keyboard()),
                    )
                    .await;
                }
            }
            CallbackToken::SendGuide => {
                let result = self
                    .messenger
                    .send_document(
                        chat_id,
                        &self.content.document_url,
                        Some("Твой гайд с ТОП-20 отелями. Приятного планирования ✈️"),
                    )
                    .await;
                report.track("send guide document", result);

                let keyboard = vec![vec![Button::url(
                    "Саша, подбери тур",
                    self.content.pick_tour_url.as_str(),
                )]];
                self.send(
                    report,
                    chat_id,
                    "А вот и гайд, пользуйся на здоровье 😍\n\n\
                     Если захочешь больше — жми кнопку: «Саша, подбери тур», \
                     и Саша соберёт варианты лично под твой запрос!",
                    Some(&keyboard),
                )
                .await;
            }
        }
    }

    /// A failed lookup counts as "not subscribed".
    async fn is_subscribed(&self, user_id: u64) -> bool {
        match self.oracle.lookup(user_id).await {
            Ok(status) => {
                debug!("User {} membership: {:?}", user_id, status);
                status.is_subscribed()
            }
            Err(e) => {
                warn!("Membership lookup for user {} failed: {:#}", user_id, e);
                false
            }
        }
    }

    async fn send(
        &self,
        report: &mut DispatchReport,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) {
        let result = self.messenger.send_text(chat_id, text, keyboard).await;
        report.track("send message", result);
    }

    fn welcome_text(&self) -> String {
        format!(
            "Привет! 🤍\n\
             Я Лютик, маленькая собачка и главный помощник Саши Комлевой из @{}.\n\
             Хочешь получить Гайд с ТОП-20 проверенными отелями — без рекламы?\n\
             Жми ниже и забирай подарок 👇",
            self.content.channel_name
        )
    }

    fn subscribe_keyboard(&self) -> Keyboard {
        vec![
            vec![Button::url("Подписаться", self.content.channel_link.as_str())],
            vec![Button::callback("Я подписан", CallbackToken::CheckSubscription)],
        ]
    }
}
