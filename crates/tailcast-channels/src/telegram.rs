use futures::future::BoxFuture;
use tracing::{debug, info};

use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ThreadId,
};
use teloxide::{ApiError, RequestError};

use tailcast_core::types::{Destination, QuestionContent};
use tailcast_core::{Result, TailcastError};

use crate::format::{self, TELEGRAM_MAX_LEN};
use crate::publisher::{EditOutcome, OutboundMessage, Publisher};

/// Telegram publisher over teloxide. Messages are sent in HTML parse mode
/// with transcript text escaped; questions carry an inline keyboard whose
/// buttons only acknowledge (answers happen in the CLI).
pub struct TelegramPublisher {
    bot: Bot,
}

impl TelegramPublisher {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }

    fn route(destination: &Destination) -> Result<(ChatId, Option<ThreadId>)> {
        match destination {
            Destination::Telegram { chat_id, thread_id } => Ok((
                ChatId(*chat_id),
                thread_id.map(|t| ThreadId(MessageId(t as i32))),
            )),
            other => Err(TailcastError::Publish {
                platform: "telegram".into(),
                message: format!("not a telegram destination: {other}"),
            }),
        }
    }

    fn keyboard(question: &QuestionContent) -> Option<InlineKeyboardMarkup> {
        if question.answers.is_some() {
            return None;
        }
        let (labels, overflow) = format::question_buttons(question);
        if labels.is_empty() {
            return None;
        }
        let mut rows: Vec<Vec<InlineKeyboardButton>> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                vec![InlineKeyboardButton::callback(
                    label.clone(),
                    format!("answer:{}:{}", question.tool_use_id, i),
                )]
            })
            .collect();
        if let Some(more) = overflow {
            rows.push(vec![InlineKeyboardButton::callback(
                more,
                format!("overflow:{}", question.tool_use_id),
            )]);
        }
        Some(InlineKeyboardMarkup::new(rows))
    }

    fn publish_error(e: RequestError) -> TailcastError {
        TailcastError::Publish {
            platform: "telegram".into(),
            message: e.to_string(),
        }
    }
}

impl Publisher for TelegramPublisher {
    fn platform(&self) -> &'static str {
        "telegram"
    }

    fn validate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let me = self
                .bot
                .get_me()
                .await
                .map_err(|e| TailcastError::BadCredentials {
                    platform: "telegram".into(),
                    message: e.to_string(),
                })?;
            info!(bot = %me.username(), "Telegram credentials validated");
            Ok(())
        })
    }

    fn send(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<String>> {
        let message = message.clone();
        let destination = destination.clone();

        Box::pin(async move {
            let (chat_id, thread_id) = Self::route(&destination)?;
            let text = format::escape_html(&message.text);
            let chunks = format::split_text(&text, TELEGRAM_MAX_LEN);
            let keyboard = message.question.as_ref().and_then(Self::keyboard);
            let last_index = chunks.len() - 1;

            let mut last_id = None;
            for (i, chunk) in chunks.into_iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                let mut request = self
                    .bot
                    .send_message(chat_id, chunk)
                    .parse_mode(ParseMode::Html);
                if let Some(thread) = thread_id {
                    request = request.message_thread_id(thread);
                }
                if i == last_index {
                    if let Some(kb) = keyboard.clone() {
                        request = request.reply_markup(kb);
                    }
                }
                let sent = request.await.map_err(Self::publish_error)?;
                last_id = Some(sent.id.0.to_string());
            }

            last_id.ok_or_else(|| TailcastError::Publish {
                platform: "telegram".into(),
                message: "empty message".into(),
            })
        })
    }

    fn edit(
        &self,
        destination: &Destination,
        message_id: &str,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<EditOutcome>> {
        let message = message.clone();
        let destination = destination.clone();
        let message_id = message_id.to_string();

        Box::pin(async move {
            let (chat_id, _) = Self::route(&destination)?;
            let id: i32 = message_id.parse().map_err(|_| TailcastError::Publish {
                platform: "telegram".into(),
                message: format!("bad message id: {message_id}"),
            })?;

            let text = format::escape_html(&message.text);
            // Edits cannot grow past one message; keep the head.
            let chunk = format::split_text(&text, TELEGRAM_MAX_LEN).remove(0);

            let mut request = self
                .bot
                .edit_message_text(chat_id, MessageId(id), chunk)
                .parse_mode(ParseMode::Html);
            if !message.remove_keyboard {
                if let Some(kb) = message.question.as_ref().and_then(Self::keyboard) {
                    request = request.reply_markup(kb);
                }
            }

            match request.await {
                Ok(_) => Ok(EditOutcome::Edited),
                Err(RequestError::Api(ApiError::MessageNotModified)) => {
                    debug!(message_id = id, "Telegram edit: not modified");
                    Ok(EditOutcome::Edited)
                }
                Err(RequestError::Api(ApiError::MessageToEditNotFound)) => {
                    debug!(message_id = id, "Telegram edit: message gone");
                    Ok(EditOutcome::NotFound)
                }
                Err(e) => Err(Self::publish_error(e)),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
