use futures::future::BoxFuture;
use tracing::warn;

use tailcast_core::types::{Destination, QuestionContent};
use tailcast_core::Result;

/// Platform-neutral message body. Publishers render it into Markdown plus an
/// inline keyboard (Telegram) or Block Kit sections plus actions (Slack).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub text: String,
    /// Present when the message carries answer buttons.
    pub question: Option<QuestionContent>,
    /// Strip interactive elements on edit (the question was answered).
    pub remove_keyboard: bool,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            question: None,
            remove_keyboard: false,
        }
    }

    pub fn question(text: impl Into<String>, question: QuestionContent) -> Self {
        Self {
            text: text.into(),
            question: Some(question),
            remove_keyboard: false,
        }
    }
}

/// Result of an edit. "Not modified" collapses into `Edited`; a missing
/// message is reported so the tracker can forget its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    NotFound,
}

/// Semantic messaging operations the core invokes. The only place external
/// SDKs touch the pipeline, so everything above stays testable offline.
pub trait Publisher: Send + Sync + 'static {
    /// Platform name ("telegram", "slack").
    fn platform(&self) -> &'static str;

    /// Check credentials against the platform identity endpoint.
    fn validate(&self) -> BoxFuture<'_, Result<()>>;

    /// Send a new message; returns the platform message id.
    fn send(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<String>>;

    /// Edit a previously sent message.
    fn edit(
        &self,
        destination: &Destination,
        message_id: &str,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<EditOutcome>>;

    /// Release underlying resources.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Send with one retry, then log and skip. A failing destination must never
/// stall the pipeline, so the error is swallowed here.
pub async fn send_with_retry(
    publisher: &dyn Publisher,
    destination: &Destination,
    message: &OutboundMessage,
) -> Option<String> {
    match publisher.send(destination, message).await {
        Ok(id) => Some(id),
        Err(first) => match publisher.send(destination, message).await {
            Ok(id) => Some(id),
            Err(second) => {
                warn!(
                    platform = publisher.platform(),
                    destination = %destination,
                    first_error = %first,
                    error = %second,
                    "Dropping message after retry"
                );
                None
            }
        },
    }
}

/// Edit with one retry. Returns `NotFound` so callers can forget stale ids;
/// other failures are logged and swallowed.
pub async fn edit_with_retry(
    publisher: &dyn Publisher,
    destination: &Destination,
    message_id: &str,
    message: &OutboundMessage,
) -> Option<EditOutcome> {
    match publisher.edit(destination, message_id, message).await {
        Ok(outcome) => Some(outcome),
        Err(first) => match publisher.edit(destination, message_id, message).await {
            Ok(outcome) => Some(outcome),
            Err(second) => {
                warn!(
                    platform = publisher.platform(),
                    destination = %destination,
                    message_id,
                    first_error = %first,
                    error = %second,
                    "Dropping edit after retry"
                );
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tailcast_core::TailcastError;

    struct FlakyPublisher {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl Publisher for FlakyPublisher {
        fn platform(&self) -> &'static str {
            "test"
        }

        fn validate(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send(
            &self,
            _destination: &Destination,
            _message: &OutboundMessage,
        ) -> BoxFuture<'_, Result<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < self.fail_first {
                    Err(TailcastError::Publish {
                        platform: "test".into(),
                        message: "boom".into(),
                    })
                } else {
                    Ok("msg_1".into())
                }
            })
        }

        fn edit(
            &self,
            _destination: &Destination,
            _message_id: &str,
            _message: &OutboundMessage,
        ) -> BoxFuture<'_, Result<EditOutcome>> {
            Box::pin(async { Ok(EditOutcome::NotFound) })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn dest() -> Destination {
        Destination::Slack {
            channel: "C1".into(),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let publisher = FlakyPublisher {
            fail_first: 1,
            calls: AtomicUsize::new(0),
        };
        let id = send_with_retry(&publisher, &dest(), &OutboundMessage::text("hi")).await;
        assert_eq!(id.as_deref(), Some("msg_1"));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_two_attempts() {
        let publisher = FlakyPublisher {
            fail_first: 5,
            calls: AtomicUsize::new(0),
        };
        let id = send_with_retry(&publisher, &dest(), &OutboundMessage::text("hi")).await;
        assert!(id.is_none());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn edit_reports_not_found() {
        let publisher = FlakyPublisher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        };
        let outcome =
            edit_with_retry(&publisher, &dest(), "m1", &OutboundMessage::text("hi")).await;
        assert_eq!(outcome, Some(EditOutcome::NotFound));
    }
}
