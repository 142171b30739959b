pub mod debounce;
pub mod format;
pub mod manager;
pub mod publisher;
pub mod slack;
pub mod telegram;
pub mod tracker;

pub use debounce::{DebounceKey, Debouncer};
pub use manager::{DestinationManager, SessionLifecycle};
pub use publisher::{edit_with_retry, send_with_retry, EditOutcome, OutboundMessage, Publisher};
pub use slack::SlackPublisher;
pub use telegram::TelegramPublisher;
pub use tracker::{MessageAction, MessageKey, MessagePayload, MessageStateTracker, SendKind};
