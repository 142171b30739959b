pub mod buffer;
pub mod classifier;
pub mod consumer;
pub mod processor;
pub mod reader;
pub mod state;
pub mod watcher;

pub use buffer::{BufferManager, EventBuffer};
pub use classifier::{classify, LineType};
pub use consumer::Consumer;
pub use processor::{process, ProcessingContext};
pub use reader::{read_new_lines, seek_to_last_n_lines, ReadBatch};
pub use state::{sanitize_session_id, SessionState, StateStore};
pub use watcher::{SessionWatcher, WatchEvent};
