mod error;
mod jsonl;
mod paths;
mod schema;
mod store;

pub use error::StoreError;
pub use jsonl::{JsonlConversationStore, JsonlSink};
pub use paths::{conversation_file_name, store_root};
pub use schema::{
    Checkpoint, CheckpointSummary, Conversation, LifecycleState, LogRecord, NewTurn, StoredTurn,
    LOG_FORMAT_VERSION,
};
pub use store::{ConversationStore, InMemoryConversationStore, LogSink, LogStore, MemorySink};
