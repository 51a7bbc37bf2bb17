#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use completion_provider::{ToolInvocation, Turn};
use completion_provider_mock::{MockCompletionClient, MockStep};
use conversation_store::{
    Conversation, ConversationStore, InMemoryConversationStore, NewTurn, StoredTurn,
};
use convo_guard::{ConversationEngine, EngineConfig};
use serde_json::json;

/// Engine settings for tests: validation is always in full mode.
pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_recency_window(Duration::ZERO)
}

pub fn memory_store() -> Arc<dyn ConversationStore> {
    Arc::new(InMemoryConversationStore::new())
}

pub fn assistant_calls(ids: &[&str]) -> Turn {
    Turn::assistant_with_tool_calls(
        None,
        ids.iter()
            .map(|id| ToolInvocation::new(*id, "create_list", json!({"name": "groceries"})))
            .collect(),
    )
}

pub fn tool_call(id: &str, capability_name: &str) -> ToolInvocation {
    ToolInvocation::new(id, capability_name, json!({}))
}

/// Creates a conversation holding `turns` in order.
pub fn seeded_conversation(store: &Arc<dyn ConversationStore>, turns: Vec<Turn>) -> Conversation {
    let conversation = store
        .create_conversation("owner-1", None)
        .expect("conversation should be created");
    if !turns.is_empty() {
        store
            .append_turns(&conversation.id, turns.into_iter().map(NewTurn::from).collect())
            .expect("turns should be appended");
    }
    conversation
}

pub fn wire_turns(turns: &[StoredTurn]) -> Vec<Turn> {
    turns.iter().map(|turn| turn.turn.clone()).collect()
}

pub fn history(store: &Arc<dyn ConversationStore>, conversation_id: &str) -> Vec<Turn> {
    wire_turns(&store.turns(conversation_id).expect("turns should load"))
}

pub struct Harness {
    pub store: Arc<dyn ConversationStore>,
    pub client: MockCompletionClient,
    pub engine: ConversationEngine,
}

pub fn harness(script: Vec<MockStep>) -> Harness {
    harness_with(MockCompletionClient::new(script), test_config())
}

pub fn harness_with(client: MockCompletionClient, config: EngineConfig) -> Harness {
    let store = memory_store();
    let engine = ConversationEngine::builder(Arc::clone(&store), Arc::new(client.clone()))
        .with_config(config)
        .build();
    Harness {
        store,
        client,
        engine,
    }
}
