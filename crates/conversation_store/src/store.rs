use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use completion_provider::Turn;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::schema::{
    Checkpoint, Conversation, LogRecord, NewTurn, StoredTurn, LOG_FORMAT_VERSION,
};

/// Persistence boundary for conversations, their ordered turns, and checkpoints.
///
/// Turn order is the `seq` order. Implementations must be safe to share
/// across tasks; callers serialize writes to one conversation themselves.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        owner: &str,
        parent_id: Option<&str>,
    ) -> Result<Conversation, StoreError>;

    fn conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Compare-and-swap on `conversation.version`; returns the saved copy with
    /// the bumped version.
    fn save_conversation(&self, conversation: &Conversation) -> Result<Conversation, StoreError>;

    fn turns(&self, id: &str) -> Result<Vec<StoredTurn>, StoreError>;

    fn append_turns(&self, id: &str, turns: Vec<NewTurn>) -> Result<Vec<StoredTurn>, StoreError>;

    fn append_turn(&self, id: &str, turn: Turn) -> Result<StoredTurn, StoreError> {
        self.append_turns(id, vec![NewTurn::from(turn)])?
            .pop()
            .ok_or_else(|| StoreError::not_found(id))
    }

    /// Removes the listed turns; unknown sequence numbers are ignored.
    fn delete_turns(&self, id: &str, seqs: &[u64]) -> Result<usize, StoreError>;

    /// Removes every turn with a sequence number greater than `seq`.
    fn delete_turns_after(&self, id: &str, seq: u64) -> Result<usize, StoreError>;

    /// Drops all turns and appends `turns` with fresh sequence numbers.
    fn replace_turns(&self, id: &str, turns: Vec<NewTurn>)
        -> Result<Vec<StoredTurn>, StoreError>;

    /// Stores a checkpoint, replacing any checkpoint with the same name.
    fn save_checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Checkpoints ordered oldest first.
    fn checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    fn delete_checkpoint(&self, id: &str, name: &str) -> Result<bool, StoreError>;
}

/// Destination for committed log records.
pub trait LogSink: Send + Sync {
    fn create(&self, conversation_id: &str, header: &LogRecord) -> Result<(), StoreError>;

    fn append(&self, conversation_id: &str, records: &[LogRecord]) -> Result<(), StoreError>;
}

/// Keeps records in memory only.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySink;

impl LogSink for MemorySink {
    fn create(&self, _conversation_id: &str, _header: &LogRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn append(&self, _conversation_id: &str, _records: &[LogRecord]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Materialized state of one conversation log.
#[derive(Debug, Clone)]
pub(crate) struct ConversationLog {
    pub(crate) conversation: Conversation,
    pub(crate) turns: Vec<StoredTurn>,
    pub(crate) last_seq: u64,
    pub(crate) checkpoints: Vec<Checkpoint>,
}

impl ConversationLog {
    pub(crate) fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            turns: Vec::new(),
            last_seq: 0,
            checkpoints: Vec::new(),
        }
    }

    pub(crate) fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Header { conversation, .. } | LogRecord::State { conversation } => {
                self.conversation = conversation;
            }
            LogRecord::Turn { turn } => {
                self.last_seq = self.last_seq.max(turn.seq);
                self.turns.push(turn);
            }
            LogRecord::Delete { seqs } => {
                let seqs: BTreeSet<u64> = seqs.into_iter().collect();
                self.turns.retain(|turn| !seqs.contains(&turn.seq));
            }
            LogRecord::Checkpoint { checkpoint } => {
                self.checkpoints
                    .retain(|existing| existing.name != checkpoint.name);
                self.checkpoints.push(checkpoint);
            }
            LogRecord::CheckpointRemoved { name } => {
                self.checkpoints.retain(|existing| existing.name != name);
            }
        }
    }

    fn turn_records(&self, turns: Vec<NewTurn>) -> Vec<LogRecord> {
        let now = OffsetDateTime::now_utc();
        turns
            .into_iter()
            .zip(self.last_seq + 1..)
            .map(|(new_turn, seq)| LogRecord::Turn {
                turn: StoredTurn {
                    seq,
                    created_at: now,
                    provenance: new_turn.provenance,
                    turn: new_turn.turn,
                },
            })
            .collect()
    }
}

/// Conversation store backed by an append-only record log per conversation.
pub struct LogStore<S> {
    pub(crate) logs: Mutex<HashMap<String, ConversationLog>>,
    pub(crate) sink: S,
}

/// Process-local store; nothing survives a restart.
pub type InMemoryConversationStore = LogStore<MemorySink>;

impl LogStore<MemorySink> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(MemorySink)
    }
}

impl Default for LogStore<MemorySink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LogSink> LogStore<S> {
    pub(crate) fn with_sink(sink: S) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            sink,
        }
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&ConversationLog) -> T) -> Result<T, StoreError> {
        let logs = lock_unpoisoned(&self.logs);
        logs.get(id).map(f).ok_or_else(|| StoreError::not_found(id))
    }

    /// Persists `records` and only then applies them, so a failed write
    /// leaves the in-memory view untouched.
    fn commit(
        &self,
        log: &mut ConversationLog,
        records: Vec<LogRecord>,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.sink.append(&log.conversation.id, &records)?;
        for record in records {
            log.apply(record);
        }
        Ok(())
    }
}

impl<S: LogSink> ConversationStore for LogStore<S> {
    fn create_conversation(
        &self,
        owner: &str,
        parent_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(
            uuid::Uuid::new_v4().to_string(),
            owner,
            parent_id.map(str::to_string),
        );
        let mut logs = lock_unpoisoned(&self.logs);
        if logs.contains_key(&conversation.id) {
            return Err(StoreError::DuplicateConversation {
                id: conversation.id,
            });
        }

        let header = LogRecord::Header {
            format_version: LOG_FORMAT_VERSION,
            conversation: conversation.clone(),
        };
        self.sink.create(&conversation.id, &header)?;
        logs.insert(
            conversation.id.clone(),
            ConversationLog::new(conversation.clone()),
        );
        Ok(conversation)
    }

    fn conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.read(id, |log| log.conversation.clone())
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<Conversation, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs
            .get_mut(&conversation.id)
            .ok_or_else(|| StoreError::not_found(&conversation.id))?;

        let found = log.conversation.version;
        if found != conversation.version {
            return Err(StoreError::VersionConflict {
                id: conversation.id.clone(),
                expected: conversation.version,
                found,
            });
        }

        let mut saved = conversation.clone();
        saved.version = found + 1;
        self.commit(
            log,
            vec![LogRecord::State {
                conversation: saved.clone(),
            }],
        )?;
        Ok(saved)
    }

    fn turns(&self, id: &str) -> Result<Vec<StoredTurn>, StoreError> {
        self.read(id, |log| log.turns.clone())
    }

    fn append_turns(&self, id: &str, turns: Vec<NewTurn>) -> Result<Vec<StoredTurn>, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;

        let records = log.turn_records(turns);
        let stored = stored_turns(&records);
        self.commit(log, records)?;
        Ok(stored)
    }

    fn delete_turns(&self, id: &str, seqs: &[u64]) -> Result<usize, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;

        let wanted: BTreeSet<u64> = seqs.iter().copied().collect();
        let present: Vec<u64> = log
            .turns
            .iter()
            .map(|turn| turn.seq)
            .filter(|seq| wanted.contains(seq))
            .collect();
        let removed = present.len();
        if removed > 0 {
            self.commit(log, vec![LogRecord::Delete { seqs: present }])?;
        }
        Ok(removed)
    }

    fn delete_turns_after(&self, id: &str, seq: u64) -> Result<usize, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;

        let present: Vec<u64> = log
            .turns
            .iter()
            .map(|turn| turn.seq)
            .filter(|turn_seq| *turn_seq > seq)
            .collect();
        let removed = present.len();
        if removed > 0 {
            self.commit(log, vec![LogRecord::Delete { seqs: present }])?;
        }
        Ok(removed)
    }

    fn replace_turns(
        &self,
        id: &str,
        turns: Vec<NewTurn>,
    ) -> Result<Vec<StoredTurn>, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;

        let existing: Vec<u64> = log.turns.iter().map(|turn| turn.seq).collect();
        let appended = log.turn_records(turns);
        let stored = stored_turns(&appended);

        let mut records = Vec::with_capacity(appended.len() + 1);
        if !existing.is_empty() {
            records.push(LogRecord::Delete { seqs: existing });
        }
        records.extend(appended);
        self.commit(log, records)?;
        Ok(stored)
    }

    fn save_checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;
        self.commit(log, vec![LogRecord::Checkpoint { checkpoint }])
    }

    fn checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.read(id, |log| log.checkpoints.clone())
    }

    fn delete_checkpoint(&self, id: &str, name: &str) -> Result<bool, StoreError> {
        let mut logs = lock_unpoisoned(&self.logs);
        let log = logs.get_mut(id).ok_or_else(|| StoreError::not_found(id))?;

        if !log.checkpoints.iter().any(|checkpoint| checkpoint.name == name) {
            return Ok(false);
        }
        self.commit(
            log,
            vec![LogRecord::CheckpointRemoved {
                name: name.to_string(),
            }],
        )?;
        Ok(true)
    }
}

fn stored_turns(records: &[LogRecord]) -> Vec<StoredTurn> {
    records
        .iter()
        .filter_map(|record| match record {
            LogRecord::Turn { turn } => Some(turn.clone()),
            _ => None,
        })
        .collect()
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
