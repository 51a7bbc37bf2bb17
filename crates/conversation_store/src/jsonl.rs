use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::paths::conversation_file_name;
use crate::schema::{LogRecord, LOG_FORMAT_VERSION};
use crate::store::{lock_unpoisoned, ConversationLog, LogSink, LogStore};

/// Writes each conversation to `<root>/<id>.jsonl`, one record per line.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    root: PathBuf,
}

impl JsonlSink {
    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.root.join(conversation_file_name(conversation_id))
    }
}

impl LogSink for JsonlSink {
    fn create(&self, conversation_id: &str, header: &LogRecord) -> Result<(), StoreError> {
        let path = self.path_for(conversation_id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StoreError::io("creating conversation log", &path, source))?;
        write_records(&path, &mut file, std::slice::from_ref(header))
    }

    fn append(&self, conversation_id: &str, records: &[LogRecord]) -> Result<(), StoreError> {
        let path = self.path_for(conversation_id);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::io("opening conversation log for append", &path, source))?;
        write_records(&path, &mut file, records)
    }
}

/// Durable store: one append-only JSONL log per conversation.
pub type JsonlConversationStore = LogStore<JsonlSink>;

impl LogStore<JsonlSink> {
    /// Opens (creating if needed) the store at `root` and replays every log in it.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)
            .map_err(|source| StoreError::io("creating store directory", root, source))?;

        let store = Self::with_sink(JsonlSink {
            root: root.to_path_buf(),
        });
        let entries = fs::read_dir(root)
            .map_err(|source| StoreError::io("listing store directory", root, source))?;

        let mut logs = lock_unpoisoned(&store.logs);
        for entry in entries {
            let entry =
                entry.map_err(|source| StoreError::io("listing store directory", root, source))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }

            let log = replay_log(&path)?;
            logs.insert(log.conversation.id.clone(), log);
        }
        drop(logs);

        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.sink.root
    }
}

pub(crate) fn replay_log(path: &Path) -> Result<ConversationLog, StoreError> {
    let read_file = File::open(path)
        .map_err(|source| StoreError::io("opening conversation log", path, source))?;
    let reader = BufReader::new(read_file);
    let mut log: Option<ConversationLog> = None;

    for (line_index, line_result) in reader.lines().enumerate() {
        let line_number = line_index + 1;
        let line = line_result.map_err(|source| StoreError::io_line(path, line_number, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_record_line(path, line_number, &line)?;

        let Some(current) = log.as_mut() else {
            log = Some(header_log(path, line_number, record)?);
            continue;
        };

        match &record {
            LogRecord::Header { .. } => {
                return Err(StoreError::UnexpectedHeader {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            }
            LogRecord::Turn { turn } if turn.seq <= current.last_seq => {
                return Err(StoreError::NonMonotonicSequence {
                    path: path.to_path_buf(),
                    line: line_number,
                    seq: turn.seq,
                    previous: current.last_seq,
                });
            }
            _ => {}
        }
        current.apply(record);
    }

    log.ok_or_else(|| StoreError::MissingHeader {
        path: path.to_path_buf(),
    })
}

fn header_log(
    path: &Path,
    line_number: usize,
    record: LogRecord,
) -> Result<ConversationLog, StoreError> {
    let LogRecord::Header {
        format_version,
        conversation,
    } = record
    else {
        return Err(StoreError::InvalidHeaderRecord {
            path: path.to_path_buf(),
            line: line_number,
        });
    };
    if format_version != LOG_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: format_version,
        });
    }

    Ok(ConversationLog::new(conversation))
}

fn parse_record_line(path: &Path, line_number: usize, line: &str) -> Result<LogRecord, StoreError> {
    serde_json::from_str::<LogRecord>(line)
        .map_err(|source| StoreError::json_line(path, line_number, source))
}

fn write_records(path: &Path, file: &mut File, records: &[LogRecord]) -> Result<(), StoreError> {
    let mut buffer = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|source| StoreError::json_serialize(path, source))?;
        buffer.push_str(&line);
        buffer.push('\n');
    }

    file.write_all(buffer.as_bytes())
        .map_err(|source| StoreError::io("appending conversation log", path, source))?;
    file.flush()
        .map_err(|source| StoreError::io("flushing conversation log", path, source))
}
