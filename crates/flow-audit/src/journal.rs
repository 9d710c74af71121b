use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::JournalRecord;

/// Channel buffer between ledger callers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Flush the writer after this long without new records.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// Errors that can occur during journal I/O.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open journal file: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize journal record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to journal: {0}")]
    Write(std::io::Error),

    #[error("failed to flush journal: {0}")]
    Flush(std::io::Error),
}

/// Append-only file writer producing one newline-terminated JSON object per
/// record.
struct JournalWriter {
    file: tokio::fs::File,
}

impl JournalWriter {
    async fn new(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(JournalError::CreateDir)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(JournalError::OpenFile)?;

        Ok(Self { file })
    }

    async fn write(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await.map_err(JournalError::Write)
    }

    async fn flush(&mut self) -> Result<(), JournalError> {
        self.file.flush().await.map_err(JournalError::Flush)
    }
}

/// Cheap, cloneable handle that submits [`JournalRecord`] values to the
/// background writer task.
///
/// Journal failures never propagate to the caller: a full channel waits, a
/// closed channel drops the record with a warning. Audit persistence must
/// not interfere with proxying.
#[derive(Clone)]
pub struct JournalSink {
    tx: mpsc::Sender<JournalRecord>,
}

impl JournalSink {
    /// Open (or create) the journal file and spawn the writer task. The task
    /// drains the channel, flushes after ~1 s of inactivity, performs a final
    /// flush when the last sink clone is dropped, then exits.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), JournalError> {
        let (tx, rx) = mpsc::channel::<JournalRecord>(CHANNEL_BUFFER);

        let mut writer = JournalWriter::new(path).await?;
        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });

        Ok((Self { tx }, handle))
    }

    /// Send a record to the background writer.
    pub async fn log(&self, record: JournalRecord) {
        if let Err(err) = self.tx.send(record).await {
            tracing::warn!(kind = ?err.0.kind, "journal channel closed; record dropped");
        }
    }
}

async fn run_writer_loop(writer: &mut JournalWriter, mut rx: mpsc::Receiver<JournalRecord>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(record)) => {
                if let Err(err) = writer.write(&record).await {
                    tracing::error!(%err, "failed to write journal record");
                } else {
                    dirty = true;
                }
            }
            // Channel closed: final flush, then exit.
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush journal on shutdown");
                    }
                }
                tracing::debug!("journal writer task shutting down");
                return;
            }
            // Idle: flush outstanding writes.
            Err(_) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "periodic journal flush failed");
                    } else {
                        dirty = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKind, StreamId};

    #[tokio::test]
    async fn records_land_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let (sink, handle) = JournalSink::start(&path).await.unwrap();
        sink.log(
            JournalRecord::new(RecordKind::StreamOpened, serde_json::json!({"n": 1}))
                .with_stream(StreamId(1)),
        )
        .await;
        sink.log(JournalRecord::new(
            RecordKind::StreamClosed,
            serde_json::json!({"n": 2}),
        ))
        .await;

        // Dropping the last sink closes the channel and flushes.
        drop(sink);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "stream_opened");
        assert_eq!(first["stream"], 1);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "stream_closed");
    }

    #[tokio::test]
    async fn parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/journal.jsonl");
        let (sink, handle) = JournalSink::start(&path).await.unwrap();
        drop(sink);
        handle.await.unwrap();
        assert!(path.exists());
    }
}
