use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Operations,
    Security,
}

impl LogStream {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Operations => "operations",
            LogStream::Security => "security",
        }
    }
}

enum Command {
    Write {
        stream: LogStream,
        at: DateTime<Utc>,
        line: String,
    },
    Close(oneshot::Sender<()>),
}

/// Appends JSON lines to `<dir>/<stream>/<stream>-YYYY-MM-DD.jsonl`.
///
/// Producers never wait on disk: records go through a bounded channel to a single
/// writer task and are dropped, and counted, when the channel is full.
pub struct FileLogger {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileLogger {
    #[must_use]
    pub fn start(dir: PathBuf) -> Self {
        Self::with_capacity(dir, DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(dir: PathBuf, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(dir, rx));

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn log<T: Serialize>(&self, stream: LogStream, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize {} log record: {e}", stream.as_str());
                return;
            }
        };

        let command = Command::Write {
            stream,
            at: Utc::now(),
            line,
        };
        if self.tx.try_send(command).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(stream = stream.as_str(), dropped, "File log record dropped");
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drains queued records, flushes and closes the open files.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(handle) = self.writer.lock().await.take() {
            let _ = handle.await;
        }
    }
}

struct OpenFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

async fn run_writer(dir: PathBuf, mut rx: mpsc::Receiver<Command>) {
    let mut files: HashMap<LogStream, OpenFile> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write { stream, at, line } => {
                if let Err(e) = write_line(&dir, &mut files, stream, at, &line).await {
                    tracing::warn!("Failed to write {} log: {e}", stream.as_str());
                }
                if rx.is_empty() {
                    flush_all(&mut files).await;
                }
            }
            Command::Close(ack) => {
                flush_all(&mut files).await;
                files.clear();
                let _ = ack.send(());
                break;
            }
        }
    }

    flush_all(&mut files).await;
}

async fn write_line(
    dir: &std::path::Path,
    files: &mut HashMap<LogStream, OpenFile>,
    stream: LogStream,
    at: DateTime<Utc>,
    line: &str,
) -> std::io::Result<()> {
    let date = at.date_naive();

    let rotate = files.get(&stream).is_none_or(|f| f.date != date);
    if rotate {
        if let Some(mut old) = files.remove(&stream) {
            old.writer.flush().await?;
        }
        let stream_dir = dir.join(stream.as_str());
        fs::create_dir_all(&stream_dir).await?;
        let path = stream_dir.join(format!("{}-{}.jsonl", stream.as_str(), date.format("%Y-%m-%d")));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        files.insert(
            stream,
            OpenFile {
                date,
                writer: BufWriter::new(file),
            },
        );
    }

    if let Some(open) = files.get_mut(&stream) {
        open.writer.write_all(line.as_bytes()).await?;
        open.writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn flush_all(files: &mut HashMap<LogStream, OpenFile>) {
    for (stream, open) in files.iter_mut() {
        if let Err(e) = open.writer.flush().await {
            tracing::warn!("Failed to flush {} log: {e}", stream.as_str());
        }
    }
}
