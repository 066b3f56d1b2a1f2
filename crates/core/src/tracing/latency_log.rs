use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
};

use super::{DiagnosticsSink, SimEvent};

const CHANNEL_CAPACITY: usize = 10_000;
const BATCH_SIZE: usize = 100;
const HEADER: &str = "timestamp,device,event_type,sequence,latency_ms\n";

#[derive(Debug, thiserror::Error)]
pub enum LatencyLogError {
    #[error("failed opening latency log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("latency log writer stopped")]
    WriterGone,
}

enum LogCommand {
    Record(String),
    Flush(oneshot::Sender<()>),
}

/// Appends one CSV row per delivered event to a file.
///
/// Rows are formatted on the recording thread and written by a background task
/// in batches. When the writer falls behind rows are dropped, never awaited.
pub struct LatencyLog {
    sender: mpsc::Sender<LogCommand>,
    dropped: AtomicU64,
}

impl LatencyLog {
    /// Opens (or creates) the file and spawns its writer on the current runtime.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LatencyLogError> {
        let path = path.as_ref();
        let open_err = |source| LatencyLogError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(open_err)?;
        let is_empty = file.metadata().await.map_err(open_err)?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_empty {
            writer
                .write_all(HEADER.as_bytes())
                .await
                .map_err(open_err)?;
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(write_rows(receiver, writer, path.to_path_buf()));
        Ok(Self {
            sender,
            dropped: AtomicU64::new(0),
        })
    }

    /// Waits until every row recorded so far is on disk.
    pub async fn flush(&self) -> Result<(), LatencyLogError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LogCommand::Flush(tx))
            .await
            .map_err(|_| LatencyLogError::WriterGone)?;
        rx.await.map_err(|_| LatencyLogError::WriterGone)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DiagnosticsSink for LatencyLog {
    fn record(&self, event: &SimEvent) {
        let SimEvent::EventSent {
            device,
            event_type,
            sequence,
            latency,
        } = event
        else {
            return;
        };
        let row = format!(
            "{},{device},{event_type},{sequence},{:.3}\n",
            chrono::Utc::now().to_rfc3339(),
            latency.as_secs_f64() * 1_000.0
        );
        if self.sender.try_send(LogCommand::Record(row)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn write_rows(
    mut receiver: mpsc::Receiver<LogCommand>,
    mut writer: BufWriter<tokio::fs::File>,
    path: PathBuf,
) {
    let mut pending = 0;
    while let Some(cmd) = receiver.recv().await {
        match cmd {
            LogCommand::Record(row) => {
                if let Err(err) = writer.write_all(row.as_bytes()).await {
                    tracing::error!(path = %path.display(), %err, "failed writing latency row");
                    continue;
                }
                pending += 1;
                if pending >= BATCH_SIZE {
                    pending = 0;
                    flush(&mut writer, &path).await;
                }
            }
            LogCommand::Flush(reply) => {
                pending = 0;
                flush(&mut writer, &path).await;
                let _ = reply.send(());
            }
        }
    }
    flush(&mut writer, &path).await;
}

async fn flush(writer: &mut BufWriter<tokio::fs::File>, path: &Path) {
    if let Err(err) = writer.flush().await {
        tracing::error!(path = %path.display(), %err, "failed flushing latency log");
    }
}
