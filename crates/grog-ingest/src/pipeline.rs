use std::sync::Arc;

use grog_core::{RecordKind, Sequence};
use grog_store::{LogStore, StoreError};
use grog_telemetry::{names, MetricsRecorder};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::source::Source;

/// Default capacity of the completion channel.
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

/// Outcome of one append, published to the broadcast coordinator.
#[derive(Debug)]
pub struct WriteEvent {
    pub source: Source,
    pub result: Result<Sequence, StoreError>,
}

impl WriteEvent {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Shared entry point for all input sources. Sources only share the store
/// (whose appends are serialized) and the completion channel.
#[derive(Clone)]
pub struct IngestPipeline {
    store: LogStore,
    events: mpsc::Sender<WriteEvent>,
    metrics: Arc<MetricsRecorder>,
}

impl IngestPipeline {
    pub fn new(
        store: LogStore,
        events: mpsc::Sender<WriteEvent>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
        }
    }

    /// Spawn a reader task for one source. The task ends at end of input,
    /// on cancellation, or when the completion channel is closed, and
    /// returns how many records it persisted.
    pub fn spawn_source<R, W>(
        &self,
        source: Source,
        reader: R,
        tee: W,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<u64, IngestError>>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_source(source, reader, tee, cancel).await })
    }

    async fn run_source<R, W>(
        self,
        source: Source,
        mut reader: R,
        mut tee: W,
        cancel: CancellationToken,
    ) -> Result<u64, IngestError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(4096);
        let mut persisted = 0u64;
        let mut tee_open = true;

        info!(source = %source, "ingestion started");

        loop {
            buf.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => {
                    info!(source = %source, "ingestion cancelled");
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    info!(source = %source, persisted, "end of input");
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    error!(source = %source, error = %error, "read failed");
                    return Err(IngestError::Read {
                        source_name: source.as_str(),
                        error,
                    });
                }
            }

            let line = strip_line_ending(&buf);

            if tee_open {
                if let Err(e) = write_tee(&mut tee, line).await {
                    warn!(source = %source, error = %e, "pass-through sink closed, continuing without it");
                    tee_open = false;
                }
            }

            if line.is_empty() {
                continue;
            }

            let event = WriteEvent {
                source,
                result: self.append(line.to_vec()).await,
            };
            match &event.result {
                Ok(sequence) => {
                    persisted += 1;
                    self.metrics
                        .counter_inc(names::RECORDS_APPENDED, &[("source", source.as_str())], 1);
                    debug!(source = %source, sequence = %sequence, "line persisted");
                }
                Err(e) => {
                    self.metrics
                        .counter_inc(names::APPEND_FAILURES, &[("source", source.as_str())], 1);
                    warn!(source = %source, error = %e, "append failed, line skipped");
                }
            }

            if self.events.send(event).await.is_err() {
                info!(source = %source, "completion channel closed, stopping ingestion");
                break;
            }
        }

        if tee_open {
            let _ = tee.flush().await;
        }
        Ok(persisted)
    }

    /// Classify and persist off the async runtime.
    async fn append(&self, line: Vec<u8>) -> Result<Sequence, StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let kind = RecordKind::classify(&line);
            store.append(&line, kind)
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::Write(format!("append task: {e}"))))
    }
}

/// Drop a trailing `\n` and an optional `\r` before it.
fn strip_line_ending(buf: &[u8]) -> &[u8] {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn write_tee<W: AsyncWrite + Unpin>(tee: &mut W, line: &[u8]) -> std::io::Result<()> {
    tee.write_all(line).await?;
    tee.write_all(b"\n").await?;
    tee.flush().await
}
