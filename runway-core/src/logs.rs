//! Append-only, offset-addressed log streams, one per job phase.
//!
//! Readers either fetch a window with [`LogStore::get_chunk`] or tail with
//! [`LogStore::stream`], which polls rather than waiting on a push channel:
//! agent output arrives at unpredictable rates and a poll bounds staleness to
//! one interval.

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use runway_model::{END_OF_STREAM, JobId, LogConfig, LogSlice};

use crate::{
    error::{Result, RunwayError},
    persistence::LogRepository,
};

/// How a tail ended. Both are normal completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Reached the end-of-stream marker; carries the offset just past it.
    Completed { offset: u64 },
    /// The caller cancelled; carries the next unread offset.
    Cancelled { offset: u64 },
}

pub struct LogStore<S> {
    store: Arc<S>,
    config: LogConfig,
}

impl<S> std::fmt::Debug for LogStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .finish()
    }
}

fn sink_error(err: std::io::Error) -> RunwayError {
    RunwayError::Internal(format!("log sink: {err}"))
}

impl<S: LogRepository + 'static> LogStore<S> {
    pub fn new(store: Arc<S>, config: LogConfig) -> Self {
        Self { store, config }
    }

    /// Appends to the end of the job's stream; returns the new length.
    pub async fn append(&self, job: JobId, data: &[u8]) -> Result<u64> {
        if data.len() > self.config.max_chunk_bytes {
            return Err(RunwayError::InvariantViolation(format!(
                "log chunk of {} bytes exceeds the {}-byte limit",
                data.len(),
                self.config.max_chunk_bytes
            )));
        }
        self.store.append_log(job, data).await
    }

    /// Writes the end-of-stream marker; later appends are rejected.
    pub async fn close(&self, job: JobId) -> Result<u64> {
        self.store.append_log(job, &[END_OF_STREAM]).await
    }

    /// Reads `[offset, offset + limit)` clipped to the stream. A missing or
    /// zero limit reads to the end.
    pub async fn get_chunk(&self, job: JobId, offset: u64, limit: Option<u64>) -> Result<LogSlice> {
        self.store.read_log(job, offset, limit).await
    }

    /// Tails with the configured poll interval.
    pub async fn tail<W>(
        &self,
        cancel: &CancellationToken,
        job: JobId,
        writer: &mut W,
        from: u64,
    ) -> Result<StreamOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.stream(cancel, job, writer, self.config.poll_interval(), from)
            .await
    }

    /// Copies the stream from `start_offset` into `writer` as it grows,
    /// until the end-of-stream marker (not written) or cancellation.
    /// Each read is capped at `read_window_bytes`.
    #[instrument(skip(self, cancel, writer), target = "runway::logs")]
    pub async fn stream<W>(
        &self,
        cancel: &CancellationToken,
        job: JobId,
        writer: &mut W,
        poll_interval: Duration,
        start_offset: u64,
    ) -> Result<StreamOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let window = self.config.read_window();
        let mut offset = start_offset;
        loop {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled { offset });
            }
            let (length, _) = self.store.log_length(job).await?;
            if offset > length {
                return Err(RunwayError::OutOfRange { offset, length });
            }
            // Drain the backlog one bounded window at a time.
            while offset < length {
                if cancel.is_cancelled() {
                    return Ok(StreamOutcome::Cancelled { offset });
                }
                let slice = self.store.read_log(job, offset, Some(window)).await?;
                let data = slice.data.as_slice();
                if let Some(marker) = data.iter().position(|byte| *byte == END_OF_STREAM) {
                    writer.write_all(&data[..marker]).await.map_err(sink_error)?;
                    writer.flush().await.map_err(sink_error)?;
                    let end = offset + marker as u64 + 1;
                    debug!(target: "runway::logs", %job, offset = end, "end of stream");
                    return Ok(StreamOutcome::Completed { offset: end });
                }
                if data.is_empty() {
                    break;
                }
                writer.write_all(data).await.map_err(sink_error)?;
                writer.flush().await.map_err(sink_error)?;
                offset = slice.end_offset();
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled { offset }),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
