mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use runway_core::{
    RunwayError,
    logs::{LogStore, StreamOutcome},
    persistence::{InMemoryStore, LogRepository},
};
use runway_model::{JobId, LogConfig, LogSlice, Phase};
use support::Harness;

/// Records how large each read against the store is.
struct MeteredLogs {
    inner: Arc<InMemoryStore>,
    reads: AtomicUsize,
    largest_read: AtomicU64,
}

#[async_trait]
impl LogRepository for MeteredLogs {
    async fn append_log(&self, job: JobId, data: &[u8]) -> runway_core::Result<u64> {
        self.inner.append_log(job, data).await
    }

    async fn read_log(
        &self,
        job: JobId,
        offset: u64,
        limit: Option<u64>,
    ) -> runway_core::Result<LogSlice> {
        let slice = self.inner.read_log(job, offset, limit).await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.largest_read
            .fetch_max(slice.data.len() as u64, Ordering::SeqCst);
        Ok(slice)
    }

    async fn log_length(&self, job: JobId) -> runway_core::Result<(u64, bool)> {
        self.inner.log_length(job).await
    }
}

async fn job(harness: &Harness) -> Result<JobId> {
    let workspace = harness.workspace("logs").await?;
    let run = harness.runs.create_run(workspace.id, false).await?;
    harness.scheduler.reconcile_workspace(workspace.id).await?;
    Ok(harness.job(run.id, Phase::Plan).await?.id)
}

#[tokio::test]
async fn chunks_read_back_in_any_window() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    assert_eq!(harness.logs.append(job, b"Initializing").await?, 12);
    assert_eq!(harness.logs.append(job, b" providers\n").await?, 23);
    assert_eq!(harness.logs.append(job, b"Plan: 2 to add\n").await?, 38);

    let all = harness.logs.get_chunk(job, 0, None).await?;
    assert_eq!(all.data, b"Initializing providers\nPlan: 2 to add\n");
    assert_eq!(all.end_offset(), all.stream_length);

    // Windows cross chunk boundaries.
    let window = harness.logs.get_chunk(job, 8, Some(10)).await?;
    assert_eq!(window.data, b"zing provi");
    assert_eq!(window.end_offset(), 18);
    assert!(window.more_available());

    let tail = harness.logs.get_chunk(job, 29, Some(100)).await?;
    assert_eq!(tail.data, b"2 to add\n");
    Ok(())
}

#[tokio::test]
async fn reads_outside_the_stream_are_rejected() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;

    // An empty stream can be read from its start.
    let empty = harness.logs.get_chunk(job, 0, None).await?;
    assert!(empty.data.is_empty());

    harness.logs.append(job, b"abc").await?;
    let err = harness.logs.get_chunk(job, 3, None).await.unwrap_err();
    assert!(matches!(err, RunwayError::OutOfRange { offset: 3, length: 3 }));
    let err = harness.logs.get_chunk(job, 9, Some(1)).await.unwrap_err();
    assert!(matches!(err, RunwayError::OutOfRange { .. }));

    let err = harness.logs.get_chunk(JobId::new(), 0, None).await.unwrap_err();
    assert!(matches!(err, RunwayError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn closed_streams_reject_appends() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    harness.logs.append(job, b"done").await?;
    assert_eq!(harness.logs.close(job).await?, 5);

    let slice = harness.logs.get_chunk(job, 0, None).await?;
    assert!(slice.closed);
    let err = harness.logs.append(job, b"late").await.unwrap_err();
    assert!(matches!(err, RunwayError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test]
async fn oversized_chunks_are_rejected() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    let huge = vec![b'x'; 1024 * 1024 + 1];
    let err = harness.logs.append(job, &huge).await.unwrap_err();
    assert!(matches!(err, RunwayError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test]
async fn stream_stops_at_the_end_marker() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    harness.logs.append(job, b"line one\n").await?;
    harness.logs.append(job, b"line two\n").await?;
    harness.logs.close(job).await?;

    let mut out = Vec::new();
    let outcome = harness
        .logs
        .stream(
            &CancellationToken::new(),
            job,
            &mut out,
            Duration::from_millis(1),
            5,
        )
        .await?;
    assert_eq!(out, b"one\nline two\n");
    assert_eq!(outcome, StreamOutcome::Completed { offset: 19 });
    Ok(())
}

#[tokio::test]
async fn stream_rejects_a_start_past_the_end() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    harness.logs.append(job, b"abc").await?;

    let mut out = Vec::new();
    let err = harness
        .logs
        .stream(
            &CancellationToken::new(),
            job,
            &mut out,
            Duration::from_millis(1),
            4,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::OutOfRange { offset: 4, length: 3 }));
    Ok(())
}

#[tokio::test]
async fn tail_sees_each_append_and_ends_quietly_on_cancel() -> Result<()> {
    let harness = std::sync::Arc::new(Harness::new());
    let job = job(&harness).await?;
    let (mut reader, mut writer) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();

    let tail = {
        let harness = std::sync::Arc::clone(&harness);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            harness
                .logs
                .stream(&cancel, job, &mut writer, Duration::from_millis(1), 0)
                .await
        })
    };

    for line in ["apply started\n", "resource 1 created\n", "resource 2 created\n"] {
        harness.logs.append(job, line.as_bytes()).await?;
        let mut seen = vec![0u8; line.len()];
        tokio::time::timeout(Duration::from_secs(1), reader.read_exact(&mut seen)).await??;
        assert_eq!(seen, line.as_bytes());
    }

    cancel.cancel();
    let outcome = tail.await??;
    let total = "apply started\nresource 1 created\nresource 2 created\n".len() as u64;
    assert_eq!(outcome, StreamOutcome::Cancelled { offset: total });
    Ok(())
}

#[tokio::test]
async fn stream_reads_a_large_backlog_in_bounded_windows() -> Result<()> {
    let harness = Harness::new();
    let job = job(&harness).await?;
    let line = vec![b'.'; 1024];
    for _ in 0..64 {
        harness.logs.append(job, &line).await?;
    }
    harness.logs.close(job).await?;

    let metered = Arc::new(MeteredLogs {
        inner: Arc::clone(&harness.store),
        reads: AtomicUsize::new(0),
        largest_read: AtomicU64::new(0),
    });
    let logs = LogStore::new(
        Arc::clone(&metered),
        LogConfig {
            read_window_bytes: 4096,
            ..LogConfig::default()
        },
    );

    let mut out = Vec::new();
    let outcome = logs
        .stream(
            &CancellationToken::new(),
            job,
            &mut out,
            Duration::from_secs(60),
            0,
        )
        .await?;
    assert_eq!(out.len(), 64 * 1024);
    assert_eq!(outcome, StreamOutcome::Completed { offset: 64 * 1024 + 1 });
    assert!(metered.largest_read.load(Ordering::SeqCst) <= 4096);
    // Sixteen full windows plus the one holding the marker, with no sleeps
    // in between.
    assert_eq!(metered.reads.load(Ordering::SeqCst), 17);
    Ok(())
}
