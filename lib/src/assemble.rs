/*
 * Description: Drive the archive encoder over a job's entries, feeding it from
 * each entry's byte source and recording progress.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Drive the archive encoder over a job's entries, feeding it from each
//! entry's byte source and recording progress.

use crate::{
  destination::OutputSink,
  encoder::{
    self, ArchiveEncoder, ArchiveSummary, CompressionStrategy, EncoderError, EncoderOptions,
    EntryHandle, ModifiedTimeBehavior,
  },
  progress::{ProgressError, ProgressPatch, ProgressStore},
  source::{ByteSource, FetchOptions, SourceError, SourceReader},
  tuning::Tuning,
  EntryName, JobId,
};

use bytes::Bytes;
use displaydoc::Display;
use futures::future;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use std::sync::Arc;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EntryStatus {
  #[default]
  Pending,
  Streaming,
  Completed,
  Failed,
}

/// One named entry of a [`ZipJob`].
#[derive(Clone, Debug)]
pub struct ZipEntryTask {
  pub name: EntryName,
  pub source: ByteSource,
  pub status: EntryStatus,
}

impl ZipEntryTask {
  pub fn new(name: EntryName, source: ByteSource) -> Self {
    Self {
      name,
      source,
      status: EntryStatus::Pending,
    }
  }
}

/// One archive-build request.
#[derive(Clone, Debug)]
pub struct ZipJob {
  pub id: JobId,
  pub entries: Vec<ZipEntryTask>,
  pub created_at: OffsetDateTime,
}

impl ZipJob {
  pub fn new(id: JobId, entries: Vec<ZipEntryTask>) -> Self {
    Self {
      id,
      entries,
      created_at: encoder::local_now(),
    }
  }

  pub fn total(&self) -> usize { self.entries.len() }
}

/// What happens when a single entry's source fails.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
  /* Any entry failure aborts the whole archive. */
  /// strict
  Strict,
  /* A failed entry is written as a zero-byte file. */
  /// lenient
  #[default]
  Lenient,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parallelism {
  Sequential,
  /// Up to `batch_size` entries are fetched concurrently; the next batch only
  /// starts once the previous one has been fully written.
  Batched { batch_size: usize },
}

impl Parallelism {
  pub fn batched(tuning: &Tuning) -> Self {
    Self::Batched {
      batch_size: tuning.batch_size,
    }
  }

  fn batch_size(&self) -> usize {
    match self {
      Self::Sequential => 1,
      Self::Batched { batch_size } => (*batch_size).max(1),
    }
  }
}

#[derive(Debug, Display, Error)]
pub enum AssemblyError {
  /// progress error: {0}
  Progress(#[from] ProgressError),
  /// failed to prepare fetching: {0}
  Setup(#[source] SourceError),
  /// entry {0} failed: {1}
  Source(EntryName, #[source] SourceError),
  /// encoder error: {0}
  Encoder(#[from] EncoderError),
  /// assembly was cancelled
  Cancelled,
}

/// How one entry turned out.
#[derive(Clone, Debug)]
pub struct EntryOutcome {
  pub name: EntryName,
  pub status: EntryStatus,
  pub bytes: u64,
  pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JobReport {
  pub id: JobId,
  pub entries: Vec<EntryOutcome>,
  pub summary: ArchiveSummary,
}

impl JobReport {
  pub fn failed(&self) -> usize {
    self
      .entries
      .iter()
      .filter(|entry| entry.status == EntryStatus::Failed)
      .count()
  }
}

/* Remote sizes are unknown until fetched; assume a typical photo. */
const ASSUMED_REMOTE_ENTRY_BYTES: u64 = 4 * 1024 * 1024;

pub const DEFAULT_SPOOL_THRESHOLD: usize = 1024 * 1024;

const ENTRY_QUEUE_LENGTH: usize = 4;

enum CopyError {
  Source(SourceError),
  Encoder(EncoderError),
}

pub struct Assembler {
  tuning: Tuning,
  policy: FailurePolicy,
  parallelism: Parallelism,
  store: Arc<dyn ProgressStore>,
  spool_threshold: usize,
  compression: Option<CompressionStrategy>,
  mtime_behavior: Option<ModifiedTimeBehavior>,
}

impl Assembler {
  pub fn new(
    tuning: Tuning,
    policy: FailurePolicy,
    parallelism: Parallelism,
    store: Arc<dyn ProgressStore>,
  ) -> Self {
    Self {
      tuning,
      policy,
      parallelism,
      store,
      spool_threshold: DEFAULT_SPOOL_THRESHOLD,
      compression: None,
      mtime_behavior: None,
    }
  }

  /// Best-effort bulk download: batched fetches, failed entries left empty.
  pub fn for_bulk_download(tuning: Tuning, store: Arc<dyn ProgressStore>) -> Self {
    Self::new(
      tuning,
      FailurePolicy::Lenient,
      Parallelism::batched(&tuning),
      store,
    )
  }

  /// A committed local file: one entry at a time, any failure aborts.
  pub fn for_committed_file(tuning: Tuning, store: Arc<dyn ProgressStore>) -> Self {
    Self::new(
      tuning,
      FailurePolicy::Strict,
      Parallelism::Sequential,
      store,
    )
  }

  pub fn with_spool_threshold(mut self, spool_threshold: usize) -> Self {
    self.spool_threshold = spool_threshold;
    self
  }

  /// Use this compression instead of picking one from the input size.
  pub fn with_compression(mut self, compression: CompressionStrategy) -> Self {
    self.compression = Some(compression);
    self
  }

  /// Defaults to stamping every entry with the job's creation time.
  pub fn with_mtime_behavior(mut self, mtime_behavior: ModifiedTimeBehavior) -> Self {
    self.mtime_behavior = Some(mtime_behavior);
    self
  }

  pub fn policy(&self) -> FailurePolicy { self.policy }

  fn estimate_input_bytes(entries: &[ZipEntryTask]) -> u64 {
    entries
      .iter()
      .map(|task| {
        task
          .source
          .known_len()
          .unwrap_or(ASSUMED_REMOTE_ENTRY_BYTES)
      })
      .sum()
  }

  /// Create the progress record for `job`, failing if a job with the same id
  /// is still running.
  pub fn register(&self, job: &ZipJob) -> Result<(), ProgressError> {
    self.store.create(&job.id, job.total())
  }

  /// Build the archive for `job` into `sink`. The job's progress record is
  /// always `done` by the time this returns, with `error` set on failure.
  pub async fn assemble(
    &self,
    job: ZipJob,
    sink: Box<dyn OutputSink>,
  ) -> Result<JobReport, AssemblyError> {
    self.register(&job)?;
    self.assemble_registered(job, sink).await
  }

  /// [`Self::assemble`], for a job which has already been
  /// [registered](Self::register).
  pub async fn assemble_registered(
    &self,
    job: ZipJob,
    sink: Box<dyn OutputSink>,
  ) -> Result<JobReport, AssemblyError> {
    let ZipJob {
      id,
      mut entries,
      created_at,
    } = job;

    let cancel = CancellationToken::new();
    let fetch = match FetchOptions::from_tuning(&self.tuning, cancel.clone()) {
      Ok(fetch) => fetch,
      Err(e) => {
        let e = AssemblyError::Setup(e);
        self.store.fail(&id, e.to_string());
        return Err(e);
      },
    };

    let compression = self
      .compression
      .unwrap_or_else(|| self.tuning.compression_for(Self::estimate_input_bytes(&entries)));
    let options = EncoderOptions {
      mtime_behavior: self
        .mtime_behavior
        .unwrap_or(ModifiedTimeBehavior::Explicit(created_at)),
      compression,
      chunk_size: self.tuning.chunk_size,
      entry_queue_length: ENTRY_QUEUE_LENGTH,
    };
    info!(
      %id,
      total = entries.len(),
      policy = %self.policy,
      parallelism = ?self.parallelism,
      ?compression,
      "assembling archive"
    );
    let encoder = ArchiveEncoder::open(options, sink, cancel);

    let mut outcomes: Vec<EntryOutcome> = Vec::with_capacity(entries.len());
    for batch in entries.chunks_mut(self.parallelism.batch_size()) {
      match self.run_batch(&id, &encoder, &fetch, batch).await {
        Ok(batch_outcomes) => outcomes.extend(batch_outcomes),
        Err(failure) => {
          let failure = match failure {
            /* Something downstream stopped the encoder; ending it surfaces
             * why. */
            AssemblyError::Cancelled => match encoder.end().await {
              Err(e) => AssemblyError::Encoder(e),
              Ok(_) => AssemblyError::Cancelled,
            },
            failure => {
              encoder.abort(&failure.to_string()).await;
              failure
            },
          };
          error!(%id, error = %failure, "archive aborted");
          self.store.fail(&id, failure.to_string());
          return Err(failure);
        },
      }
    }

    match encoder.end().await {
      Ok(summary) => {
        self.store.update(&id, ProgressPatch::Completed);
        let report = JobReport {
          id,
          entries: outcomes,
          summary,
        };
        info!(
          id = %report.id,
          entries = report.summary.entries,
          failed = report.failed(),
          bytes = report.summary.bytes_written,
          "archive complete"
        );
        Ok(report)
      },
      Err(e) => {
        error!(%id, error = %e, "failed to finalize archive");
        self.store.fail(&id, e.to_string());
        Err(e.into())
      },
    }
  }

  async fn run_batch(
    &self,
    id: &JobId,
    encoder: &ArchiveEncoder,
    fetch: &FetchOptions,
    batch: &mut [ZipEntryTask],
  ) -> Result<Vec<EntryOutcome>, AssemblyError> {
    /* Reserve archive positions in task order before any data arrives. */
    let handles = batch
      .iter()
      .map(|task| encoder.add_entry(task.name.clone()))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|_| AssemblyError::Cancelled)?;
    let results = future::join_all(
      batch
        .iter_mut()
        .zip(handles)
        .map(|(task, handle)| self.stream_entry(id, fetch, task, handle)),
    )
    .await;

    let mut outcomes = Vec::with_capacity(results.len());
    let mut cancelled = false;
    for result in results {
      match result {
        Ok(outcome) => outcomes.push(outcome),
        /* Siblings of a failed entry see cancellation; report the root cause. */
        Err(AssemblyError::Cancelled) => cancelled = true,
        Err(e) => return Err(e),
      }
    }
    if cancelled {
      return Err(AssemblyError::Cancelled);
    }
    Ok(outcomes)
  }

  async fn open_source(
    &self,
    source: ByteSource,
    fetch: &FetchOptions,
  ) -> Result<SourceReader, SourceError> {
    let is_remote = source.is_remote();
    let reader = source.open(fetch).await?;
    match self.policy {
      /* Pull the whole remote body down first, so that a failure partway
       * through can still leave a zero-byte entry. */
      FailurePolicy::Lenient if is_remote => {
        let staged = reader.stage(self.spool_threshold).await?;
        ByteSource::UploadedFile(staged).open(fetch).await
      },
      _ => Ok(reader),
    }
  }

  async fn copy(mut reader: SourceReader, handle: &mut EntryHandle) -> Result<(), CopyError> {
    while let Some(chunk) = reader.next_chunk().await.map_err(CopyError::Source)? {
      handle
        .push(chunk, false)
        .await
        .map_err(CopyError::Encoder)?;
      task::yield_now().await;
    }
    Ok(())
  }

  async fn stream_entry(
    &self,
    id: &JobId,
    fetch: &FetchOptions,
    task: &mut ZipEntryTask,
    mut handle: EntryHandle,
  ) -> Result<EntryOutcome, AssemblyError> {
    task.status = EntryStatus::Streaming;
    let copied = match self.open_source(task.source.clone(), fetch).await {
      Ok(reader) => Self::copy(reader, &mut handle).await,
      Err(e) => Err(CopyError::Source(e)),
    };

    let error = match copied {
      Ok(()) => None,
      Err(CopyError::Source(SourceError::Cancelled)) | Err(CopyError::Encoder(EncoderError::Closed)) => {
        task.status = EntryStatus::Failed;
        let _ = handle.push(Bytes::new(), true).await;
        return Err(AssemblyError::Cancelled);
      },
      Err(CopyError::Encoder(e)) => {
        task.status = EntryStatus::Failed;
        return Err(e.into());
      },
      Err(CopyError::Source(e))
        if self.policy == FailurePolicy::Lenient && handle.pushed() == 0 =>
      {
        warn!(%id, name = %task.name, error = %e, "entry failed, writing it empty");
        Some(e.to_string())
      },
      Err(CopyError::Source(e)) => {
        task.status = EntryStatus::Failed;
        /* Stop every sibling fetch before anything else gets written. */
        fetch.cancel.cancel();
        let _ = handle.push(Bytes::new(), true).await;
        return Err(AssemblyError::Source(task.name.clone(), e));
      },
    };

    handle.push(Bytes::new(), true).await.map_err(|e| match e {
      EncoderError::Closed => AssemblyError::Cancelled,
      e => e.into(),
    })?;
    task.status = if error.is_some() {
      EntryStatus::Failed
    } else {
      EntryStatus::Completed
    };
    self.store.update(id, ProgressPatch::EntryFinished);
    debug!(%id, name = %task.name, bytes = handle.pushed(), status = ?task.status, "entry finished");
    Ok(EntryOutcome {
      name: task.name.clone(),
      status: task.status,
      bytes: handle.pushed(),
      error,
    })
  }
}
