/*
 * Description: Deliver encoded archive bytes to a streaming consumer, a file,
 * or an in-memory buffer.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Deliver encoded archive bytes to a streaming consumer, a file, or an
//! in-memory buffer.
//!
//! The encoder only ever sees an [`OutputSink`]: [`OutputSink::write`] for each
//! emitted chunk, then exactly one of [`OutputSink::finish`] (the trailer has
//! been written) or [`OutputSink::abort`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use displaydoc::Display;
use futures::future;
use thiserror::Error;
use tokio::{
  fs,
  io::{self, AsyncWriteExt},
  sync::{mpsc, oneshot},
  time,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use std::{
  ffi::OsString,
  mem,
  path::{Path, PathBuf},
  time::Duration,
};

#[derive(Debug, Display, Error)]
pub enum SinkError {
  /// i/o error accessing destination: {0}
  Io(#[from] io::Error),
  /// the consumer of the archive stream went away
  Disconnected,
  /// archive delivery was cancelled
  Cancelled,
  /// archive was aborted: {0}
  Aborted(String),
  /// the buffered archive was dropped before completion
  Dropped,
}

#[async_trait]
pub trait OutputSink: Send+Sync {
  async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;

  /// Called exactly once, after the archive trailer has been written.
  async fn finish(&mut self) -> Result<(), SinkError>;

  /// Make the failure visible to whoever consumes this sink. Never leaves a
  /// complete-looking archive behind.
  async fn abort(&mut self, reason: &str);

  /// Resolves once the consumer can no longer receive anything.
  async fn closed(&self) { future::pending::<()>().await }
}

/* If the consumer stopped reading, don't hang around forever trying to tell it
 * about the failure. */
const ABORT_DELIVERY_GRACE: Duration = Duration::from_secs(5);

/// Forwards each chunk over a bounded channel, e.g. into an http response body
/// or stdout. A slow consumer blocks [`OutputSink::write`].
pub struct StreamSink {
  tx: mpsc::Sender<io::Result<Bytes>>,
  completed: bool,
}

impl StreamSink {
  pub fn channel(capacity: usize) -> (Self, ReceiverStream<io::Result<Bytes>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = Self {
      tx,
      completed: false,
    };
    (sink, ReceiverStream::new(rx))
  }
}

#[async_trait]
impl OutputSink for StreamSink {
  async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
    self
      .tx
      .send(Ok(chunk))
      .await
      .map_err(|_| SinkError::Disconnected)
  }

  async fn finish(&mut self) -> Result<(), SinkError> {
    self.completed = true;
    if self.tx.is_closed() {
      return Err(SinkError::Disconnected);
    }
    Ok(())
  }

  async fn abort(&mut self, reason: &str) {
    self.completed = true;
    let err = io::Error::new(io::ErrorKind::Other, reason.to_string());
    if time::timeout(ABORT_DELIVERY_GRACE, self.tx.send(Err(err)))
      .await
      .is_err()
    {
      warn!(%reason, "consumer stopped reading before the abort could be delivered");
    }
  }

  async fn closed(&self) { self.tx.closed().await }
}

impl Drop for StreamSink {
  fn drop(&mut self) {
    if !self.completed {
      /* End the stream with an error rather than a silently truncated
       * archive. */
      let _ = self.tx.try_send(Err(io::Error::new(
        io::ErrorKind::Other,
        "archive stream dropped before completion",
      )));
    }
  }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub enum DestinationBehavior {
  /// Create the file if new, or truncate it if it exists.
  #[default]
  AlwaysTruncate,
  /// Fail if the file already exists.
  CreateNew,
}

/// Writes to `<path>.partial` and only renames it into place on
/// [`OutputSink::finish`], so a failed job never leaves a file that looks
/// downloaded.
pub struct FileSink {
  path: PathBuf,
  partial_path: PathBuf,
  file: Option<fs::File>,
}

fn partial_path(path: &Path) -> PathBuf {
  let mut name: OsString = path.as_os_str().to_os_string();
  name.push(".partial");
  PathBuf::from(name)
}

impl FileSink {
  pub async fn create(path: &Path, behavior: DestinationBehavior) -> Result<Self, SinkError> {
    if behavior == DestinationBehavior::CreateNew && fs::try_exists(path).await? {
      return Err(
        io::Error::new(
          io::ErrorKind::AlreadyExists,
          format!("{} already exists", path.display()),
        )
        .into(),
      );
    }
    let partial_path = partial_path(path);
    let file = fs::OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .open(&partial_path)
      .await?;
    Ok(Self {
      path: path.to_path_buf(),
      partial_path,
      file: Some(file),
    })
  }

  pub fn path(&self) -> &Path { &self.path }

  fn open_file(&mut self) -> Result<&mut fs::File, SinkError> {
    self.file.as_mut().ok_or(SinkError::Cancelled)
  }
}

#[async_trait]
impl OutputSink for FileSink {
  async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
    self.open_file()?.write_all(&chunk).await?;
    Ok(())
  }

  async fn finish(&mut self) -> Result<(), SinkError> {
    let mut file = self.file.take().ok_or(SinkError::Cancelled)?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&self.partial_path, &self.path).await?;
    debug!(path = %self.path.display(), "archive written");
    Ok(())
  }

  async fn abort(&mut self, reason: &str) {
    drop(self.file.take());
    if let Err(e) = fs::remove_file(&self.partial_path).await {
      if e.kind() != io::ErrorKind::NotFound {
        warn!(path = %self.partial_path.display(), error = %e, "failed to remove partial archive");
      }
    }
    warn!(path = %self.path.display(), %reason, "archive aborted");
  }
}

impl Drop for FileSink {
  fn drop(&mut self) {
    if self.file.take().is_some() {
      let _ = std::fs::remove_file(&self.partial_path);
    }
  }
}

/// Accumulates every chunk and materializes one buffer at the end. This holds
/// the whole archive in memory, so it is the last resort.
pub struct BufferSink {
  buffer: BytesMut,
  saved: Option<oneshot::Sender<Result<Bytes, SinkError>>>,
}

/// The far side of a [`BufferSink`].
pub struct BufferedArchive {
  rx: oneshot::Receiver<Result<Bytes, SinkError>>,
}

impl BufferedArchive {
  pub async fn collect(self) -> Result<Bytes, SinkError> {
    self.rx.await.map_err(|_| SinkError::Dropped)?
  }

  pub async fn save_to(self, path: &Path) -> Result<u64, SinkError> {
    let archive = self.collect().await?;
    fs::write(path, &archive).await?;
    Ok(archive.len() as u64)
  }
}

impl BufferSink {
  pub fn new() -> (Self, BufferedArchive) {
    let (tx, rx) = oneshot::channel();
    let sink = Self {
      buffer: BytesMut::new(),
      saved: Some(tx),
    };
    (sink, BufferedArchive { rx })
  }
}

#[async_trait]
impl OutputSink for BufferSink {
  async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
    self.buffer.extend_from_slice(&chunk);
    Ok(())
  }

  async fn finish(&mut self) -> Result<(), SinkError> {
    let archive = mem::take(&mut self.buffer).freeze();
    self
      .saved
      .take()
      .ok_or(SinkError::Cancelled)?
      .send(Ok(archive))
      .map_err(|_| SinkError::Disconnected)
  }

  async fn abort(&mut self, reason: &str) {
    self.buffer.clear();
    if let Some(saved) = self.saved.take() {
      let _ = saved.send(Err(SinkError::Aborted(reason.to_string())));
    }
  }
}

/// What the current environment can do with an archive.
#[derive(Clone, Debug, Default)]
pub struct SinkCapabilities {
  /// Bytes can be handed to a consumer as they are produced.
  pub streaming: bool,
  /// A destination file we are allowed to write into.
  pub writable_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkChoice {
  Stream,
  WritableFile(PathBuf),
  BufferThenSave,
}

impl SinkCapabilities {
  /// Check whether `path` could be written to directly.
  pub async fn probe_path(path: &Path) -> Option<PathBuf> {
    let parent = match path.parent() {
      Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
      _ => PathBuf::from("."),
    };
    match fs::metadata(&parent).await {
      Ok(metadata) if metadata.is_dir() && !metadata.permissions().readonly() => {
        Some(path.to_path_buf())
      },
      _ => None,
    }
  }

  pub fn choose(&self) -> SinkChoice {
    if self.streaming {
      SinkChoice::Stream
    } else if let Some(path) = &self.writable_path {
      SinkChoice::WritableFile(path.clone())
    } else {
      SinkChoice::BufferThenSave
    }
  }
}
