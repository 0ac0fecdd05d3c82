/*
 * Description: A streaming zip writer fed by ordered per-entry channels.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! A streaming zip writer fed by ordered per-entry channels.
//!
//! Entries are registered with [`ArchiveEncoder::add_entry`] and appear in the
//! archive in exactly that order, however the chunks for each entry are
//! produced. Each [`EntryHandle`] must be terminated with an explicit
//! end-of-entry marker; an empty entry is a valid zero-byte file. Encoded
//! bytes are handed to an [`OutputSink`] as they are produced, so nothing
//! requires the output to be seekable.

use crate::{
  destination::{OutputSink, SinkError},
  EntryName,
};

use async_zip::{
  base::write::ZipFileWriter, error::ZipError, Compression, DeflateOption, ZipDateTime,
  ZipDateTimeBuilder, ZipEntryBuilder,
};
use bytes::Bytes;
use displaydoc::Display;
use futures::{io::AsyncWriteExt, stream::StreamExt};
use static_init;
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};
use tokio::{
  io::{self, DuplexStream},
  sync::mpsc,
  task,
};
use tokio_util::{
  compat::Compat,
  io::ReaderStream,
  sync::{CancellationToken, DropGuard},
};
use tracing::{debug, trace};

use std::{num, ops};

#[derive(Debug, Display, Error)]
pub enum EncoderError {
  /// i/o error: {0}
  Io(#[from] io::Error),
  /// zip error: {0}
  Zip(#[from] ZipError),
  /// join error: {0}
  Join(#[from] task::JoinError),
  /// error delivering archive: {0}
  Sink(#[from] SinkError),
  /// entry {0} was dropped without an end-of-entry marker
  EntryAbandoned(EntryName),
  /// entry {0} received data after its end-of-entry marker
  PushAfterEnd(EntryName),
  /// the encoder is no longer accepting entries
  Closed,
  /// encoding was cancelled
  Cancelled,
}

pub trait InitializeEntryOptions {
  #[must_use]
  fn set_entry_options(&self, builder: ZipEntryBuilder) -> ZipEntryBuilder;
}

/* The `time` crate is extremely touchy about only ever extracting the local
 * UTC offset within a single-threaded environment, which means it cannot be
 * called anywhere reachable from the main function if we use #[tokio::main].
 * static_init instead runs it at program initialization time. */
#[static_init::dynamic]
static LOCAL_UTC_OFFSET: UtcOffset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

/// The current time in the local offset captured at startup.
pub fn local_now() -> OffsetDateTime { OffsetDateTime::now_utc().to_offset(*LOCAL_UTC_OFFSET) }

/* Zip timestamps can only represent the years 1980 through 2107. */
const ZIP_YEARS: ops::RangeInclusive<i32> = ops::RangeInclusive::new(1980, 2107);

fn minimum_zip_time() -> ZipDateTime {
  ZipDateTimeBuilder::new()
    .year(*ZIP_YEARS.start())
    .month(1)
    .day(1)
    .hour(0)
    .minute(0)
    .second(0)
    .build()
}

fn to_zip_time(timestamp: OffsetDateTime) -> ZipDateTime {
  let year = timestamp.year();
  if year < *ZIP_YEARS.start() {
    return minimum_zip_time();
  }
  ZipDateTimeBuilder::new()
    .year(year.min(*ZIP_YEARS.end()))
    .month(u8::from(timestamp.month()).into())
    .day(timestamp.day().into())
    .hour(timestamp.hour().into())
    .minute(timestamp.minute().into())
    .second(timestamp.second().into())
    .build()
}

#[derive(Copy, Clone, Default, Debug)]
pub enum ModifiedTimeBehavior {
  /// Every entry is stamped 1980-01-01 00:00:00.
  #[default]
  Reproducible,
  /// Every entry is stamped with the local time as of encoding.
  CurrentTime,
  Explicit(OffsetDateTime),
}

impl InitializeEntryOptions for ModifiedTimeBehavior {
  #[must_use]
  fn set_entry_options(&self, builder: ZipEntryBuilder) -> ZipEntryBuilder {
    let stamp = match self {
      Self::Reproducible => minimum_zip_time(),
      Self::CurrentTime => to_zip_time(local_now()),
      Self::Explicit(timestamp) => to_zip_time(timestamp.to_offset(*LOCAL_UTC_OFFSET)),
    };
    builder.last_modification_date(stamp)
  }
}

#[derive(Copy, Clone, Default, Debug, Display, PartialEq, Eq)]
pub enum CompressionMethod {
  /// uncompressed
  Stored,
  /// deflate-compressed
  #[default]
  Deflated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionStrategy {
  Stored,
  Deflated(Option<u8>),
}

impl Default for CompressionStrategy {
  fn default() -> Self { Self::Deflated(Some(6)) }
}

#[derive(Debug, Display, Error)]
pub enum ParseCompressionOptionsError {
  /// "stored" (uncompressed) does not accept a compression level (was: {0})
  CompressionLevelWithStored(i8),
  /// compression level {1} was invalid for method {0} which accepts {2:?}
  InvalidCompressionLevel(CompressionMethod, i8, ops::RangeInclusive<i8>),
  /// error converting from int (this should never happen!): {0}
  TryFromInt(#[from] num::TryFromIntError),
}

impl CompressionStrategy {
  const DEFLATE_RANGE: ops::RangeInclusive<i8> = ops::RangeInclusive::new(0, 9);

  pub fn from_method_and_level(
    method: CompressionMethod,
    level: Option<i8>,
  ) -> Result<Self, ParseCompressionOptionsError> {
    match method {
      CompressionMethod::Stored => match level {
        None => Ok(Self::Stored),
        Some(level) => Err(ParseCompressionOptionsError::CompressionLevelWithStored(
          level,
        )),
      },
      CompressionMethod::Deflated => match level {
        None => Ok(Self::Deflated(None)),
        Some(level) => {
          if Self::DEFLATE_RANGE.contains(&level) {
            Ok(Self::Deflated(Some(level.try_into()?)))
          } else {
            Err(ParseCompressionOptionsError::InvalidCompressionLevel(
              method,
              level,
              Self::DEFLATE_RANGE,
            ))
          }
        },
      },
    }
  }

  /* The compression method can only be provided when the builder is created,
   * so this can't be an InitializeEntryOptions impl. */
  fn new_entry(&self, name: EntryName) -> ZipEntryBuilder {
    match self {
      Self::Stored => ZipEntryBuilder::new(name.into_string().into(), Compression::Stored),
      Self::Deflated(level) => {
        let builder = ZipEntryBuilder::new(name.into_string().into(), Compression::Deflate);
        match level {
          None => builder,
          Some(level) => builder.deflate_option(DeflateOption::Other(i32::from(*level))),
        }
      },
    }
  }
}

#[derive(Copy, Clone, Debug)]
pub struct EncoderOptions {
  pub mtime_behavior: ModifiedTimeBehavior,
  pub compression: CompressionStrategy,
  /// Size of the chunks handed to the sink.
  pub chunk_size: usize,
  /// How many chunks each entry may queue before its producer waits.
  pub entry_queue_length: usize,
}

impl Default for EncoderOptions {
  fn default() -> Self {
    Self {
      mtime_behavior: ModifiedTimeBehavior::default(),
      compression: CompressionStrategy::default(),
      chunk_size: 64 * 1024,
      entry_queue_length: 4,
    }
  }
}

impl EncoderOptions {
  fn new_entry(&self, name: EntryName) -> ZipEntryBuilder {
    let builder = self.compression.new_entry(name);
    self.mtime_behavior.set_entry_options(builder)
  }
}

#[derive(Debug)]
enum EntryChunk {
  Data(Bytes),
  End,
}

struct PendingEntry {
  name: EntryName,
  chunks: mpsc::Receiver<EntryChunk>,
}

/// The producing side of one archive entry.
///
/// Dropping this before [`Self::push`] has been called with `is_last` fails
/// the whole archive with [`EncoderError::EntryAbandoned`].
#[derive(Debug)]
pub struct EntryHandle {
  name: EntryName,
  tx: Option<mpsc::Sender<EntryChunk>>,
  pushed: u64,
}

impl EntryHandle {
  pub fn name(&self) -> &EntryName { &self.name }

  /// Bytes pushed so far.
  pub fn pushed(&self) -> u64 { self.pushed }

  pub fn is_ended(&self) -> bool { self.tx.is_none() }

  /// Queue `chunk` for this entry, waiting if the encoder has not caught up.
  /// `is_last` terminates the entry; `chunk` may be empty.
  pub async fn push(&mut self, chunk: Bytes, is_last: bool) -> Result<(), EncoderError> {
    let tx = self
      .tx
      .as_ref()
      .ok_or_else(|| EncoderError::PushAfterEnd(self.name.clone()))?;
    if !chunk.is_empty() {
      let len = chunk.len() as u64;
      tx.send(EntryChunk::Data(chunk))
        .await
        .map_err(|_| EncoderError::Closed)?;
      self.pushed += len;
    }
    if is_last {
      tx.send(EntryChunk::End)
        .await
        .map_err(|_| EncoderError::Closed)?;
      self.tx = None;
    }
    Ok(())
  }
}

/// What a successfully ended archive contained.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
  pub entries: u64,
  pub bytes_written: u64,
}

type PumpOutput = (Box<dyn OutputSink>, Result<u64, SinkError>);

pub struct ArchiveEncoder {
  entries_tx: mpsc::UnboundedSender<PendingEntry>,
  driver: task::JoinHandle<Result<u64, EncoderError>>,
  pump: task::JoinHandle<PumpOutput>,
  options: EncoderOptions,
  /* Tears down both tasks if the encoder is dropped without end() or
   * abort(). */
  guard: DropGuard,
}

enum PumpStep {
  Chunk(Option<io::Result<Bytes>>),
  Disconnected,
  Cancelled,
}

impl ArchiveEncoder {
  pub fn open(options: EncoderOptions, sink: Box<dyn OutputSink>, cancel: CancellationToken) -> Self {
    let chunk_size = options.chunk_size.max(1);
    let (zip_side, pump_side) = io::duplex(chunk_size);
    let (entries_tx, entries_rx) = mpsc::unbounded_channel();

    let driver = task::spawn(Self::drive(
      ZipFileWriter::with_tokio(zip_side),
      entries_rx,
      options,
      cancel.clone(),
    ));
    let pump = task::spawn(Self::pump(pump_side, sink, chunk_size, cancel.clone()));

    Self {
      entries_tx,
      driver,
      pump,
      options,
      guard: cancel.drop_guard(),
    }
  }

  /// Reserve the next position in the archive for `name`.
  pub fn add_entry(&self, name: EntryName) -> Result<EntryHandle, EncoderError> {
    let (tx, chunks) = mpsc::channel(self.options.entry_queue_length.max(1));
    self
      .entries_tx
      .send(PendingEntry {
        name: name.clone(),
        chunks,
      })
      .map_err(|_| EncoderError::Closed)?;
    Ok(EntryHandle {
      name,
      tx: Some(tx),
      pushed: 0,
    })
  }

  async fn drive(
    mut writer: ZipFileWriter<Compat<DuplexStream>>,
    mut entries_rx: mpsc::UnboundedReceiver<PendingEntry>,
    options: EncoderOptions,
    cancel: CancellationToken,
  ) -> Result<u64, EncoderError> {
    let mut written: u64 = 0;
    while let Some(PendingEntry { name, mut chunks }) = entries_rx.recv().await {
      let mut entry = writer
        .write_entry_stream(options.new_entry(name.clone()))
        .await?;
      let mut len: u64 = 0;
      loop {
        let next = tokio::select! {
          _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
          next = chunks.recv() => next,
        };
        match next {
          Some(EntryChunk::Data(chunk)) => {
            entry.write_all(&chunk).await?;
            len += chunk.len() as u64;
          },
          Some(EntryChunk::End) => break,
          None => return Err(EncoderError::EntryAbandoned(name)),
        }
      }
      entry.close().await?;
      written += 1;
      trace!(%name, len, "entry written");
    }
    /* Writes the central directory. Dropping the returned stream signals EOF to
     * the pump. */
    writer.close().await?;
    Ok(written)
  }

  async fn pump(
    pipe: DuplexStream,
    mut sink: Box<dyn OutputSink>,
    chunk_size: usize,
    cancel: CancellationToken,
  ) -> PumpOutput {
    let mut stream = ReaderStream::with_capacity(pipe, chunk_size);
    let mut total: u64 = 0;
    loop {
      let step = tokio::select! {
        biased;
        _ = cancel.cancelled() => PumpStep::Cancelled,
        chunk = stream.next() => PumpStep::Chunk(chunk),
        _ = sink.closed() => PumpStep::Disconnected,
      };
      let chunk = match step {
        PumpStep::Chunk(None) => return (sink, Ok(total)),
        PumpStep::Chunk(Some(Ok(chunk))) => chunk,
        PumpStep::Chunk(Some(Err(e))) => return (sink, Err(e.into())),
        PumpStep::Disconnected => {
          cancel.cancel();
          return (sink, Err(SinkError::Disconnected));
        },
        PumpStep::Cancelled => return (sink, Err(SinkError::Cancelled)),
      };
      total += chunk.len() as u64;
      let written = tokio::select! {
        _ = cancel.cancelled() => Err(SinkError::Cancelled),
        written = sink.write(chunk) => written,
      };
      if let Err(e) = written {
        /* Stop the driver (and anything feeding it) from producing more. */
        cancel.cancel();
        return (sink, Err(e));
      }
    }
  }

  /// Close the archive after every registered entry has been ended, then
  /// finalize the sink exactly once. Any failure aborts the sink instead.
  ///
  /// Every [`EntryHandle`] must have been ended or dropped before this is
  /// called, or it will wait for them.
  pub async fn end(self) -> Result<ArchiveSummary, EncoderError> {
    let Self {
      entries_tx,
      driver,
      pump,
      guard,
      ..
    } = self;
    drop(entries_tx);
    let driven = driver.await?;
    let (mut sink, pumped) = pump.await?;
    let _ = guard.disarm();
    match (driven, pumped) {
      (Ok(entries), Ok(bytes_written)) => {
        sink.finish().await?;
        debug!(entries, bytes_written, "archive complete");
        Ok(ArchiveSummary {
          entries,
          bytes_written,
        })
      },
      /* A sink failure is the root cause of whatever the driver saw. */
      (_, Err(e)) => {
        sink.abort(&e.to_string()).await;
        Err(e.into())
      },
      (Err(e), Ok(_)) => {
        sink.abort(&e.to_string()).await;
        Err(e)
      },
    }
  }

  /// Stop immediately and make the failure visible through the sink. The
  /// archive is never finalized.
  pub async fn abort(self, reason: &str) {
    let Self {
      entries_tx,
      driver,
      pump,
      guard,
      ..
    } = self;
    drop(entries_tx);
    let cancel = guard.disarm();
    cancel.cancel();
    if let Ok(Err(e)) = driver.await {
      trace!(error = %e, "driver stopped");
    }
    if let Ok((mut sink, _)) = pump.await {
      sink.abort(reason).await;
    }
  }
}
