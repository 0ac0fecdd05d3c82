/*
 * Description: Where the command line sends a finished archive.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Where the command line sends a finished archive.

use libfilm_zip::destination::{
  self as lib_destination, BufferSink, BufferedArchive, FileSink, OutputSink, SinkCapabilities,
  SinkChoice, StreamSink,
};

use bytes::Bytes;
use clap::{Args, ValueEnum};
use eyre::{self, WrapErr};
use futures::StreamExt;
use tokio::io::{self, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use std::path::PathBuf;

/* How many chunks may wait between the encoder and stdout. */
const STDOUT_QUEUE_LENGTH: usize = 8;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum DestinationBehavior {
  /// Create the file if new, or replace it if it exists.
  AlwaysTruncate,
  /// Fail if the file already exists.
  CreateNew,
}

impl From<lib_destination::DestinationBehavior> for DestinationBehavior {
  fn from(x: lib_destination::DestinationBehavior) -> Self {
    match x {
      lib_destination::DestinationBehavior::AlwaysTruncate => Self::AlwaysTruncate,
      lib_destination::DestinationBehavior::CreateNew => Self::CreateNew,
    }
  }
}

impl From<DestinationBehavior> for lib_destination::DestinationBehavior {
  fn from(x: DestinationBehavior) -> Self {
    match x {
      DestinationBehavior::AlwaysTruncate => Self::AlwaysTruncate,
      DestinationBehavior::CreateNew => Self::CreateNew,
    }
  }
}

impl Default for DestinationBehavior {
  fn default() -> Self { lib_destination::DestinationBehavior::default().into() }
}

#[derive(Clone, Debug, Args)]
pub struct Output {
  /// Output zip file path. `-` writes the archive to stdout as it is
  /// produced.
  ///
  /// A file is written beside its destination and only moved into place once
  /// the archive is complete.
  #[arg(long, short)]
  pub output: PathBuf,
  /// Hold the whole archive in memory and save it once it is complete.
  #[arg(long, conflicts_with = "behavior")]
  pub buffered: bool,
  #[arg(value_enum, default_value_t, long)]
  pub behavior: DestinationBehavior,
}

/// The second half of an [`Output`]: whatever has to happen alongside (or
/// after) assembly to get the bytes to their destination.
pub enum Delivery {
  Stdout(ReceiverStream<io::Result<Bytes>>),
  File(PathBuf),
  Buffered(BufferedArchive, PathBuf),
}

impl Output {
  fn capabilities(&self) -> SinkCapabilities {
    SinkCapabilities {
      streaming: self.output.as_os_str() == "-",
      writable_path: None,
    }
  }

  pub async fn open(self) -> eyre::Result<(Box<dyn OutputSink>, Delivery)> {
    let mut capabilities = self.capabilities();
    if !capabilities.streaming && !self.buffered {
      capabilities.writable_path = SinkCapabilities::probe_path(&self.output).await;
    }
    match capabilities.choose() {
      SinkChoice::Stream => {
        let (sink, body) = StreamSink::channel(STDOUT_QUEUE_LENGTH);
        Ok((Box::new(sink), Delivery::Stdout(body)))
      },
      SinkChoice::WritableFile(path) => {
        let sink = FileSink::create(&path, self.behavior.into())
          .await
          .wrap_err_with(|| format!("failed to open output file {}", path.display()))?;
        Ok((Box::new(sink), Delivery::File(path)))
      },
      SinkChoice::BufferThenSave => {
        let (sink, archive) = BufferSink::new();
        Ok((Box::new(sink), Delivery::Buffered(archive, self.output)))
      },
    }
  }
}

impl Delivery {
  /// Must be polled concurrently with assembly: a stdout pipe only drains
  /// while this runs.
  pub async fn complete(self) -> eyre::Result<()> {
    match self {
      Self::Stdout(mut body) => {
        let mut stdout = io::stdout();
        while let Some(chunk) = body.next().await {
          let chunk = chunk.wrap_err("archive was abandoned")?;
          stdout
            .write_all(&chunk)
            .await
            .wrap_err("failed to write to stdout")?;
        }
        stdout.flush().await.wrap_err("failed to flush stdout")?;
      },
      Self::File(path) => {
        info!(path = %path.display(), "archive written");
      },
      Self::Buffered(archive, path) => {
        let written = archive
          .save_to(&path)
          .await
          .wrap_err_with(|| format!("failed to save archive to {}", path.display()))?;
        info!(path = %path.display(), written, "archive saved");
      },
    }
    Ok(())
  }
}
