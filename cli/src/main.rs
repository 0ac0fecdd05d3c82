/*
 * Description: Stream zip archives of remote photos and serve their progress.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Stream zip archives of remote photos and serve their progress.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
#![warn(missing_docs)]
/* Note: run clippy with: rustup run nightly cargo-clippy! */
#![deny(unsafe_code)]
/* Ensure any doctest warnings fails the doctest! */
#![doc(test(attr(deny(warnings))))]
/* Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be
 * copied and pasted across crates, but there doesn't appear to be a way to include inner
 * attributes from a common source. */
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
/* It is often more clear to show that nothing is being moved. */
#![allow(clippy::match_ref_pats)]
/* Subjective style. */
#![allow(
  clippy::derived_hash_with_manual_eq,
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::single_component_path_imports
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
/* Arc<Mutex> can be more clear than needing to grok Orderings. */
#![allow(clippy::mutex_atomic)]

mod config;
mod destination;
mod zip;

mod cli {
  mod args {
    use crate::{
      config::{LogFormat, ServeArgs},
      destination::Output,
      zip::ZipOutputOptions,
    };

    use libfilm_zip::poll;

    use clap::{Parser, Subcommand, ValueEnum};

    #[derive(Copy, Clone, Debug, Default, ValueEnum)]
    pub enum PollKind {
      /// An archive being assembled.
      #[default]
      Zip,
      /// A file upload.
      Upload,
    }

    impl From<PollKind> for poll::PollKind {
      fn from(x: PollKind) -> Self {
        match x {
          PollKind::Zip => Self::Zip,
          PollKind::Upload => Self::Upload,
        }
      }
    }

    #[derive(Subcommand, Debug)]
    pub enum Command {
      /// Serve the archive and progress endpoints over http until interrupted.
      Serve {
        #[command(flatten)]
        serve: ServeArgs,
      },
      /// Consume a json list of `{"url": ..., "name": ...}` objects over stdin
      /// and write those urls into a zip file at `output`, in order.
      Zip {
        #[command(flatten)]
        output: Output,
        #[command(flatten)]
        zip_options: ZipOutputOptions,
      },
      /// Follow the progress of a job on a running server, writing each update
      /// to stdout as a json line.
      Watch {
        /// Base url of the server, e.g. `http://localhost:8080`.
        #[arg(long)]
        server: String,
        /// Id of the job to follow.
        #[arg(long)]
        id: String,
        #[arg(value_enum, long, default_value_t)]
        kind: PollKind,
      },
    }

    /// Assemble zip archives from remote urls and uploaded files, streaming
    /// them out as they are produced.
    #[derive(Parser, Debug)]
    #[command(author, version, about, long_about = None)]
    pub struct Cli {
      /// How log lines are written to stderr. For `serve`, this takes
      /// precedence over the config file.
      #[arg(value_enum, long, global = true)]
      pub log_format: Option<LogFormat>,
      #[command(subcommand)]
      pub command: Command,
    }
  }
  pub use args::Cli;

  mod run {
    use super::args::{Cli, Command};
    use crate::{config::init_tracing, zip::ZipSettings};

    use libfilm_zip::{
      assemble::ZipJob,
      poll::{PollUpdate, ProgressPoller},
      progress::MemoryProgressStore,
      service::{self, handlers::RemoteEntry, AppState, LogFormat},
      JobId,
    };

    use eyre::{self, WrapErr};
    use tokio::{io::AsyncReadExt, net::TcpListener, signal};
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use std::sync::Arc;

    /// Cancel the returned token on ctrl-c.
    fn interrupt_token() -> CancellationToken {
      let token = CancellationToken::new();
      let interrupted = token.clone();
      tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
          info!("interrupted");
          interrupted.cancel();
        }
      });
      token
    }

    impl Cli {
      pub async fn run(self) -> eyre::Result<()> {
        let Self {
          log_format,
          command,
        } = self;

        match command {
          Command::Serve { serve } => {
            let config = serve.resolve(log_format)?;
            init_tracing(config.log_format);
            let listener = TcpListener::bind(&config.listen)
              .await
              .wrap_err_with(|| format!("failed to listen on {}", config.listen))?;
            let shutdown = interrupt_token();
            service::serve(listener, AppState::in_memory(config), shutdown)
              .await
              .wrap_err("server failed")?;
          },
          Command::Zip {
            output,
            zip_options,
          } => {
            init_tracing(log_format.map(LogFormat::from).unwrap_or_default());
            let settings: ZipSettings = zip_options.try_into()?;

            let mut manifest = String::new();
            tokio::io::stdin()
              .read_to_string(&mut manifest)
              .await
              .wrap_err("failed to read manifest from stdin")?;
            let entries: Vec<RemoteEntry> =
              serde_json::from_str(&manifest).wrap_err("failed to parse manifest")?;
            let tasks = entries
              .into_iter()
              .map(RemoteEntry::into_task)
              .collect::<Result<Vec<_>, _>>()
              .wrap_err("invalid entry name in manifest")?;

            let assembler = settings.assembler(Arc::new(MemoryProgressStore::default()));
            let (sink, delivery) = output.open().await?;
            let job = ZipJob::new(JobId::generate(), tasks);
            let (assembled, delivered) =
              tokio::join!(assembler.assemble(job, sink), delivery.complete());
            let report = assembled.wrap_err("failed to assemble archive")?;
            delivered?;
            for failed in report.entries.iter().filter(|entry| entry.error.is_some()) {
              warn!(name = %failed.name, error = ?failed.error, "entry written empty");
            }
            info!(
              id = %report.id,
              entries = report.summary.entries,
              bytes = report.summary.bytes_written,
              failed = report.failed(),
              "archive complete"
            );
          },
          Command::Watch { server, id, kind } => {
            init_tracing(log_format.map(LogFormat::from).unwrap_or_default());
            let poller = ProgressPoller::new(&server, JobId::from(id), kind.into())?;
            let record = poller
              .watch(interrupt_token(), |update| {
                if let PollUpdate::Progress(record) = update {
                  if let Ok(line) = serde_json::to_string(record) {
                    println!("{}", line);
                  }
                }
              })
              .await
              .wrap_err_with(|| format!("failed to follow job {}", poller.id()))?;
            if let Some(error) = record.error {
              return Err(eyre::eyre!("job {} failed: {}", poller.id(), error));
            }
          },
        }

        Ok(())
      }
    }
  }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
  use clap::Parser as _;
  use eyre::WrapErr;

  let cli = cli::Cli::parse();
  cli.run().await.wrap_err("top-level error")?;
  Ok(())
}
