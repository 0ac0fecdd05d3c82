/*
 * Description: Server configuration from a toml file and command-line flags.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Server configuration from a toml file and command-line flags.

use crate::zip::Profile;

use libfilm_zip::service::{self as lib_service, ServiceConfig};

use clap::{Args, ValueEnum};
use eyre::{self, WrapErr};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
  /// Human-readable lines.
  Pretty,
  /// One json object per line.
  Json,
}

impl From<LogFormat> for lib_service::LogFormat {
  fn from(x: LogFormat) -> Self {
    match x {
      LogFormat::Pretty => Self::Pretty,
      LogFormat::Json => Self::Json,
    }
  }
}

/// Logs go to stderr so that an archive may be written to stdout.
pub fn init_tracing(format: lib_service::LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr);
  match format {
    lib_service::LogFormat::Pretty => builder.init(),
    lib_service::LogFormat::Json => builder.json().init(),
  }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  server: ServiceConfig,
}

#[derive(Clone, Debug, Default, Args)]
pub struct ServeArgs {
  /// A toml file with a `[server]` table. Flags take precedence over it.
  #[arg(long)]
  pub config: Option<PathBuf>,
  /// Address to listen on, e.g. `0.0.0.0:8080`.
  #[arg(long)]
  pub listen: Option<String>,
  /// Seconds a progress record survives without updates.
  #[arg(long)]
  pub progress_ttl_secs: Option<u64>,
  /// Largest accepted request body in bytes.
  #[arg(long)]
  pub max_upload_bytes: Option<usize>,
  /// Tuning used when a client sends no `Device-Memory` hint.
  #[arg(long, value_enum)]
  pub default_profile: Option<Profile>,
  /// Uploads larger than this many bytes are spooled to disk.
  #[arg(long)]
  pub spool_threshold: Option<usize>,
}

fn read_config_file(path: &Path) -> eyre::Result<ServiceConfig> {
  let contents = std::fs::read_to_string(path)
    .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
  let ConfigFile { server } = toml::from_str(&contents)
    .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
  Ok(server)
}

impl ServeArgs {
  pub fn resolve(self, log_format: Option<LogFormat>) -> eyre::Result<ServiceConfig> {
    let Self {
      config,
      listen,
      progress_ttl_secs,
      max_upload_bytes,
      default_profile,
      spool_threshold,
    } = self;
    let mut resolved = match config {
      Some(path) => read_config_file(&path)?,
      None => ServiceConfig::default(),
    };
    if let Some(listen) = listen {
      resolved.listen = listen;
    }
    if let Some(log_format) = log_format {
      resolved.log_format = log_format.into();
    }
    if let Some(ttl) = progress_ttl_secs {
      resolved.progress_ttl_secs = ttl;
    }
    if let Some(max) = max_upload_bytes {
      resolved.max_upload_bytes = max;
    }
    if let Some(profile) = default_profile {
      resolved.default_profile = profile.into();
    }
    if let Some(threshold) = spool_threshold {
      resolved.spool_threshold = threshold;
    }
    Ok(resolved)
  }
}
