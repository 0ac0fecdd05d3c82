/*
 * Description: The http service: archive creation, progress polling and a
 * health check.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! The http service: archive creation, progress polling and a health check.
//!
//! - `POST /api/zip` streams back an archive of remote urls (json body) or
//!   uploaded files (multipart body).
//! - `GET /api/zip/progress?id=` returns a [`ProgressRecord`], or 204 if the
//!   job is unknown.
//! - `GET /health`.
//!
//! [`ProgressRecord`]: crate::progress::ProgressRecord

pub mod error;
pub mod handlers;

use crate::{
  assemble::DEFAULT_SPOOL_THRESHOLD,
  progress::{MemoryProgressStore, ProgressStore},
  tuning::DeviceProfile,
};

use axum::{
  extract::DefaultBodyLimit,
  routing::{get, post},
  Router,
};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use tokio::{io, net::TcpListener, task, time};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use std::{sync::Arc, time::Duration};

#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  /// pretty
  #[default]
  Pretty,
  /// json
  Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
  /// Address to listen on.
  #[serde(default = "default_listen")]
  pub listen: String,

  #[serde(default)]
  pub log_format: LogFormat,

  /// How long a progress record survives without updates.
  #[serde(default = "default_progress_ttl_secs")]
  pub progress_ttl_secs: u64,

  /// How often expired progress records are swept.
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,

  /// Largest request body accepted, including every uploaded file.
  #[serde(default = "default_max_upload_bytes")]
  pub max_upload_bytes: usize,

  /// Tuning used when the client sends no `Device-Memory` hint.
  #[serde(default)]
  pub default_profile: DeviceProfile,

  /// Uploads and staged remote bodies beyond this size are spooled to disk.
  #[serde(default = "default_spool_threshold")]
  pub spool_threshold: usize,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
      log_format: LogFormat::default(),
      progress_ttl_secs: default_progress_ttl_secs(),
      sweep_interval_secs: default_sweep_interval_secs(),
      max_upload_bytes: default_max_upload_bytes(),
      default_profile: DeviceProfile::default(),
      spool_threshold: default_spool_threshold(),
    }
  }
}

fn default_listen() -> String { "127.0.0.1:8080".to_string() }

fn default_progress_ttl_secs() -> u64 { 300 }

fn default_sweep_interval_secs() -> u64 { 60 }

fn default_max_upload_bytes() -> usize { 512 * 1024 * 1024 }

fn default_spool_threshold() -> usize { DEFAULT_SPOOL_THRESHOLD }

impl ServiceConfig {
  pub fn progress_ttl(&self) -> Duration { Duration::from_secs(self.progress_ttl_secs) }

  pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_secs.max(1)) }
}

/// Shared application state, cloned into each handler.
#[derive(Clone)]
pub struct AppState {
  inner: Arc<AppStateInner>,
}

struct AppStateInner {
  config: ServiceConfig,
  store: Arc<dyn ProgressStore>,
}

impl AppState {
  pub fn new(config: ServiceConfig, store: Arc<dyn ProgressStore>) -> Self {
    Self {
      inner: Arc::new(AppStateInner { config, store }),
    }
  }

  /// State backed by an in-process store with the configured ttl.
  pub fn in_memory(config: ServiceConfig) -> Self {
    let store = Arc::new(MemoryProgressStore::new(config.progress_ttl()));
    Self::new(config, store)
  }

  pub fn config(&self) -> &ServiceConfig { &self.inner.config }

  pub fn store(&self) -> Arc<dyn ProgressStore> { self.inner.store.clone() }
}

pub fn router(state: AppState) -> Router {
  let body_limit = state.config().max_upload_bytes;
  Router::new()
    .route("/api/zip", post(handlers::create_zip))
    .route("/api/zip/progress", get(handlers::zip_progress))
    .route("/health", get(handlers::health))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Periodically drop expired progress records until `stop` is cancelled.
pub fn spawn_sweeper(
  store: Arc<dyn ProgressStore>,
  every: Duration,
  stop: CancellationToken,
) -> task::JoinHandle<()> {
  task::spawn(async move {
    let mut interval = time::interval(every);
    loop {
      tokio::select! {
        _ = stop.cancelled() => break,
        _ = interval.tick() => {
          let removed = store.sweep();
          debug!(removed, "progress sweep");
        },
      }
    }
  })
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn serve(
  listener: TcpListener,
  state: AppState,
  shutdown: CancellationToken,
) -> io::Result<()> {
  let sweeper = spawn_sweeper(
    state.store(),
    state.config().sweep_interval(),
    shutdown.clone(),
  );
  info!(addr = %listener.local_addr()?, "listening");
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;
  shutdown.cancel();
  let _ = sweeper.await;
  Ok(())
}
