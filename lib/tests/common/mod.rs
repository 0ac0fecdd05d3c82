/*
 * Description: Helpers shared by the integration tests.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

#![allow(dead_code)]

use libfilm_zip::{
  progress::{ProgressRecord, ProgressStore},
  JobId,
};

use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
  routing::get,
  Router,
};
use tokio::net::TcpListener;

use std::{
  io::Read,
  net::SocketAddr,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

pub fn read_archive(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
  let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
  (0..archive.len())
    .map(|i| {
      let mut file = archive.by_index(i).unwrap();
      let mut contents = Vec::new();
      file.read_to_end(&mut contents).unwrap();
      (file.name().to_string(), contents)
    })
    .collect()
}

pub fn entry_names(bytes: &[u8]) -> Vec<String> {
  read_archive(bytes).into_iter().map(|(name, _)| name).collect()
}

/// Deterministic "photo" contents for `name`.
pub fn photo_bytes(name: &str, len: usize) -> Vec<u8> {
  name
    .bytes()
    .cycle()
    .zip(0..len)
    .map(|(b, i)| b.wrapping_add(i as u8))
    .collect()
}

#[derive(Clone, Default)]
struct Remote {
  flaky_attempts: Arc<AtomicUsize>,
}

async fn photo(Path((len, name)): Path<(usize, String)>) -> impl IntoResponse {
  photo_bytes(&name, len)
}

async fn delayed_photo(Path((millis, name)): Path<(u64, String)>) -> impl IntoResponse {
  tokio::time::sleep(Duration::from_millis(millis)).await;
  photo_bytes(&name, 1000)
}

async fn missing() -> impl IntoResponse { StatusCode::NOT_FOUND }

/* Fails twice with a 503, then succeeds. */
async fn flaky(State(remote): State<Remote>) -> impl IntoResponse {
  if remote.flaky_attempts.fetch_add(1, Ordering::SeqCst) < 2 {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
  } else {
    photo_bytes("flaky", 500).into_response()
  }
}

async fn hang() -> impl IntoResponse {
  tokio::time::sleep(Duration::from_secs(600)).await;
  StatusCode::OK
}

/// Serves stand-in remote photos on an ephemeral port.
pub struct RemoteServer {
  pub addr: SocketAddr,
  remote: Remote,
}

impl RemoteServer {
  pub async fn start() -> Self {
    let remote = Remote::default();
    let app = Router::new()
      .route("/photo/{len}/{name}", get(photo))
      .route("/delayed/{millis}/{name}", get(delayed_photo))
      .route("/missing", get(missing))
      .route("/flaky", get(flaky))
      .route("/hang", get(hang))
      .with_state(remote.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    Self { addr, remote }
  }

  pub fn url(&self, path: &str) -> String { format!("http://{}{}", self.addr, path) }

  pub fn flaky_attempts(&self) -> usize { self.remote.flaky_attempts.load(Ordering::SeqCst) }
}

/// The record is marked done just after the last byte is handed off, so give
/// it a moment.
pub async fn wait_for_done(store: &dyn ProgressStore, id: &JobId) -> ProgressRecord {
  for _ in 0..200 {
    if let Some(record) = store.get(id) {
      if record.done {
        return record;
      }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("job {} never finished: {:?}", id, store.get(id));
}
