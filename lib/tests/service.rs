/*
 * Description: Exercise the http endpoints through the router.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

mod common;

use common::{photo_bytes, read_archive, wait_for_done, RemoteServer};

use libfilm_zip::{
  poll::{PollKind, PollUpdate, ProgressPoller},
  progress::{ProgressPatch, ProgressRecord},
  service::{self, AppState, ServiceConfig},
  JobId,
};

use axum::{
  body::{self, Body},
  http::{header, Request, StatusCode},
  response::Response,
  Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use std::time::Duration;

fn setup(config: ServiceConfig) -> (Router, AppState) {
  let state = AppState::in_memory(config);
  (service::router(state.clone()), state)
}

async fn post_json(router: Router, uri: &str, body: Value) -> Response {
  let request = Request::builder()
    .method("POST")
    .uri(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap();
  router.oneshot(request).await.unwrap()
}

async fn get(router: Router, uri: &str) -> Response {
  let request = Request::builder()
    .method("GET")
    .uri(uri)
    .body(Body::empty())
    .unwrap();
  router.oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
  let bytes = body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  serde_json::from_slice(&bytes).unwrap()
}

const BOUNDARY: &str = "film-zip-test-boundary";

fn multipart_body(files: &[(&str, &[u8])], request_id: Option<&str>) -> Vec<u8> {
  let mut body = Vec::new();
  if let Some(id) = request_id {
    body.extend_from_slice(
      format!(
        "--{}\r\nContent-Disposition: form-data; name=\"requestId\"\r\n\r\n{}\r\n",
        BOUNDARY, id
      )
      .as_bytes(),
    );
  }
  for (name, contents) in files {
    body.extend_from_slice(
      format!(
        "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: image/jpeg\r\n\r\n",
        BOUNDARY, name
      )
      .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(b"\r\n");
  }
  body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
  body
}

async fn post_multipart(router: Router, uri: &str, body: Vec<u8>) -> Response {
  let request = Request::builder()
    .method("POST")
    .uri(uri)
    .header(
      header::CONTENT_TYPE,
      format!("multipart/form-data; boundary={}", BOUNDARY),
    )
    .body(Body::from(body))
    .unwrap();
  router.oneshot(request).await.unwrap()
}

#[tokio::test]
async fn json_request_streams_archive() {
  let remote = RemoteServer::start().await;
  let (router, state) = setup(ServiceConfig::default());
  let response = post_json(
    router,
    "/api/zip?requestId=json-1",
    json!([
      {"url": remote.url("/photo/3000/a"), "name": "a.jpg"},
      {"url": remote.url("/missing"), "name": "b.jpg"},
      {"url": remote.url("/photo/10/c"), "name": "c.jpg"},
    ]),
  )
  .await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()[header::CONTENT_TYPE],
    "application/zip"
  );
  assert_eq!(response.headers()["x-request-id"], "json-1");
  let disposition = response.headers()[header::CONTENT_DISPOSITION]
    .to_str()
    .unwrap()
    .to_string();
  assert!(disposition.starts_with("attachment; filename=\"film_metadata_"));
  assert!(disposition.ends_with(".zip\""));
  /* film_metadata_YYYYMMDD_HHmm.zip */
  assert_eq!(
    disposition.len(),
    "attachment; filename=\"film_metadata_20240101_0000.zip\"".len()
  );

  let bytes = body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  assert_eq!(read_archive(&bytes), vec![
    ("a.jpg".to_string(), photo_bytes("a", 3000)),
    ("b.jpg".to_string(), vec![]),
    ("c.jpg".to_string(), photo_bytes("c", 10)),
  ]);

  let store = state.store();
  let record = wait_for_done(store.as_ref(), &JobId::from("json-1")).await;
  assert_eq!(record, ProgressRecord {
    processed: 3,
    total: 3,
    done: true,
    error: None,
  });
}

#[tokio::test]
async fn multipart_uploads_are_zipped_in_order() {
  /* A small threshold puts the larger upload on disk. */
  let (router, state) = setup(ServiceConfig {
    spool_threshold: 1024,
    ..Default::default()
  });
  let big = photo_bytes("big", 100_000);
  let body = multipart_body(
    &[("roll/big.jpg", &big), ("small.jpg", b"tiny"), ("empty.jpg", b"")],
    Some("upload-1"),
  );
  let response = post_multipart(router, "/api/zip", body).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers()["x-request-id"], "upload-1");

  let bytes = body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  assert_eq!(read_archive(&bytes), vec![
    ("roll/big.jpg".to_string(), big),
    ("small.jpg".to_string(), b"tiny".to_vec()),
    ("empty.jpg".to_string(), vec![]),
  ]);
  let store = state.store();
  assert!(wait_for_done(store.as_ref(), &JobId::from("upload-1")).await.done);
}

#[tokio::test]
async fn strict_mode_errors_the_response_body() {
  let remote = RemoteServer::start().await;
  let (router, state) = setup(ServiceConfig::default());
  let response = post_json(
    router,
    "/api/zip?requestId=strict-1&mode=strict",
    json!([
      {"url": remote.url("/photo/3000/a"), "name": "a.jpg"},
      {"url": remote.url("/missing"), "name": "b.jpg"},
    ]),
  )
  .await;
  assert_eq!(response.status(), StatusCode::OK);
  assert!(body::to_bytes(response.into_body(), usize::MAX)
    .await
    .is_err());

  let store = state.store();
  let record = wait_for_done(store.as_ref(), &JobId::from("strict-1")).await;
  assert!(!record.error.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn unknown_job_polls_as_no_content() {
  let (router, _state) = setup(ServiceConfig::default());
  let response = get(router, "/api/zip/progress?id=never-created").await;
  assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn polling_a_finished_job_is_idempotent() {
  let (router, state) = setup(ServiceConfig::default());
  let id = JobId::from("done-1");
  let store = state.store();
  store.create(&id, 2).unwrap();
  store.update(&id, ProgressPatch::EntryFinished);
  store.update(&id, ProgressPatch::Completed);

  let mut bodies = Vec::new();
  for _ in 0..3 {
    let response = get(router.clone(), "/api/zip/progress?id=done-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    bodies.push(json_body(response).await);
  }
  assert!(bodies.iter().all(|b| *b == bodies[0]));
  assert_eq!(
    bodies[0],
    json!({"processed": 2, "total": 2, "done": true})
  );

  store.evict(&id);
  let response = get(router, "/api/zip/progress?id=done-1").await;
  assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn progress_requires_an_id() {
  let (router, _state) = setup(ServiceConfig::default());
  let response = get(router, "/api/zip/progress").await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn running_job_ids_conflict() {
  let (router, state) = setup(ServiceConfig::default());
  state.store().create(&JobId::from("busy"), 1).unwrap();
  let response = post_json(
    router,
    "/api/zip?requestId=busy",
    json!([{"url": "https://example.com/a.jpg", "name": "a.jpg"}]),
  )
  .await;
  assert_eq!(response.status(), StatusCode::CONFLICT);
  assert!(json_body(response).await["error"]
    .as_str()
    .unwrap()
    .contains("busy"));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
  let (router, _state) = setup(ServiceConfig::default());

  let response = post_json(router.clone(), "/api/zip", json!([])).await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);

  let response = post_json(
    router.clone(),
    "/api/zip",
    json!([{"url": "https://example.com/a.jpg", "name": "../a.jpg"}]),
  )
  .await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);

  let response = post_json(router.clone(), "/api/zip?mode=sloppy", json!([])).await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);

  let request = Request::builder()
    .method("POST")
    .uri("/api/zip")
    .header(header::CONTENT_TYPE, "text/plain")
    .body(Body::from("a.jpg"))
    .unwrap();
  let response = router.oneshot(request).await.unwrap();
  assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn oversized_uploads_are_refused() {
  let (router, _state) = setup(ServiceConfig {
    max_upload_bytes: 1024,
    ..Default::default()
  });
  let big = photo_bytes("big", 10_000);
  let response = post_multipart(router, "/api/zip", multipart_body(&[("big.jpg", &big)], None)).await;
  assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn health_reports_ok() {
  let (router, _state) = setup(ServiceConfig::default());
  let response = get(router, "/health").await;
  assert_eq!(response.status(), StatusCode::OK);
  let body = json_body(response).await;
  assert_eq!(body["status"], "ok");
  assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
  assert!(body["time"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn poller_follows_a_job_to_completion() {
  let remote = RemoteServer::start().await;
  let state = AppState::in_memory(ServiceConfig::default());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let shutdown = CancellationToken::new();
  let server = tokio::spawn(service::serve(listener, state, shutdown.clone()));
  let base = format!("http://{}/", addr);

  let poller = ProgressPoller::new(&base, JobId::from("watched"), PollKind::Zip)
    .unwrap()
    .with_interval(Duration::from_millis(20));
  let stop = CancellationToken::new();
  let watcher = tokio::spawn(async move {
    let mut seen = Vec::new();
    let record = poller
      .watch(stop, |update| seen.push(update.clone()))
      .await
      .unwrap();
    (record, seen)
  });

  let urls: Vec<Value> = (0..4)
    .map(|i| json!({"url": remote.url(&format!("/delayed/50/{}", i)), "name": format!("{}.jpg", i)}))
    .collect();
  let response = reqwest::Client::new()
    .post(format!("{}api/zip?requestId=watched", base))
    .json(&urls)
    .send()
    .await
    .unwrap();
  assert_eq!(response.status().as_u16(), 200);
  let archive = response.bytes().await.unwrap();
  assert_eq!(read_archive(&archive).len(), 4);

  let (record, seen) = tokio::time::timeout(Duration::from_secs(10), watcher)
    .await
    .unwrap()
    .unwrap();
  assert!(record.done);
  assert_eq!(record.processed, 4);
  assert_eq!(record.error, None);

  /* processed never goes backwards and never passes total. */
  let mut last = 0;
  for update in seen {
    if let PollUpdate::Progress(record) = update {
      assert!(record.processed >= last);
      assert!(record.processed <= record.total);
      last = record.processed;
    }
  }

  shutdown.cancel();
  server.await.unwrap().unwrap();
}

#[tokio::test]
async fn poller_can_be_stopped() {
  let state = AppState::in_memory(ServiceConfig::default());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let shutdown = CancellationToken::new();
  let server = tokio::spawn(service::serve(listener, state, shutdown.clone()));

  let poller = ProgressPoller::new(&format!("http://{}", addr), JobId::from("nobody"), PollKind::Upload)
    .unwrap()
    .with_interval(Duration::from_millis(10));
  let stop = CancellationToken::new();
  let mut pending = 0;
  let watch = poller.watch(stop.clone(), |update| {
    assert_eq!(*update, PollUpdate::Pending);
    pending += 1;
  });
  let stopper = async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();
  };
  let (result, ()) = tokio::join!(watch, stopper);
  assert!(matches!(result, Err(libfilm_zip::poll::PollError::Stopped)));
  assert!(pending > 0);

  shutdown.cancel();
  server.await.unwrap().unwrap();
}
