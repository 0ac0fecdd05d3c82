/*
 * Description: Request handlers for archive creation and progress polling.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

use super::{error::ServiceError, AppState};
use crate::{
  assemble::{Assembler, FailurePolicy, Parallelism, ZipEntryTask, ZipJob},
  destination::StreamSink,
  encoder,
  source::{ByteSource, UploadWriter},
  tuning::{self, DeviceProfile},
  EntryName, JobId, NameFormatError,
};

use axum::{
  body::Body,
  extract::{rejection::QueryRejection, FromRequest, Multipart, Query, Request, State},
  http::{header, HeaderMap, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use serde::Deserialize;
use serde_json::json;
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, info, warn};

/// One remote entry of a json archive request.
#[derive(Clone, Debug, Deserialize)]
pub struct RemoteEntry {
  pub url: String,
  pub name: String,
}

impl RemoteEntry {
  /// The url is checked when the entry is fetched, not here.
  pub fn into_task(self) -> Result<ZipEntryTask, NameFormatError> {
    let Self { url, name } = self;
    Ok(ZipEntryTask::new(
      EntryName::validate(name)?,
      ByteSource::RemoteUrl(url),
    ))
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct ZipParams {
  #[serde(rename = "requestId")]
  pub request_id: Option<String>,
  pub mode: Option<FailurePolicy>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgressParams {
  pub id: Option<String>,
}

pub const DEVICE_MEMORY_HEADER: &str = "device-memory";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/* Chunks of encoded archive buffered ahead of a slow client. */
const RESPONSE_QUEUE_LENGTH: usize = 4;

pub fn archive_file_name(now: OffsetDateTime) -> String {
  let stamp = now
    .format(format_description!("[year][month][day]_[hour][minute]"))
    .unwrap_or_default();
  format!("film_metadata_{}.zip", stamp)
}

fn device_profile(headers: &HeaderMap, default: DeviceProfile) -> DeviceProfile {
  headers
    .get(DEVICE_MEMORY_HEADER)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.trim().parse::<f64>().ok())
    .filter(|gib| gib.is_finite() && *gib > 0.0)
    .map(DeviceProfile::from_device_memory_gib)
    .unwrap_or(default)
}

fn is_multipart(headers: &HeaderMap) -> bool {
  headers
    .get(header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .is_some_and(|value| value.starts_with("multipart/form-data"))
}

fn job_id(requested: Option<String>) -> JobId {
  requested
    .map(|id| id.trim().to_string())
    .filter(|id| !id.is_empty())
    .map(JobId::from)
    .unwrap_or_else(JobId::generate)
}

async fn remote_entries(
  state: &AppState,
  request: Request,
) -> Result<Vec<ZipEntryTask>, ServiceError> {
  let Json(entries) = Json::<Vec<RemoteEntry>>::from_request(request, state).await?;
  entries
    .into_iter()
    .map(|entry| entry.into_task().map_err(ServiceError::from))
    .collect()
}

/// Spool each uploaded part as it arrives. Returns the entries along with any
/// `requestId` field.
async fn uploaded_entries(
  state: &AppState,
  request: Request,
) -> Result<(Vec<ZipEntryTask>, Option<String>), ServiceError> {
  let spool_threshold = state.config().spool_threshold;
  let mut multipart = Multipart::from_request(request, state).await?;
  let mut entries = Vec::new();
  let mut request_id = None;
  while let Some(mut field) = multipart.next_field().await? {
    match field.name() {
      Some("files") | Some("file") => {
        let name = field
          .file_name()
          .map(str::to_string)
          .ok_or_else(|| ServiceError::BadRequest("uploaded part has no file name".to_string()))?;
        let name = EntryName::validate(name)?;
        let mut writer = UploadWriter::new(spool_threshold);
        while let Some(chunk) = field.chunk().await? {
          writer = writer.write_chunk(chunk).await?;
        }
        debug!(%name, len = writer.len(), "spooled upload");
        entries.push(ZipEntryTask::new(
          name,
          ByteSource::UploadedFile(writer.finish()),
        ));
      },
      Some("requestId") => {
        request_id = Some(field.text().await?);
      },
      other => debug!(field = ?other, "ignoring unknown multipart field"),
    }
  }
  Ok((entries, request_id))
}

/// `POST /api/zip`: stream back an archive of the requested remote urls (json
/// body) or uploaded files (multipart body).
pub async fn create_zip(
  State(state): State<AppState>,
  params: Result<Query<ZipParams>, QueryRejection>,
  headers: HeaderMap,
  request: Request,
) -> Result<Response, ServiceError> {
  let Query(params) = params?;
  let (entries, body_request_id) = if is_multipart(&headers) {
    uploaded_entries(&state, request).await?
  } else {
    (remote_entries(&state, request).await?, None)
  };
  if entries.is_empty() {
    return Err(ServiceError::BadRequest("no entries requested".to_string()));
  }

  let id = job_id(params.request_id.or(body_request_id));
  let id_header = HeaderValue::from_str(id.as_str()).map_err(|_| {
    ServiceError::BadRequest("requestId must be printable ascii".to_string())
  })?;

  let profile = device_profile(&headers, state.config().default_profile);
  let tuning = tuning::resolve(profile);
  let policy = params.mode.unwrap_or_default();
  let parallelism = match policy {
    FailurePolicy::Strict => Parallelism::Sequential,
    FailurePolicy::Lenient => Parallelism::batched(&tuning),
  };
  let assembler = Assembler::new(tuning, policy, parallelism, state.store())
    .with_spool_threshold(state.config().spool_threshold);

  let job = ZipJob::new(id.clone(), entries);
  let file_name = archive_file_name(job.created_at);
  assembler.register(&job)?;
  info!(%id, %profile, %policy, total = job.total(), "accepted archive request");

  let (sink, body) = StreamSink::channel(RESPONSE_QUEUE_LENGTH);
  tokio::spawn(async move {
    if let Err(e) = assembler.assemble_registered(job, Box::new(sink)).await {
      warn!(%id, error = %e, "archive request failed");
    }
  });

  Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, "application/zip")
    .header(
      header::CONTENT_DISPOSITION,
      format!("attachment; filename=\"{}\"", file_name),
    )
    .header(REQUEST_ID_HEADER, id_header)
    .body(Body::from_stream(body))
    .map_err(|e| ServiceError::Internal(e.to_string()))
}

/// `GET /api/zip/progress?id=`: the job's record, or 204 if it is unknown.
pub async fn zip_progress(
  State(state): State<AppState>,
  params: Result<Query<ProgressParams>, QueryRejection>,
) -> Result<Response, ServiceError> {
  let Query(params) = params?;
  let id = params
    .id
    .filter(|id| !id.is_empty())
    .ok_or_else(|| ServiceError::BadRequest("missing id".to_string()))?;
  Ok(match state.store().get(&JobId::from(id)) {
    Some(record) => Json(record).into_response(),
    None => StatusCode::NO_CONTENT.into_response(),
  })
}

pub async fn health() -> impl IntoResponse {
  Json(json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "time": encoder::local_now().unix_timestamp(),
  }))
}
