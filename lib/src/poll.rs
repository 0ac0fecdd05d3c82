/*
 * Description: Poll a running service for the progress of one job.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Poll a running service for the progress of one job.

use crate::{progress::ProgressRecord, JobId};

use displaydoc::Display;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::time::Duration;

#[derive(Debug, Display, Error)]
pub enum PollError {
  /// invalid server url {0:?}: {1}
  InvalidServer(String, String),
  /// failed to construct http client: {0}
  Client(#[source] reqwest::Error),
  /// progress request failed: {0}
  Request(#[source] reqwest::Error),
  /// progress endpoint returned status {0}
  Status(StatusCode),
  /// gave up after {0} consecutive failed polls: {1}
  GaveUp(u32, String),
  /// polling was stopped
  Stopped,
}

impl PollError {
  fn is_transient(&self) -> bool {
    match self {
      Self::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
      Self::Status(status) => status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS,
      _ => false,
    }
  }
}

/// What kind of job is being watched, which determines how often to ask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PollKind {
  #[default]
  Zip,
  Upload,
}

impl PollKind {
  pub fn interval(&self) -> Duration {
    match self {
      Self::Zip => Duration::from_millis(400),
      Self::Upload => Duration::from_secs(1),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollUpdate {
  /// The server doesn't know the job (yet, or any more).
  Pending,
  Progress(ProgressRecord),
}

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProgressPoller {
  client: Client,
  endpoint: Url,
  id: JobId,
  interval: Duration,
  max_consecutive_failures: u32,
}

impl ProgressPoller {
  /// `server` is the base url of the service, e.g. `http://localhost:8080/`.
  pub fn new(server: &str, id: JobId, kind: PollKind) -> Result<Self, PollError> {
    let endpoint = Url::parse(server)
      .and_then(|base| base.join("/api/zip/progress"))
      .map_err(|e| PollError::InvalidServer(server.to_string(), e.to_string()))?;
    let client = Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(PollError::Client)?;
    Ok(Self {
      client,
      endpoint,
      id,
      interval: kind.interval(),
      max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
    })
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
    self.max_consecutive_failures = max;
    self
  }

  pub fn id(&self) -> &JobId { &self.id }

  pub async fn poll_once(&self) -> Result<PollUpdate, PollError> {
    let response = self
      .client
      .get(self.endpoint.clone())
      .query(&[("id", self.id.as_str())])
      .send()
      .await
      .map_err(PollError::Request)?;
    match response.status() {
      StatusCode::NO_CONTENT => Ok(PollUpdate::Pending),
      StatusCode::OK => {
        let record: ProgressRecord = response.json().await.map_err(PollError::Request)?;
        Ok(PollUpdate::Progress(record))
      },
      status => Err(PollError::Status(status)),
    }
  }

  /// Poll at a fixed interval until the job is done or `stop` is cancelled,
  /// reporting every successful poll to `on_update`. Returns the terminal
  /// record.
  pub async fn watch(
    &self,
    stop: CancellationToken,
    mut on_update: impl FnMut(&PollUpdate),
  ) -> Result<ProgressRecord, PollError> {
    let mut ticks = time::interval(self.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    loop {
      tokio::select! {
        _ = stop.cancelled() => return Err(PollError::Stopped),
        _ = ticks.tick() => (),
      }
      let polled = tokio::select! {
        _ = stop.cancelled() => return Err(PollError::Stopped),
        polled = self.poll_once() => polled,
      };
      match polled {
        Ok(update) => {
          failures = 0;
          on_update(&update);
          if let PollUpdate::Progress(record) = update {
            if record.done {
              debug!(id = %self.id, ?record, "job finished");
              return Ok(record);
            }
          }
        },
        Err(e) if e.is_transient() => {
          failures += 1;
          if failures >= self.max_consecutive_failures {
            return Err(PollError::GaveUp(failures, e.to_string()));
          }
          warn!(id = %self.id, failures, error = %e, "progress poll failed, retrying");
        },
        Err(e) => return Err(e),
      }
    }
  }
}
