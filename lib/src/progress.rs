/*
 * Description: The request-keyed progress table polled by clients while an
 * archive is being assembled.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! The request-keyed progress table polled by clients while an archive is
//! being assembled.
//!
//! Records are process-local. A poll which lands on another instance just sees
//! "not found" and keeps waiting.

use crate::JobId;

use displaydoc::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use std::{collections::HashMap, time::Duration};

/// Snapshot of one job, as served to pollers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
  pub processed: usize,
  pub total: usize,
  pub done: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ProgressRecord {
  pub fn new(total: usize) -> Self {
    Self {
      total,
      ..Default::default()
    }
  }

  /// Whole percent complete. Never reports 100 until the job is actually done,
  /// since the archive trailer is still outstanding after the last entry.
  pub fn percent(&self) -> u8 {
    if self.done {
      return 100;
    }
    if self.total == 0 {
      return 0;
    }
    let pct = (self.processed.min(self.total) * 100) / self.total;
    pct.min(99) as u8
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgressPatch {
  /// One more entry was written (or skipped, when failures are tolerated).
  EntryFinished,
  /// The archive was finalized and delivered.
  Completed,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ProgressError {
  /// a job with id {0} is already running
  JobAlreadyRunning(JobId),
}

/// Storage for [`ProgressRecord`]s, keyed by [`JobId`].
///
/// Once a record is `done`, every further update is ignored.
pub trait ProgressStore: Send+Sync {
  /// Register a new job. Replaces a finished record with the same id, but
  /// refuses to clobber one which is still running.
  fn create(&self, id: &JobId, total: usize) -> Result<(), ProgressError>;

  fn get(&self, id: &JobId) -> Option<ProgressRecord>;

  fn update(&self, id: &JobId, patch: ProgressPatch);

  /// Mark the job done with the given failure.
  fn fail(&self, id: &JobId, error: String);

  fn evict(&self, id: &JobId);

  /// Drop every expired record, returning how many were removed.
  fn sweep(&self) -> usize;
}

pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(300);

struct Slot {
  record: ProgressRecord,
  /* None while the job is running. */
  expires_at: Option<Instant>,
}

impl Slot {
  fn is_live(&self, now: Instant) -> bool { !matches!(self.expires_at, Some(at) if at <= now) }
}

/// An in-process [`ProgressStore`]. A record never expires while its job is
/// running; once it is `done` it is kept for the ttl, then evicted.
pub struct MemoryProgressStore {
  ttl: Duration,
  slots: Mutex<HashMap<JobId, Slot>>,
}

impl MemoryProgressStore {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn len(&self) -> usize { self.slots.lock().len() }

  fn modify(&self, id: &JobId, f: impl FnOnce(&mut ProgressRecord)) {
    let now = Instant::now();
    let mut slots = self.slots.lock();
    match slots.get_mut(id) {
      Some(slot) if slot.is_live(now) && !slot.record.done => {
        f(&mut slot.record);
        if slot.record.done {
          slot.expires_at = Some(now + self.ttl);
        }
      },
      Some(_) => trace!(%id, "ignoring update to finished or expired job"),
      None => trace!(%id, "ignoring update to unknown job"),
    }
  }
}

impl Default for MemoryProgressStore {
  fn default() -> Self { Self::new(DEFAULT_PROGRESS_TTL) }
}

impl ProgressStore for MemoryProgressStore {
  fn create(&self, id: &JobId, total: usize) -> Result<(), ProgressError> {
    let now = Instant::now();
    let mut slots = self.slots.lock();
    if let Some(existing) = slots.get(id) {
      if existing.is_live(now) && !existing.record.done {
        return Err(ProgressError::JobAlreadyRunning(id.clone()));
      }
    }
    slots.insert(id.clone(), Slot {
      record: ProgressRecord::new(total),
      expires_at: None,
    });
    debug!(%id, total, "job registered");
    Ok(())
  }

  fn get(&self, id: &JobId) -> Option<ProgressRecord> {
    let now = Instant::now();
    self
      .slots
      .lock()
      .get(id)
      .filter(|slot| slot.is_live(now))
      .map(|slot| slot.record.clone())
  }

  fn update(&self, id: &JobId, patch: ProgressPatch) {
    self.modify(id, |record| match patch {
      ProgressPatch::EntryFinished => {
        record.processed = (record.processed + 1).min(record.total);
      },
      ProgressPatch::Completed => {
        record.processed = record.total;
        record.done = true;
      },
    });
  }

  fn fail(&self, id: &JobId, error: String) {
    self.modify(id, |record| {
      record.done = true;
      record.error = Some(error);
    });
  }

  fn evict(&self, id: &JobId) { self.slots.lock().remove(id); }

  fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut slots = self.slots.lock();
    let before = slots.len();
    slots.retain(|_, slot| slot.is_live(now));
    let removed = before - slots.len();
    if removed > 0 {
      debug!(removed, "swept expired progress records");
    }
    removed
  }
}
