/*
 * Description: Resolve a device capability profile into the knobs which bound
 * memory and time during assembly.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Resolve a device capability profile into the knobs which bound memory and
//! time during assembly.

use crate::encoder::CompressionStrategy;

use displaydoc::Display;
use serde::{Deserialize, Serialize};

use std::time::Duration;

/// How much memory and cpu the consumer of an archive can be assumed to have.
#[derive(Copy, Clone, Default, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceProfile {
  /// constrained (phones, low-memory tablets)
  Constrained,
  /// standard (desktop browsers)
  Standard,
  /// server
  #[default]
  Server,
}

impl DeviceProfile {
  /// Classify a `Device-Memory` client hint, which is reported in (possibly
  /// fractional) GiB and rounded down to a power of two by the user agent.
  pub fn from_device_memory_gib(gib: f64) -> Self {
    if gib < 4.0 {
      Self::Constrained
    } else {
      Self::Standard
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tuning {
  /// How many entries are fetched concurrently in batched mode.
  pub batch_size: usize,
  /// Window size used to slice uploaded files and to pump encoder output.
  pub chunk_size: usize,
  /// The highest deflate level we are willing to spend cpu on.
  pub compression_level: u8,
  pub fetch_timeout: Duration,
  /// Number of *additional* attempts for a remote fetch after the first.
  pub retry_count: u32,
}

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/* Compression gets cheaper as the input grows, trading ratio for time. */
const LEVEL_STEPS: [(u64, u8); 3] = [
  (256 * MIB as u64, 3),
  (64 * MIB as u64, 4),
  (16 * MIB as u64, 5),
];

pub const MIN_COMPRESSION_LEVEL: u8 = 3;

pub fn resolve(profile: DeviceProfile) -> Tuning {
  match profile {
    DeviceProfile::Constrained => Tuning {
      batch_size: 3,
      chunk_size: 64 * KIB,
      compression_level: 4,
      fetch_timeout: FETCH_TIMEOUT,
      retry_count: 1,
    },
    DeviceProfile::Standard => Tuning {
      batch_size: 5,
      chunk_size: 512 * KIB,
      compression_level: 6,
      fetch_timeout: FETCH_TIMEOUT,
      retry_count: 2,
    },
    DeviceProfile::Server => Tuning {
      batch_size: 10,
      chunk_size: 2 * MIB,
      compression_level: 6,
      fetch_timeout: FETCH_TIMEOUT,
      retry_count: 2,
    },
  }
}

impl Tuning {
  /// Pick a deflate level for an archive whose inputs add up to roughly
  /// `estimated_input_bytes`.
  pub fn compression_for(&self, estimated_input_bytes: u64) -> CompressionStrategy {
    let ceiling = self.compression_level.max(MIN_COMPRESSION_LEVEL);
    let level = LEVEL_STEPS
      .iter()
      .find(|(threshold, _)| estimated_input_bytes >= *threshold)
      .map(|(_, level)| (*level).min(ceiling))
      .unwrap_or(ceiling);
    CompressionStrategy::Deflated(Some(level))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn constrained_devices_get_smaller_windows() {
    let constrained = resolve(DeviceProfile::Constrained);
    let server = resolve(DeviceProfile::Server);
    assert!(constrained.batch_size < server.batch_size);
    assert!(constrained.chunk_size < server.chunk_size);
    assert_eq!(constrained.chunk_size, 64 * 1024);
    assert_eq!(server.chunk_size, 2 * 1024 * 1024);
    for profile in [
      DeviceProfile::Constrained,
      DeviceProfile::Standard,
      DeviceProfile::Server,
    ] {
      let tuning = resolve(profile);
      assert!((3..=10).contains(&tuning.batch_size));
      assert_eq!(tuning.fetch_timeout, Duration::from_secs(30));
    }
  }

  #[test]
  fn device_memory_hint_classification() {
    assert_eq!(
      DeviceProfile::from_device_memory_gib(0.5),
      DeviceProfile::Constrained
    );
    assert_eq!(
      DeviceProfile::from_device_memory_gib(2.0),
      DeviceProfile::Constrained
    );
    assert_eq!(
      DeviceProfile::from_device_memory_gib(8.0),
      DeviceProfile::Standard
    );
  }

  #[test]
  fn compression_level_drops_with_input_size() {
    let tuning = resolve(DeviceProfile::Standard);
    let level = |bytes: u64| match tuning.compression_for(bytes) {
      CompressionStrategy::Deflated(Some(level)) => level,
      other => panic!("unexpected strategy {:?}", other),
    };
    assert_eq!(level(1_000), 6);
    assert_eq!(level(20 * MIB as u64), 5);
    assert_eq!(level(100 * MIB as u64), 4);
    assert_eq!(level(1024 * MIB as u64), 3);

    /* The ceiling still applies for small inputs on constrained devices. */
    let constrained = resolve(DeviceProfile::Constrained);
    assert!(matches!(
      constrained.compression_for(1_000),
      CompressionStrategy::Deflated(Some(4))
    ));
  }
}
