/*
 * Description: Command-line options controlling how an archive is assembled.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Command-line options controlling how an archive is assembled.

use libfilm_zip::{
  assemble::{self as lib_assemble, Assembler},
  encoder as lib_encoder,
  progress::ProgressStore,
  tuning::{self, DeviceProfile},
};

use clap::{Args, ValueEnum};
use displaydoc::Display;
use eyre::{self, WrapErr};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use std::sync::Arc;

#[derive(Copy, Clone, Default, Debug, ValueEnum)]
pub enum AutomaticModifiedTimeStrategy {
  /// Every entry is stamped with the time the job was created.
  #[default]
  JobStart,
  /// All modification times for entries will be set to 1980-01-1 at 00:00:00.
  Reproducible,
  /// Each entry is stamped with the time it was written.
  CurrentTime,
}

pub fn parse_rfc3339(s: &str) -> Result<OffsetDateTime, String> {
  OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
    format!(
      "{}. Provide a string formatted according to RFC 3339, such as '1985-04-12T23:20:50.52Z'.",
      e
    )
  })
}

#[derive(Copy, Clone, Debug, Default, Args)]
pub struct ModifiedTimeBehavior {
  /// Assign timestamps to the entries of the output zip file according to some
  /// formula.
  #[arg(
    value_enum,
    default_value_t,
    long,
    conflicts_with = "explicit_mtime_timestamp"
  )]
  pub automatic_mtime_strategy: AutomaticModifiedTimeStrategy,
  /// Assign a single [RFC 3339] timestamp such as '1985-04-12T23:20:50.52Z' to
  /// every entry.
  ///
  /// Zip timestamps carry no time zone, so this is converted into local time
  /// and truncated to 2-second accuracy. Years outside 1980-2107 are clamped.
  ///
  /// [RFC 3339]: https://datatracker.ietf.org/doc/html/rfc3339#section-5.6
  #[arg(long, default_value = None, value_parser = parse_rfc3339)]
  pub explicit_mtime_timestamp: Option<OffsetDateTime>,
}

impl ModifiedTimeBehavior {
  /// `None` leaves the default of stamping with the job's creation time.
  pub fn resolve(self) -> Option<lib_encoder::ModifiedTimeBehavior> {
    let Self {
      automatic_mtime_strategy,
      explicit_mtime_timestamp,
    } = self;
    match explicit_mtime_timestamp {
      Some(timestamp) => Some(lib_encoder::ModifiedTimeBehavior::Explicit(timestamp)),
      None => match automatic_mtime_strategy {
        AutomaticModifiedTimeStrategy::JobStart => None,
        AutomaticModifiedTimeStrategy::Reproducible => {
          Some(lib_encoder::ModifiedTimeBehavior::Reproducible)
        },
        AutomaticModifiedTimeStrategy::CurrentTime => {
          Some(lib_encoder::ModifiedTimeBehavior::CurrentTime)
        },
      },
    }
  }
}

#[derive(Copy, Clone, Debug, Display, ValueEnum)]
pub enum CompressionMethod {
  /// uncompressed
  Stored,
  /// deflate-compressed
  Deflated,
}

impl From<CompressionMethod> for lib_encoder::CompressionMethod {
  fn from(x: CompressionMethod) -> Self {
    match x {
      CompressionMethod::Stored => Self::Stored,
      CompressionMethod::Deflated => Self::Deflated,
    }
  }
}

#[derive(Copy, Clone, Default, Debug, Args)]
pub struct CompressionOptions {
  /// Override the compression chosen from the device profile and the
  /// estimated size of the input.
  #[arg(value_enum, long)]
  pub compression_method: Option<CompressionMethod>,
  /// The degree of computational effort to exert for the
  /// [`Self::compression_method`].
  ///
  /// - [`CompressionMethod::Stored`]: the program will error if this is
  ///   provided.
  /// - [`CompressionMethod::Deflated`]: 0..=9
  #[arg(long, default_value = None, requires = "compression_method", verbatim_doc_comment)]
  pub compression_level: Option<i8>,
}

impl TryFrom<CompressionOptions> for Option<lib_encoder::CompressionStrategy> {
  type Error = eyre::Report;

  fn try_from(x: CompressionOptions) -> Result<Self, Self::Error> {
    let CompressionOptions {
      compression_method,
      compression_level,
    } = x;
    compression_method
      .map(|method| {
        lib_encoder::CompressionStrategy::from_method_and_level(method.into(), compression_level)
          .wrap_err("error parsing compression strategy")
      })
      .transpose()
  }
}

#[derive(Copy, Clone, Default, Debug, ValueEnum)]
pub enum Profile {
  /// Phones and low-memory tablets: small batches and windows.
  Constrained,
  /// Desktop browsers.
  Standard,
  /// Plenty of memory and bandwidth.
  #[default]
  Server,
}

impl From<Profile> for DeviceProfile {
  fn from(x: Profile) -> Self {
    match x {
      Profile::Constrained => Self::Constrained,
      Profile::Standard => Self::Standard,
      Profile::Server => Self::Server,
    }
  }
}

#[derive(Copy, Clone, Default, Debug, ValueEnum)]
pub enum FailurePolicy {
  /// Any failed entry aborts the archive and removes the output.
  #[default]
  Strict,
  /// A failed entry is written as a zero-byte file.
  Lenient,
}

impl From<FailurePolicy> for lib_assemble::FailurePolicy {
  fn from(x: FailurePolicy) -> Self {
    match x {
      FailurePolicy::Strict => Self::Strict,
      FailurePolicy::Lenient => Self::Lenient,
    }
  }
}

#[derive(Copy, Clone, Default, Debug, ValueEnum)]
pub enum Parallelism {
  /// Fetch and write one entry at a time.
  #[default]
  Sequential,
  /// Fetch a batch of entries concurrently (sized by the profile), writing
  /// them in order.
  Batched,
}

#[derive(Copy, Clone, Default, Debug, Args)]
pub struct ZipOutputOptions {
  #[command(flatten)]
  pub mtime_behavior: ModifiedTimeBehavior,
  #[command(flatten)]
  pub compression_options: CompressionOptions,
  #[arg(long, value_enum, default_value_t)]
  pub profile: Profile,
  #[arg(long, value_enum, default_value_t)]
  pub mode: FailurePolicy,
  #[arg(long, value_enum, default_value_t)]
  pub parallelism: Parallelism,
}

/// [`ZipOutputOptions`], validated.
#[derive(Copy, Clone, Debug)]
pub struct ZipSettings {
  pub tuning: tuning::Tuning,
  pub policy: lib_assemble::FailurePolicy,
  pub parallelism: lib_assemble::Parallelism,
  pub compression: Option<lib_encoder::CompressionStrategy>,
  pub mtime_behavior: Option<lib_encoder::ModifiedTimeBehavior>,
}

impl TryFrom<ZipOutputOptions> for ZipSettings {
  type Error = eyre::Report;

  fn try_from(x: ZipOutputOptions) -> Result<Self, Self::Error> {
    let ZipOutputOptions {
      mtime_behavior,
      compression_options,
      profile,
      mode,
      parallelism,
    } = x;
    let tuning = tuning::resolve(profile.into());
    let parallelism = match parallelism {
      Parallelism::Sequential => lib_assemble::Parallelism::Sequential,
      Parallelism::Batched => lib_assemble::Parallelism::batched(&tuning),
    };
    Ok(Self {
      tuning,
      policy: mode.into(),
      parallelism,
      compression: compression_options.try_into()?,
      mtime_behavior: mtime_behavior.resolve(),
    })
  }
}

impl ZipSettings {
  pub fn assembler(&self, store: Arc<dyn ProgressStore>) -> Assembler {
    let mut assembler = Assembler::new(self.tuning, self.policy, self.parallelism, store);
    if let Some(compression) = self.compression {
      assembler = assembler.with_compression(compression);
    }
    if let Some(mtime_behavior) = self.mtime_behavior {
      assembler = assembler.with_mtime_behavior(mtime_behavior);
    }
    assembler
  }
}
