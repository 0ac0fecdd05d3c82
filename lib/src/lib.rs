/*
 * Description: Streaming zip assembly of remote, uploaded and in-memory files
 * with pollable progress.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Streaming zip assembly of remote, uploaded and in-memory files with
//! pollable progress.
//!
//! The pieces, leaf-first:
//! - [`source`]: normalize every entry origin into a chunk producer.
//! - [`encoder`]: a streaming zip writer fed by ordered per-entry channels.
//! - [`assemble`]: drive the encoder over a [`assemble::ZipJob`].
//! - [`progress`]: the request-keyed progress table polled by clients.
//! - [`destination`]: where the encoded bytes end up.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
// #![warn(missing_docs)]

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
  clippy::single_component_path_imports,
  clippy::double_must_use
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
/* Arc<Mutex> can be more clear than needing to grok Orderings. */
#![allow(clippy::mutex_atomic)]

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

/// Entry names we refuse to place into an archive.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum NameFormatError {
  /// name is empty
  NameIsEmpty,
  /// name starts with '/': {0}
  NameStartsWithSlash(String),
  /// name starts with './': {0}
  NameStartsWithDotSlash(String),
  /// name ends with '/': {0}
  NameEndsWithSlash(String),
  /// name has '//': {0}
  NameHasDoubleSlash(String),
  /// name has a '..' component: {0}
  NameHasParentComponent(String),
}

/// An archive-relative file name.
///
/// Duplicates are *not* rejected: two entries with the same name both end up
/// in the archive, and most extractors keep the last one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryName {
  name: String,
}

impl fmt::Display for EntryName {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "'{}'", self.name) }
}

impl EntryName {
  pub fn validate(name: String) -> Result<Self, NameFormatError> {
    if name.is_empty() {
      Err(NameFormatError::NameIsEmpty)
    } else if name.starts_with('/') {
      /* We won't produce any non-relative paths. */
      Err(NameFormatError::NameStartsWithSlash(name))
    } else if name.starts_with("./") {
      Err(NameFormatError::NameStartsWithDotSlash(name))
    } else if name.ends_with('/') {
      /* We only enter file names. */
      Err(NameFormatError::NameEndsWithSlash(name))
    } else if name.contains("//") {
      Err(NameFormatError::NameHasDoubleSlash(name))
    } else if name.split('/').any(|component| component == "..") {
      /* Extracting this would escape the target directory. */
      Err(NameFormatError::NameHasParentComponent(name))
    } else {
      Ok(Self { name })
    }
  }

  pub fn as_str(&self) -> &str { &self.name }

  pub fn into_string(self) -> String { self.name }
}

/// Opaque identifier of one archive-build request.
///
/// Either supplied by the client (so it can start polling before the response
/// arrives) or generated here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
  pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for JobId {
  fn from(s: String) -> Self { Self(s) }
}

impl From<&str> for JobId {
  fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(&self.0) }
}

pub mod tuning;

pub mod source;

pub mod destination;

pub mod encoder;

pub mod progress;

pub mod assemble;

pub mod poll;

pub mod service;

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn accepts_plain_and_nested_names() {
    assert_eq!(
      EntryName::validate("a.jpg".to_string()).unwrap().as_str(),
      "a.jpg"
    );
    assert_eq!(
      EntryName::validate("roll-01/frame..02.jpg".to_string())
        .unwrap()
        .into_string(),
      "roll-01/frame..02.jpg"
    );
  }

  #[test]
  fn rejects_malformed_names() {
    assert_eq!(
      EntryName::validate(String::new()),
      Err(NameFormatError::NameIsEmpty)
    );
    assert!(matches!(
      EntryName::validate("/etc/passwd".to_string()),
      Err(NameFormatError::NameStartsWithSlash(_))
    ));
    let dot_slash = EntryName::validate("./a.jpg".to_string()).unwrap_err();
    assert_eq!(
      dot_slash,
      NameFormatError::NameStartsWithDotSlash("./a.jpg".to_string())
    );
    assert_eq!(dot_slash.to_string(), "name starts with './': ./a.jpg");
    assert!(matches!(
      EntryName::validate("dir/".to_string()),
      Err(NameFormatError::NameEndsWithSlash(_))
    ));
    assert!(matches!(
      EntryName::validate("a//b.jpg".to_string()),
      Err(NameFormatError::NameHasDoubleSlash(_))
    ));
    assert!(matches!(
      EntryName::validate("a/../../b.jpg".to_string()),
      Err(NameFormatError::NameHasParentComponent(_))
    ));
  }

  #[test]
  fn generated_job_ids_are_distinct() {
    assert_ne!(JobId::generate(), JobId::generate());
    assert_eq!(JobId::from("abc").to_string(), "abc");
  }
}
