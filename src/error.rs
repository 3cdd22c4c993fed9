// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the LSM layer
#[derive(Debug)]
pub enum Error {
    /// I/O error, delegated from the schema or metadata service
    Io(std::io::Error),

    /// Exclusive create of a name that is already open or already
    /// present in the metadata catalog
    Exists(String),

    /// Exclusive acquire of a handle that is still referenced
    Busy(String),

    /// Operation on an unknown URI
    NotFound(String),

    /// Configuration violation or malformed input
    Invalid(String),

    /// Undecodable metadata record
    Corrupted(DecodeError),

    /// The tree hit an invariant violation and is permanently unusable
    Failed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "LsmError: io: {e}"),
            Self::Exists(uri) => write!(f, "LsmError: already exists: {uri}"),
            Self::Busy(uri) => write!(f, "LsmError: busy: {uri}"),
            Self::NotFound(uri) => write!(f, "LsmError: not found: {uri}"),
            Self::Invalid(msg) => write!(f, "LsmError: invalid: {msg}"),
            Self::Corrupted(e) => write!(f, "LsmError: corrupted metadata: {e}"),
            Self::Failed => write!(f, "LsmError: tree is marked failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Corrupted(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        match value {
            EncodeError::Io(e) => Self::Io(e),
        }
    }
}

/// Result produced by the LSM layer
pub type Result<T> = std::result::Result<T, Error>;
