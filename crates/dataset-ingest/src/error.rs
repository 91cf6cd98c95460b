// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use tokio::sync::AcquireError;

/// Pipeline stage named in an aggregate ingestion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Uploading the original image bytes.
    UploadOriginal,
    /// Inserting metadata records into the database.
    InsertMetadata,
    /// Uploading the synthesized dataset manifest.
    UploadManifest,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::UploadOriginal => write!(f, "upload original"),
            Stage::InsertMetadata => write!(f, "insert metadata"),
            Stage::UploadManifest => write!(f, "upload manifest"),
        }
    }
}

/// Error type for dataset ingestion operations.
///
/// Covers wrapped library errors from I/O, archive, image and network layers
/// as well as the domain failures raised by the ingestion pipeline.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// HTTP request error from the reqwest client.
    HttpError(reqwest::Error),
    /// URL parsing error.
    UrlParseError(url::ParseError),
    /// Archive could not be read.
    ZipError(zip::result::ZipError),
    /// Raster decode or encode failure.
    ImageError(image::ImageError),
    /// Semaphore acquisition error for concurrent operations.
    SemaphoreError(AcquireError),
    /// Async task join error.
    JoinError(tokio::task::JoinError),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// Unsupported file or encoding format.
    UnsupportedFormat(String),
    /// The object storage collaborator rejected a request.
    Storage(String),
    /// The metadata database collaborator rejected a request.
    Database(String),
    /// A retrieval URL could not be issued.
    UrlIssue(String),
    /// The operation was cancelled before it completed.
    Cancelled,
    /// A batch was halted by a fatal failure in the named stage.
    IngestFailed { stage: Stage, message: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::ZipError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        Error::SemaphoreError(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::JoinError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::HttpError(e) => write!(f, "HTTP error: {}", e),
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::ZipError(e) => write!(f, "Archive error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::SemaphoreError(e) => write!(f, "Semaphore error: {}", e),
            Error::JoinError(e) => write!(f, "Task join error: {}", e),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::UnsupportedFormat(s) => write!(f, "Unsupported format: {}", s),
            Error::Storage(s) => write!(f, "Storage error: {}", s),
            Error::Database(s) => write!(f, "Database error: {}", s),
            Error::UrlIssue(s) => write!(f, "Retrieval URL error: {}", s),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::IngestFailed { stage, message } => {
                write!(f, "Ingestion failed during {}: {}", stage, message)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            Error::ZipError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::SemaphoreError(e) => Some(e),
            Error::JoinError(e) => Some(e),
            _ => None,
        }
    }
}
