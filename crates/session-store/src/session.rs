use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use imgup_hasher::{ContentHash, SourceFile, total_chunks};
use serde::{Deserialize, Serialize};

/// Visibility of the uploaded file once it lands on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Public,
    Private,
    Unlisted,
}

/// Destination and processing options, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub optimize: bool,
}

/// Persisted state of one file's resumable upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Whole-file digest; with `file_size`, the content-addressing key.
    pub file_digest: ContentHash,
    /// Fixed for the session's lifetime.
    pub chunk_size: u64,
    pub total_chunks: u64,
    /// Chunk indices acknowledged by the server, ascending and unique.
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<u64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(flatten)]
    pub options: UploadOptions,
}

impl UploadSession {
    /// Starts a session for `file` whose digest has already been computed.
    pub fn new(
        file: &SourceFile,
        file_digest: ContentHash,
        chunk_size: u64,
        options: UploadOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file.name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            file_digest,
            chunk_size,
            total_chunks: total_chunks(file.size, chunk_size),
            uploaded_chunks: BTreeSet::new(),
            created_at: now,
            last_activity: now,
            options,
        }
    }

    /// `true` once every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u64 >= self.total_chunks
    }

    /// Indices still to upload, ascending.
    pub fn remaining_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    /// Acknowledged share of the chunk plan (0-100).
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.uploaded_chunks.len() as f64 * 100.0 / self.total_chunks as f64
    }

    /// Same bytes as `digest`/`size`? File names are not considered.
    pub fn matches_content(&self, digest: &ContentHash, size: u64) -> bool {
        self.file_size == size && &self.file_digest == digest
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }

    /// Drops acknowledged indices outside the chunk plan. Returns how many.
    pub(crate) fn retain_valid_chunks(&mut self) -> usize {
        let before = self.uploaded_chunks.len();
        let total = self.total_chunks;
        self.uploaded_chunks.retain(|&i| i < total);
        before - self.uploaded_chunks.len()
    }
}
