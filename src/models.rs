//! Wire types exchanged with the knowledge-base backend.
//!
//! Field names follow the backend's snake_case JSON. Optional and
//! server-populated fields carry `#[serde(default)]` so partial payloads
//! from older backends still decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Decode `value` as `T`, looking inside a `{ "data": T }` envelope first.
///
/// Most endpoints wrap their payload; some return it bare.
pub fn unwrap_envelope<T: DeserializeOwned>(value: serde_json::Value) -> ApiResult<T> {
    if let Some(inner) = value.get("data") {
        if let Ok(decoded) = serde_json::from_value::<T>(inner.clone()) {
            return Ok(decoded);
        }
    }
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(alias = "access_token")]
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexingTechnique {
    #[default]
    HighQuality,
    Economy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeBaseStatus {
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub retrieval_model: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u32>,
    #[serde(default)]
    pub chunk_overlap: Option<u32>,
    #[serde(default)]
    pub indexing_technique: IndexingTechnique,
    #[serde(default)]
    pub status: KnowledgeBaseStatus,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub permission: Visibility,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Text splitting options sent alongside knowledge-base creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    pub splitter_type: String,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub length_function: String,
    pub keep_separator: bool,
    pub strip_whitespace: bool,
    #[serde(default)]
    pub cleaning_rules: Vec<String>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            splitter_type: "recursive".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            length_function: "char_count".to_string(),
            keep_separator: true,
            strip_whitespace: true,
            cleaning_rules: vec![
                "remove_extra_whitespace".to_string(),
                "normalize_unicode".to_string(),
                "preserve_structure".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateKnowledgeBaseParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub embedding_model: String,
    pub retrieval_model: String,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub indexing_technique: IndexingTechnique,
    pub permission: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation_config: Option<SegmentationConfig>,
}

impl CreateKnowledgeBaseParams {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            embedding_model: "text-embedding-ada-002".to_string(),
            retrieval_model: "hybrid".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            indexing_technique: IndexingTechnique::HighQuality,
            permission: Visibility::Private,
            segmentation_config: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateKnowledgeBaseParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<Visibility>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeBaseList {
    pub knowledge_bases: Vec<KnowledgeBase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub chunk_count: u64,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub status: DocumentStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkList {
    pub chunks: Vec<DocumentChunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchParams {
    pub knowledge_base_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl IndexingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

/// Backend-owned indexing state of a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingProgress {
    pub total: u64,
    pub processed: u64,
    pub status: IndexingStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl IndexingProgress {
    /// Fraction processed in `[0.0, 1.0]`; clamps a `processed > total` report.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        (self.processed.min(self.total) as f64) / (self.total as f64)
    }

    /// Whether `self` moves backwards relative to an earlier observation.
    pub fn regresses_from(&self, earlier: &IndexingProgress) -> bool {
        self.status.rank() < earlier.status.rank()
            || (self.total == earlier.total && self.processed < earlier.processed)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexingProgressResponse {
    pub progress: IndexingProgress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_and_bare_payloads_decode() {
        let wrapped = json!({ "data": { "progress": { "total": 10, "processed": 5, "status": "processing" } } });
        let bare = json!({ "progress": { "total": 10, "processed": 5, "status": "processing" } });
        let a: IndexingProgressResponse = unwrap_envelope(wrapped).unwrap();
        let b: IndexingProgressResponse = unwrap_envelope(bare).unwrap();
        assert_eq!(a.progress, b.progress);
        assert_eq!(a.progress.status, IndexingStatus::Processing);
    }

    #[test]
    fn auth_response_accepts_access_token() {
        let resp: AuthResponse = unwrap_envelope(json!({
            "access_token": "abc",
            "user": { "id": "1", "username": "ana", "role": "admin" }
        }))
        .unwrap();
        assert_eq!(resp.token, "abc");
        assert_eq!(resp.user.role, UserRole::Admin);
    }

    #[test]
    fn decode_failure_is_reported() {
        let err = unwrap_envelope::<KnowledgeBase>(json!({ "nope": true })).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn progress_fraction_and_regression() {
        let early = IndexingProgress {
            total: 10,
            processed: 8,
            status: IndexingStatus::Processing,
            error: None,
        };
        let later = IndexingProgress {
            processed: 5,
            ..early.clone()
        };
        assert!((early.fraction() - 0.8).abs() < 1e-9);
        assert!(later.regresses_from(&early));
        assert!(!early.regresses_from(&later));

        let overshoot = IndexingProgress {
            total: 4,
            processed: 9,
            status: IndexingStatus::Processing,
            error: None,
        };
        assert_eq!(overshoot.fraction(), 1.0);
    }
}
