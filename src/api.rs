//! Typed wrappers for the backend endpoints.
//!
//! | Area | Endpoints |
//! |------|-----------|
//! | auth | `POST /api/auth/login`, `POST /api/auth/register`, `GET`/`PUT /api/auth/me` |
//! | knowledge bases | `GET`/`POST /api/knowledge-bases`, `GET`/`PUT`/`DELETE /api/knowledge-bases/{id}` |
//! | documents | `GET`/`POST /api/knowledge-bases/{id}/documents`, `GET`/`PUT`/`DELETE .../documents/{doc}` |
//! | chunks | `GET .../documents/{doc}/chunks` |
//! | search | `POST /api/knowledge-bases/search` |
//! | indexing | `GET /api/knowledge-bases/{id}/indexing-progress` |
//!
//! All calls go through the shared [`RequestGateway`]; login, register and
//! logout are the only operations here that write the session.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::gateway::RequestGateway;
use crate::models::{
    unwrap_envelope, AuthResponse, ChunkList, CreateKnowledgeBaseParams, Document, DocumentChunk,
    DocumentList, DocumentUpdate, IndexingProgress, IndexingProgressResponse, KnowledgeBase,
    KnowledgeBaseList, LoginRequest, RegisterRequest, SearchParams, SearchResult, SearchResults,
    UpdateKnowledgeBaseParams, User, UserUpdate,
};
use crate::session::Session;
use crate::transport::{ProgressFn, UploadFile};

const KB_ROOT: &str = "/api/knowledge-bases";

#[derive(Clone)]
pub struct ApiClient {
    gateway: Arc<RequestGateway>,
}

impl ApiClient {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    // ── auth ───────────────────────────────────────────────────────────

    pub async fn login(&self, username: &str, password: &str) -> ApiResult<User> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let raw: Value = self.gateway.post_anonymous("/api/auth/login", &body).await?;
        self.establish(unwrap_envelope(raw)?)
    }

    pub async fn register(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
    ) -> ApiResult<User> {
        let body = RegisterRequest {
            username: username.to_string(),
            email: email.map(str::to_string),
            password: password.to_string(),
        };
        let raw: Value = self.gateway.post_anonymous("/api/auth/register", &body).await?;
        self.establish(unwrap_envelope(raw)?)
    }

    fn establish(&self, auth: AuthResponse) -> ApiResult<User> {
        let user = auth.user.clone();
        self.gateway
            .session()
            .replace(Session {
                token: auth.token,
                user: Some(auth.user),
            })
            .map_err(session_io)?;
        Ok(user)
    }

    pub async fn current_user(&self) -> ApiResult<User> {
        let raw: Value = self.gateway.get("/api/auth/me").await?;
        unwrap_envelope(raw)
    }

    pub async fn update_user(&self, update: &UserUpdate) -> ApiResult<User> {
        let raw: Value = self.gateway.put("/api/auth/me", update).await?;
        let user: User = unwrap_envelope(raw)?;
        self.gateway
            .session()
            .update_user(user.clone())
            .map_err(session_io)?;
        Ok(user)
    }

    /// Drop the local session. The backend keeps no logout state.
    pub fn logout(&self) -> ApiResult<bool> {
        self.gateway.session().logout().map_err(session_io)
    }

    // ── knowledge bases ────────────────────────────────────────────────

    pub async fn list_knowledge_bases(&self) -> ApiResult<Vec<KnowledgeBase>> {
        let raw: Value = self.gateway.get(KB_ROOT).await?;
        if raw.get("data").is_some_and(Value::is_array) || raw.is_array() {
            return unwrap_envelope(raw);
        }
        Ok(unwrap_envelope::<KnowledgeBaseList>(raw)?.knowledge_bases)
    }

    pub async fn get_knowledge_base(&self, id: &str) -> ApiResult<KnowledgeBase> {
        let raw: Value = self.gateway.get(&kb_path(id)?).await?;
        unwrap_envelope(raw)
    }

    pub async fn create_knowledge_base(
        &self,
        params: &CreateKnowledgeBaseParams,
    ) -> ApiResult<KnowledgeBase> {
        if params.name.trim().is_empty() {
            return Err(ApiError::validation("knowledge base name must not be empty"));
        }
        if params.chunk_overlap >= params.chunk_size {
            return Err(ApiError::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                params.chunk_overlap, params.chunk_size
            )));
        }
        let raw: Value = self.gateway.post(KB_ROOT, params).await?;
        unwrap_envelope(raw)
    }

    pub async fn update_knowledge_base(
        &self,
        id: &str,
        params: &UpdateKnowledgeBaseParams,
    ) -> ApiResult<KnowledgeBase> {
        let raw: Value = self.gateway.put(&kb_path(id)?, params).await?;
        unwrap_envelope(raw)
    }

    pub async fn delete_knowledge_base(&self, id: &str) -> ApiResult<()> {
        let _: Value = self.gateway.delete(&kb_path(id)?).await?;
        Ok(())
    }

    // ── documents ──────────────────────────────────────────────────────

    pub async fn list_documents(&self, kb_id: &str) -> ApiResult<Vec<Document>> {
        let raw: Value = self.gateway.get(&docs_path(kb_id)?).await?;
        if raw.get("data").is_some_and(Value::is_array) || raw.is_array() {
            return unwrap_envelope(raw);
        }
        Ok(unwrap_envelope::<DocumentList>(raw)?.documents)
    }

    pub async fn get_document(&self, kb_id: &str, doc_id: &str) -> ApiResult<Document> {
        let raw: Value = self.gateway.get(&doc_path(kb_id, doc_id)?).await?;
        unwrap_envelope(raw)
    }

    pub async fn upload_document(
        &self,
        kb_id: &str,
        file: UploadFile,
        on_progress: Option<ProgressFn>,
    ) -> ApiResult<Document> {
        let raw: Value = self
            .gateway
            .upload(&docs_path(kb_id)?, file, on_progress)
            .await?;
        unwrap_envelope(raw)
    }

    pub async fn update_document(
        &self,
        kb_id: &str,
        doc_id: &str,
        update: &DocumentUpdate,
    ) -> ApiResult<Document> {
        let raw: Value = self.gateway.put(&doc_path(kb_id, doc_id)?, update).await?;
        unwrap_envelope(raw)
    }

    pub async fn delete_document(&self, kb_id: &str, doc_id: &str) -> ApiResult<()> {
        let _: Value = self.gateway.delete(&doc_path(kb_id, doc_id)?).await?;
        Ok(())
    }

    pub async fn list_chunks(&self, kb_id: &str, doc_id: &str) -> ApiResult<Vec<DocumentChunk>> {
        let path = format!("{}/chunks", doc_path(kb_id, doc_id)?);
        let raw: Value = self.gateway.get(&path).await?;
        Ok(unwrap_envelope::<ChunkList>(raw)?.chunks)
    }

    // ── search / indexing ──────────────────────────────────────────────

    pub async fn search(&self, params: &SearchParams) -> ApiResult<Vec<SearchResult>> {
        if params.query.trim().is_empty() {
            return Err(ApiError::validation("search query must not be empty"));
        }
        let raw: Value = self
            .gateway
            .post(&format!("{}/search", KB_ROOT), params)
            .await?;
        Ok(unwrap_envelope::<SearchResults>(raw)?.results)
    }

    pub async fn indexing_progress(&self, kb_id: &str) -> ApiResult<IndexingProgress> {
        let path = format!("{}/indexing-progress", kb_path(kb_id)?);
        let raw: Value = self.gateway.get(&path).await?;
        Ok(unwrap_envelope::<IndexingProgressResponse>(raw)?.progress)
    }
}

fn session_io(err: anyhow::Error) -> ApiError {
    ApiError::Io(std::io::Error::other(format!("{:#}", err)))
}

fn require_id<'a>(what: &str, id: &'a str) -> ApiResult<&'a str> {
    let id = id.trim();
    if id.is_empty() || id.contains('/') {
        return Err(ApiError::validation(format!("invalid {} id: '{}'", what, id)));
    }
    Ok(id)
}

fn kb_path(id: &str) -> ApiResult<String> {
    Ok(format!("{}/{}", KB_ROOT, require_id("knowledge base", id)?))
}

fn docs_path(kb_id: &str) -> ApiResult<String> {
    Ok(format!("{}/documents", kb_path(kb_id)?))
}

fn doc_path(kb_id: &str, doc_id: &str) -> ApiResult<String> {
    Ok(format!(
        "{}/{}",
        docs_path(kb_id)?,
        require_id("document", doc_id)?
    ))
}
