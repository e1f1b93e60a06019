//! Per-page session state and the in-memory store that holds it.
//!
//! Every mutation goes through [`SessionStore::with_mut`], which holds the
//! write lock for the whole closure, so observers never see a half-applied
//! change.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{AppError, ValidationError},
    generation::{GenerationPhase, Outcome},
    history::GenerationSlots,
    models::{GenerationItem, UploadedImage},
};

/// How long success messages stay visible.
pub const STATUS_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusMessage {
    text: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    images: Vec<UploadedImage>,
    slots: GenerationSlots,
    phase: GenerationPhase,
    last_outcome: Option<Outcome>,
    status: Option<StatusMessage>,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
}

/// What a page renders.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub images: Vec<UploadedImage>,
    pub current: Option<GenerationItem>,
    pub history: Vec<GenerationItem>,
    pub phase: GenerationPhase,
    pub last_outcome: Option<Outcome>,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            images: Vec::new(),
            slots: GenerationSlots::default(),
            phase: GenerationPhase::Idle,
            last_outcome: None,
            status: None,
            last_error: None,
            cancel: None,
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn images(&self) -> &[UploadedImage] { &self.images }
    pub fn image_urls(&self) -> Vec<String> { self.images.iter().map(|i| i.url.clone()).collect() }
    pub fn slots(&self) -> &GenerationSlots { &self.slots }
    pub fn slots_mut(&mut self) -> &mut GenerationSlots { &mut self.slots }
    pub fn phase(&self) -> &GenerationPhase { &self.phase }
    pub fn set_phase(&mut self, phase: GenerationPhase) { self.phase = phase; }
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }
    pub fn last_outcome(&self) -> Option<&Outcome> { self.last_outcome.as_ref() }
    pub fn set_last_outcome(&mut self, outcome: Outcome) { self.last_outcome = Some(outcome); }

    pub fn append_images(&mut self, urls: &[String]) {
        self.images.extend(urls.iter().map(|url| UploadedImage { url: url.clone() }));
    }

    pub fn remove_image(&mut self, index: usize) -> Result<UploadedImage, ValidationError> {
        if index >= self.images.len() {
            return Err(ValidationError::IndexOutOfRange { index, len: self.images.len() });
        }
        Ok(self.images.remove(index))
    }

    pub fn set_status(&mut self, text: impl Into<String>, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()).map(|ttl| Utc::now() + ttl);
        self.status = Some(StatusMessage { text: text.into(), expires_at });
    }

    pub fn clear_status(&mut self) { self.status = None; }

    /// The status text as of `now`; expired messages read as cleared.
    pub fn status_at(&self, now: DateTime<Utc>) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|s| s.expires_at.map_or(true, |at| now < at))
            .map(|s| s.text.as_str())
    }

    pub fn record_error(&mut self, message: impl Into<String>) { self.last_error = Some(message.into()); }
    pub fn clear_error(&mut self) { self.last_error = None; }

    /// Installs a fresh cancellation token for a new attempt.
    pub fn arm_cancel(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        token
    }

    pub fn disarm_cancel(&mut self) { self.cancel = None; }

    /// Signals the in-flight attempt, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn view_at(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            id: self.id,
            created_at: self.created_at,
            images: self.images.clone(),
            current: self.slots.current().cloned(),
            history: self.slots.history().to_vec(),
            phase: self.phase.clone(),
            last_outcome: self.last_outcome.clone(),
            status: self.status_at(now).map(str::to_string),
            error: self.last_error.clone(),
        }
    }

    pub fn view(&self) -> SessionView { self.view_at(Utc::now()) }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionStore {
    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.write().insert(id, Session::new(id));
        tracing::info!("🆕 Created session {}", id);
        id
    }

    pub fn with<R>(&self, id: Uuid, f: impl FnOnce(&Session) -> R) -> Result<R, AppError> {
        let guard = self.inner.read();
        let session = guard.get(&id).ok_or(AppError::SessionNotFound(id))?;
        Ok(f(session))
    }

    pub fn with_mut<R>(&self, id: Uuid, f: impl FnOnce(&mut Session) -> R) -> Result<R, AppError> {
        let mut guard = self.inner.write();
        let session = guard.get_mut(&id).ok_or(AppError::SessionNotFound(id))?;
        Ok(f(session))
    }

    /// Drops a session, cancelling whatever it was generating.
    pub fn close(&self, id: Uuid) -> Result<(), AppError> {
        let session = self.inner.write().remove(&id).ok_or(AppError::SessionNotFound(id))?;
        if session.cancel() {
            tracing::info!("🛑 Cancelled in-flight generation of closed session {}", id);
        }
        tracing::info!("👋 Closed session {}", id);
        Ok(())
    }

    pub fn len(&self) -> usize { self.inner.read().len() }
    pub fn is_empty(&self) -> bool { self.inner.read().is_empty() }
}
