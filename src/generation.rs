//! One generation attempt, end to end.
//!
//! `Idle -> Dispatching -> Streaming -> Completed -> Idle`. The first record that
//! yields a URL sets a one-shot latch; the stream is dropped right there and
//! the result is archived-and-replaced exactly once. Failures leave the
//! current result and history untouched.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use bytes::Bytes;

use crate::{
    error::{AppError, GenerationError},
    extract,
    models::{GenerateRequest, GenerationItem, GenerationRequest},
    session::{Session, SessionStore, STATUS_TTL},
    sse,
    workflow::WorkflowService,
};

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success { id: String },
    Failure { message: String },
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerationPhase {
    Idle,
    Dispatching,
    Streaming,
    /// Finished; settles back to `Idle` once the outcome is recorded.
    Completed { outcome: Outcome },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Dispatch,
    StreamOpened,
    Finish(Outcome),
    Settle,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid generation transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: GenerationPhase,
    pub event: PhaseEvent,
}

impl GenerationPhase {
    pub fn is_busy(&self) -> bool {
        matches!(self, GenerationPhase::Dispatching | GenerationPhase::Streaming)
    }

    pub fn advance(&self, event: PhaseEvent) -> Result<GenerationPhase, InvalidTransition> {
        use GenerationPhase::*;
        match (self, event) {
            (Idle, PhaseEvent::Dispatch) => Ok(Dispatching),
            (Dispatching, PhaseEvent::StreamOpened) => Ok(Streaming),
            (Dispatching | Streaming, PhaseEvent::Finish(outcome)) => Ok(Completed { outcome }),
            (Completed { .. }, PhaseEvent::Settle) => Ok(Idle),
            (from, event) => Err(InvalidTransition { from: from.clone(), event }),
        }
    }
}

/// One-shot holder for the attempt's result URL.
#[derive(Debug, Default)]
pub struct ResultLatch {
    url: Option<String>,
}

impl ResultLatch {
    /// Stores `url` if nothing has been committed yet. Returns whether it did.
    pub fn commit(&mut self, url: String) -> bool {
        if self.url.is_some() {
            return false;
        }
        self.url = Some(url);
        true
    }

    pub fn is_set(&self) -> bool { self.url.is_some() }
    pub fn url(&self) -> Option<&str> { self.url.as_deref() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing decisive; `progress` is new status text, if the record had any.
    Continue { progress: Option<String> },
    Found(String),
    Failed(String),
    /// The latch was already set, so the record has no effect.
    Ignored,
}

/// Feeds records through the extractor and applies the at-most-once rule.
#[derive(Debug, Default)]
pub struct StreamScan {
    latch: ResultLatch,
    frames: usize,
}

impl StreamScan {
    pub fn feed(&mut self, record: &Value) -> Step {
        if self.latch.is_set() {
            debug!("Ignoring frame received after the result was latched");
            return Step::Ignored;
        }
        self.frames += 1;
        let inspection = extract::inspect(record);

        if let Some(url) = inspection.url {
            self.latch.commit(url.clone());
            return Step::Found(url);
        }
        if inspection.completed {
            warn!("⚠️ Completion event without a result URL: {}", record);
        }
        if let Some(message) = inspection.error {
            error!("❌ Workflow reported an error: {}", message);
            return Step::Failed(message);
        }
        Step::Continue { progress: inspection.progress }
    }

    pub fn frames(&self) -> usize { self.frames }
    pub fn result(&self) -> Option<&str> { self.latch.url() }
}

/// Reads records until a URL, an error record, cancellation, or the end of
/// the stream. Returning drops the stream, so nothing after the first URL is
/// ever read.
pub async fn drive_stream<S, F>(
    bytes: S,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<String, GenerationError>
where
    S: Stream<Item = Result<Bytes, GenerationError>> + Unpin,
    F: FnMut(&str),
{
    let records = sse::decode_records(bytes);
    futures::pin_mut!(records);
    let mut scan = StreamScan::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("🛑 Generation cancelled after {} frames", scan.frames());
                return Err(GenerationError::Cancelled);
            }
            next = records.next() => next,
        };
        let record = match next {
            Some(record) => record?,
            None => break,
        };
        match scan.feed(&record) {
            Step::Found(url) => {
                info!("✅ Result URL found after {} frames, closing stream", scan.frames());
                return Ok(url);
            }
            Step::Failed(message) => return Err(GenerationError::Remote(message)),
            Step::Continue { progress: Some(text) } => on_progress(&text),
            Step::Continue { progress: None } | Step::Ignored => {}
        }
    }

    warn!("⚠️ Stream ended after {} frames without a result URL", scan.frames());
    Err(GenerationError::NoResult)
}

/// Runs generate actions against the session store.
#[derive(Clone)]
pub struct Generator {
    workflow: Arc<dyn WorkflowService>,
    sessions: SessionStore,
}

impl Generator {
    pub fn new(workflow: Arc<dyn WorkflowService>, sessions: SessionStore) -> Self {
        Self { workflow, sessions }
    }

    pub async fn generate(&self, session_id: Uuid, body: GenerateRequest) -> Result<GenerationItem, AppError> {
        let (request, cancel) = self.begin(session_id, body)?;
        let result = self.stream_result(session_id, &request, &cancel).await;

        match result {
            Ok(url) => self.finish_success(session_id, url, request.prompt()),
            Err(e) => {
                self.finish_failure(session_id, &e);
                Err(e.into())
            }
        }
    }

    /// Validates preconditions and moves the session to `Dispatching`.
    fn begin(&self, session_id: Uuid, body: GenerateRequest) -> Result<(GenerationRequest, CancellationToken), AppError> {
        self.sessions.with_mut(session_id, |session| -> Result<_, GenerationError> {
            if session.phase().is_busy() {
                return Err(GenerationError::InProgress);
            }
            let images = body.images.clone().unwrap_or_else(|| session.image_urls());
            let prompt = body.params.build_prompt();
            let request = match GenerationRequest::new(images, prompt, body.secret.clone()) {
                Ok(request) => request,
                Err(e) => {
                    warn!("⚠️ Generate blocked: {}", e);
                    session.record_error(e.to_string());
                    return Err(e.into());
                }
            };
            let phase = session.phase().advance(PhaseEvent::Dispatch).map_err(|_| GenerationError::InProgress)?;
            session.set_phase(phase);
            session.clear_error();
            session.clear_status();
            let cancel = session.arm_cancel();
            Ok((request, cancel))
        })?
        .map_err(AppError::from)
    }

    async fn stream_result(
        &self,
        session_id: Uuid,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        info!("🚀 Generating for session {} with {} images, prompt: {}", session_id, request.images().len(), request.prompt());

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            opened = self.workflow.stream_run(request) => opened?,
        };

        let opened = self.sessions.with_mut(session_id, |session| {
            let phase = session.phase().advance(PhaseEvent::StreamOpened);
            if let Ok(phase) = &phase {
                session.set_phase(phase.clone());
            }
            phase
        });
        match opened {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(GenerationError::Stream(e.to_string())),
            Err(_) => return Err(GenerationError::Cancelled),
        }

        let sessions = self.sessions.clone();
        drive_stream(bytes, cancel, move |text| {
            let _ = sessions.with_mut(session_id, |session| session.set_status(text, None));
        })
        .await
    }

    /// The archive-and-replace transition, applied under one write lock.
    fn finish_success(&self, session_id: Uuid, url: String, prompt: &str) -> Result<GenerationItem, AppError> {
        let item = GenerationItem::new(url, prompt);
        self.sessions.with_mut(session_id, |session| {
            session.slots_mut().archive_and_replace(item.clone());
            settle(session, Outcome::Success { id: item.id.clone() });
            session.set_status("generation succeeded", Some(STATUS_TTL));
        })?;
        info!("🎉 Session {} now shows {} ({})", session_id, item.id, item.url);
        Ok(item)
    }

    fn finish_failure(&self, session_id: Uuid, err: &GenerationError) {
        error!("❌ Generation failed for session {}: {}", session_id, err);
        let _ = self.sessions.with_mut(session_id, |session| {
            settle(session, Outcome::Failure { message: err.to_string() });
            session.clear_status();
            session.record_error(err.to_string());
        });
    }

    /// Cancels the session's in-flight attempt. Returns whether one was running.
    pub fn cancel(&self, session_id: Uuid) -> Result<bool, AppError> {
        self.sessions.with(session_id, |session| session.cancel())
    }
}

/// Records the outcome and walks the phase through `Completed` back to `Idle`.
fn settle(session: &mut Session, outcome: Outcome) {
    let completed = session
        .phase()
        .advance(PhaseEvent::Finish(outcome.clone()))
        .unwrap_or_else(|e| {
            warn!("⚠️ {}", e);
            GenerationPhase::Completed { outcome: outcome.clone() }
        });
    let idle = completed.advance(PhaseEvent::Settle).unwrap_or(GenerationPhase::Idle);
    session.set_phase(idle);
    session.set_last_outcome(outcome);
    session.disarm_cancel();
}
