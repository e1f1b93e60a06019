use serde::{Serialize, Deserialize};
use chrono::{Local, Utc};
use std::{fmt, sync::atomic::{AtomicI64, Ordering}};
use uuid::Uuid;

use crate::error::ValidationError;

/// Dispatched when no material, color or note was given.
pub const NO_PARAMETERS_PROMPT: &str = "no parameters configured";
/// Shown in the prompt preview when no material, color or note was given.
pub const EMPTY_PREVIEW: &str = "(no parameters set)";
const PROMPT_SEPARATOR: &str = ", ";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PromptParams {
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl PromptParams {
    fn parts(&self) -> Vec<String> {
        let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let mut parts = Vec::new();
        if let Some(material) = present(&self.material) { parts.push(format!("Material: {material}")); }
        if let Some(color) = present(&self.color) { parts.push(format!("Color: {color}")); }
        if let Some(note) = present(&self.note) { parts.push(note); }
        parts
    }

    pub fn build_prompt(&self) -> String {
        let parts = self.parts();
        if parts.is_empty() { NO_PARAMETERS_PROMPT.to_string() } else { parts.join(PROMPT_SEPARATOR) }
    }

    pub fn preview(&self) -> String {
        let parts = self.parts();
        if parts.is_empty() { EMPTY_PREVIEW.to_string() } else { parts.join(PROMPT_SEPARATOR) }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub url: String,
}

/// A completed generation. Never modified once created.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GenerationItem {
    pub id: String,
    pub url: String,
    pub timestamp: String,
    pub prompt: String,
}

static LAST_ITEM_MILLIS: AtomicI64 = AtomicI64::new(0);

// Millisecond clock, bumped when two items land in the same millisecond.
fn next_item_millis() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_ITEM_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ITEM_MILLIS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(seen) => last = seen,
        }
    }
}

impl GenerationItem {
    pub fn new(url: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: format!("project-{}", next_item_millis()),
            url: url.into(),
            timestamp: Local::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            prompt: prompt.into(),
        }
    }
}

/// One generation attempt's request. Only constructible with at least one
/// image and a non-blank secret.
#[derive(Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    images: Vec<String>,
    prompt: String,
    secret: String,
}

impl GenerationRequest {
    pub fn new(images: Vec<String>, prompt: String, secret: String) -> Result<Self, ValidationError> {
        if images.is_empty() { return Err(ValidationError::NoImages); }
        if secret.trim().is_empty() { return Err(ValidationError::MissingSecret); }
        Ok(Self { images, prompt, secret })
    }

    pub fn images(&self) -> &[String] { &self.images }
    pub fn prompt(&self) -> &str { &self.prompt }
    pub fn secret(&self) -> &str { &self.secret }

    pub fn payload(&self, workflow_id: &str) -> WorkflowPayload {
        WorkflowPayload {
            workflow_id: workflow_id.to_string(),
            parameters: WorkflowParameters {
                password: self.secret.clone(),
                prompt: self.prompt.clone(),
                up_pic: self.images.clone(),
            },
        }
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("images", &self.images)
            .field("prompt", &self.prompt)
            .field("secret", &"***")
            .finish()
    }
}

/// JSON body of the streamed workflow call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkflowPayload {
    pub workflow_id: String,
    pub parameters: WorkflowParameters,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkflowParameters {
    pub password: String,
    pub prompt: String,
    pub up_pic: Vec<String>,
}

// --- HTTP request/response bodies ---

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GenerateRequest {
    #[serde(default)]
    pub secret: String,
    #[serde(flatten)]
    pub params: PromptParams,
    /// Explicit image list used instead of the session's uploaded images.
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreatedSession {
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PromptPreview {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RejectedFile {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub rejected: Vec<RejectedFile>,
    pub images: Vec<UploadedImage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(material: Option<&str>, color: Option<&str>, note: Option<&str>) -> PromptParams {
        PromptParams {
            material: material.map(str::to_string),
            color: color.map(str::to_string),
            note: note.map(str::to_string),
        }
    }

    #[test]
    fn prompt_joins_present_parts_in_fixed_order() {
        let p = params(Some("Leather001"), Some("Light Grey"), Some("mid-century living room"));
        assert_eq!(p.build_prompt(), "Material: Leather001, Color: Light Grey, mid-century living room");
        assert_eq!(params(None, Some("Red"), None).build_prompt(), "Color: Red");
    }

    #[test]
    fn empty_inputs_use_the_sentinels() {
        let blank = params(Some("  "), None, Some(""));
        assert_eq!(blank.build_prompt(), NO_PARAMETERS_PROMPT);
        assert_eq!(blank.preview(), EMPTY_PREVIEW);
        assert_eq!(params(Some("Denim002"), None, None).preview(), "Material: Denim002");
    }

    #[test]
    fn request_requires_images_and_secret() {
        let err = GenerationRequest::new(vec![], "p".into(), "s".into()).unwrap_err();
        assert_eq!(err, ValidationError::NoImages);
        let err = GenerationRequest::new(vec!["http://a/1.png".into()], "p".into(), "  ".into()).unwrap_err();
        assert_eq!(err, ValidationError::MissingSecret);
    }

    #[test]
    fn payload_matches_the_workflow_wire_shape() {
        let request = GenerationRequest::new(
            vec!["http://a/1.png".into(), "http://a/2.png".into()],
            NO_PARAMETERS_PROMPT.into(),
            "hunter2".into(),
        )
        .unwrap();
        let body = serde_json::to_value(request.payload("wf-1")).unwrap();
        assert_eq!(body, json!({
            "workflow_id": "wf-1",
            "parameters": {
                "password": "hunter2",
                "prompt": "no parameters configured",
                "up_pic": ["http://a/1.png", "http://a/2.png"]
            }
        }));
        assert!(!format!("{request:?}").contains("hunter2"));
    }

    #[test]
    fn item_ids_are_unique_even_within_one_millisecond() {
        let a = GenerationItem::new("http://x/a.png", "p");
        let b = GenerationItem::new("http://x/b.png", "p");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("project-"));
    }

    #[test]
    fn generate_request_accepts_flat_parameters() {
        let body: GenerateRequest = serde_json::from_value(json!({
            "secret": "s",
            "material": "Cotton001",
            "images": ["http://a/1.png"]
        }))
        .unwrap();
        assert_eq!(body.params.material.as_deref(), Some("Cotton001"));
        assert_eq!(body.params.color, None);
        assert_eq!(body.images, Some(vec!["http://a/1.png".to_string()]));
    }
}
