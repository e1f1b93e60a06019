use async_trait::async_trait;
use axum::{body::Body, http::{Request, StatusCode}, Router};
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tower::ServiceExt;

use furniture_visualizer::{
    error::{GenerationError, UploadError},
    models::{GenerationRequest, WorkflowPayload},
    routes::{router, AppState},
    upload::{ImageFile, ImageHost},
    workflow::{ByteStream, WorkflowService},
};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

struct FakeHost;

#[async_trait]
impl ImageHost for FakeHost {
    async fn upload(&self, file: &ImageFile) -> Result<String, UploadError> {
        if file.filename.starts_with("reject") {
            return Err(UploadError::Rejected { filename: file.filename.clone(), status: 400, body: "nope".into() });
        }
        Ok(format!("https://res.example/{}", file.filename))
    }
}

/// Plays one scripted SSE body per call; `None` means a stream that never
/// produces anything.
struct FakeWorkflow {
    scripts: Mutex<VecDeque<Option<Vec<&'static str>>>>,
    payloads: Mutex<Vec<WorkflowPayload>>,
}

impl FakeWorkflow {
    fn new(scripts: Vec<Option<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self { scripts: Mutex::new(scripts.into()), payloads: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl WorkflowService for FakeWorkflow {
    async fn stream_run(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError> {
        self.payloads.lock().push(request.payload("wf-test"));
        let script = self.scripts.lock().pop_front().flatten();
        Ok(match script {
            Some(frames) => {
                let body: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();
                stream::iter(vec![Ok(Bytes::from(body))]).boxed()
            }
            None => stream::pending().boxed(),
        })
    }
}

fn app(workflow: Arc<FakeWorkflow>) -> Router {
    router(AppState::new(Arc::new(FakeHost), workflow), 16 * 1024 * 1024)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

fn upload_request(uri: &str, files: &[(&str, &str, &[u8])]) -> Request<Body> {
    let boundary = "furniture-boundary";
    let mut body = Vec::new();
    for (name, mime, bytes) in files {
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: {mime}\r\n\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap()
}

async fn new_session(app: &Router) -> String {
    let (status, body) = call(app, empty_request("POST", "/api/sessions")).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn upload_then_generate_twice_archives_the_first_result() {
    let workflow = FakeWorkflow::new(vec![
        Some(vec![
            r#"{"event":"message","message":{"content":"rendering"}}"#,
            r#"{"event":"message","message":{"content":"{\"data\":\"http://r/first.png\"}"}}"#,
            r#"{"event":"done"}"#,
        ]),
        Some(vec![r#"{"output":"http://r/second.png"}"#]),
    ]);
    let app = app(workflow.clone());
    let id = new_session(&app).await;

    let (status, report) = call(&app, upload_request(
        &format!("/api/sessions/{id}/images"),
        &[("sofa.png", "image/png", PNG), ("readme.txt", "text/plain", b"hi"), ("chair.png", "image/png", PNG)],
    ))
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["uploaded"], json!(["https://res.example/sofa.png", "https://res.example/chair.png"]));
    assert_eq!(report["rejected"][0]["filename"], "readme.txt");

    let (status, first) = call(&app, json_request("POST", &format!("/api/sessions/{id}/generate"), json!({"secret": "hunter2"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["url"], "http://r/first.png");
    assert_eq!(first["prompt"], "no parameters configured");

    {
        let payloads = workflow.payloads.lock();
        assert_eq!(payloads[0].parameters.prompt, "no parameters configured");
        assert_eq!(payloads[0].parameters.password, "hunter2");
        assert_eq!(payloads[0].parameters.up_pic, vec![
            "https://res.example/sofa.png".to_string(),
            "https://res.example/chair.png".to_string(),
        ]);
    }

    let (status, second) = call(&app, json_request(
        "POST",
        &format!("/api/sessions/{id}/generate"),
        json!({"secret": "hunter2", "material": "Leather001", "color": "Red", "note": "loft"}),
    ))
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["prompt"], "Material: Leather001, Color: Red, loft");

    let (_, view) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
    assert_eq!(view["current"], second);
    assert_eq!(view["history"], json!([first.clone()]));
    assert_eq!(view["phase"], json!({"state": "idle"}));
    assert_eq!(view["last_outcome"], json!({"result": "success", "id": second["id"]}));

    let (_, history) = call(&app, empty_request("GET", &format!("/api/sessions/{id}/history"))).await;
    assert_eq!(history, json!([first]));
}

#[tokio::test]
async fn failed_batch_leaves_the_image_list_unchanged() {
    let app = app(FakeWorkflow::new(vec![]));
    let id = new_session(&app).await;

    let (status, body) = call(&app, upload_request(
        &format!("/api/sessions/{id}/images"),
        &[("ok.png", "image/png", PNG), ("reject.png", "image/png", PNG)],
    ))
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "upload");

    let (_, view) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
    assert_eq!(view["images"], json!([]));
    assert!(view["error"].as_str().unwrap().contains("reject.png"));
}

#[tokio::test]
async fn generate_is_blocked_without_images_or_secret() {
    let workflow = FakeWorkflow::new(vec![]);
    let app = app(workflow.clone());
    let id = new_session(&app).await;

    let (status, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/generate"), json!({"secret": "s"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    call(&app, upload_request(&format!("/api/sessions/{id}/images"), &[("a.png", "image/png", PNG)])).await;
    let (status, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/generate"), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "enter your secret to verify access");
    assert!(workflow.payloads.lock().is_empty());
}

#[tokio::test]
async fn remote_error_surfaces_and_keeps_state() {
    let app = app(FakeWorkflow::new(vec![Some(vec![r#"{"event":"error","error":"invalid secret"}"#])]));
    let id = new_session(&app).await;
    call(&app, upload_request(&format!("/api/sessions/{id}/images"), &[("a.png", "image/png", PNG)])).await;

    let (status, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/generate"), json!({"secret": "s"}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, json!({"error": "invalid secret", "kind": "remote"}));

    let (_, view) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
    assert_eq!(view["current"], Value::Null);
    assert_eq!(view["phase"], json!({"state": "idle"}));
    assert_eq!(view["last_outcome"], json!({"result": "failure", "message": "invalid secret"}));
}

#[tokio::test]
async fn images_can_be_removed_by_index() {
    let app = app(FakeWorkflow::new(vec![]));
    let id = new_session(&app).await;
    call(&app, upload_request(
        &format!("/api/sessions/{id}/images"),
        &[("a.png", "image/png", PNG), ("b.png", "image/png", PNG)],
    ))
    .await;

    let (status, view) = call(&app, empty_request("DELETE", &format!("/api/sessions/{id}/images/0"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["images"], json!([{"url": "https://res.example/b.png"}]));

    let (status, body) = call(&app, empty_request("DELETE", &format!("/api/sessions/{id}/images/5"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn prompt_preview_uses_the_display_placeholder() {
    let app = app(FakeWorkflow::new(vec![]));
    let id = new_session(&app).await;
    let (_, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/prompt"), json!({}))).await;
    assert_eq!(body["prompt"], "(no parameters set)");
    let (_, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/prompt"), json!({"color": "Beige"}))).await;
    assert_eq!(body["prompt"], "Color: Beige");
}

#[tokio::test]
async fn cancel_stops_a_hanging_stream() {
    let app = app(FakeWorkflow::new(vec![None]));
    let id = new_session(&app).await;
    call(&app, upload_request(&format!("/api/sessions/{id}/images"), &[("a.png", "image/png", PNG)])).await;

    let pending = {
        let app = app.clone();
        let uri = format!("/api/sessions/{id}/generate");
        tokio::spawn(async move { call(&app, json_request("POST", &uri, json!({"secret": "s"}))).await })
    };

    let mut busy = false;
    for _ in 0..100 {
        let (_, view) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
        if view["phase"]["state"] == "streaming" {
            busy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(busy, "generation never reached the streaming phase");

    let (status, body) = call(&app, json_request("POST", &format!("/api/sessions/{id}/generate"), json!({"secret": "s"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "in_progress");

    let (status, _) = call(&app, empty_request("POST", &format!("/api/sessions/{id}/cancel"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "cancelled");

    let (_, view) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
    assert_eq!(view["phase"], json!({"state": "idle"}));
    assert_eq!(view["last_outcome"]["result"], "failure");
}

#[tokio::test]
async fn closed_sessions_are_gone() {
    let app = app(FakeWorkflow::new(vec![]));
    let id = new_session(&app).await;
    let (status, _) = call(&app, empty_request("DELETE", &format!("/api/sessions/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}
