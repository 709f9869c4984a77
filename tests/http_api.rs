use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use serde_json::json;
use whiteboardcore::api::{SyncBatchRequest, SyncNotePayload};
use whiteboardcore::{ApiError, HttpNotesApi, NotesApi};

const TOKEN: &str = "tok";

/// A request as the server saw it.
#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: Option<String>,
    auth: Option<String>,
    body: Option<serde_json::Value>,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Recorded>>>);

impl Recorder {
    fn last(&self) -> Recorded {
        self.0.lock().unwrap().last().cloned().unwrap()
    }
}

async fn respond(
    State(recorder): State<Recorder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    recorder.0.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        auth: auth.clone(),
        body: serde_json::from_slice(&body).ok(),
    });

    if auth.as_deref() != Some("Bearer tok") {
        return (StatusCode::UNAUTHORIZED, String::new());
    }

    let body = match (method.as_str(), uri.path()) {
        ("GET", "/passkeys") if uri.query() == Some("password=p%40ss%20word") => {
            json!({"id": 1, "publicKey": "pk"}).to_string()
        }
        ("GET", "/passkeys") => {
            json!({"errors": {"message": "Password Not Correct"}}).to_string()
        }
        ("GET", "/notes/") => {
            json!({"content": [{"id": 5, "content": "a"}]}).to_string()
        }
        ("POST", "/notes/user-notes") => {
            json!([{"sendNoteId": -1, "realNoteId": 9, "modifyFlag": "1"}]).to_string()
        }
        ("PUT", _) => String::new(),
        _ => return (StatusCode::NOT_FOUND, String::new()),
    };
    (StatusCode::OK, body)
}

async fn serve() -> (HttpNotesApi, Recorder) {
    let recorder = Recorder::default();
    let router = Router::new()
        .fallback(respond)
        .with_state(recorder.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let api = HttpNotesApi::new(format!("http://{}/", addr)).unwrap();
    (api, recorder)
}

#[tokio::test]
async fn test_password_check_encodes_password_and_sends_token() {
    let (api, recorder) = serve().await;

    let key = api.verify_passkey(TOKEN, "p@ss word").await.unwrap();

    assert_eq!(key.public_key, "pk");
    let request = recorder.last();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.path, "/passkeys");
    assert_eq!(request.query.as_deref(), Some("password=p%40ss%20word"));
    assert_eq!(request.auth.as_deref(), Some("Bearer tok"));
}

#[tokio::test]
async fn test_password_error_body_decodes_to_wrong_password() {
    let (api, _recorder) = serve().await;

    let err = api.verify_passkey(TOKEN, "nope").await.unwrap_err();

    assert_eq!(err, ApiError::WrongPassword);
}

#[tokio::test]
async fn test_notes_page_query_and_wrapped_body() {
    let (api, recorder) = serve().await;

    let notes = api.fetch_notes_page(TOKEN, 2, 25, "pw").await.unwrap();

    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].note_id, 5);
    assert_eq!(notes[0].content, "a");
    let request = recorder.last();
    assert_eq!(request.path, "/notes/");
    assert_eq!(request.query.as_deref(), Some("page=2&size=25&password=pw"));
}

#[tokio::test]
async fn test_sync_batch_sends_minimal_payload() {
    let (api, recorder) = serve().await;
    let batch = SyncBatchRequest {
        notes: vec![SyncNotePayload {
            note_id: -1,
            content: Some("buy milk".into()),
            properties: None,
            is_deleted: None,
        }],
    };

    let results = api.sync_notes(TOKEN, &batch).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].real_note_id, 9);
    assert!(results[0].modify_flag);
    let request = recorder.last();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.path, "/notes/user-notes");
    assert_eq!(
        request.body,
        Some(json!({"notes": [{"noteId": -1, "content": "buy milk"}]}))
    );
}

#[tokio::test]
async fn test_put_bodies() {
    let (api, recorder) = serve().await;

    api.update_content(TOKEN, 5, "new").await.unwrap();
    let request = recorder.last();
    assert_eq!(request.method, Method::PUT);
    assert_eq!(request.path, "/notes/content/5");
    assert_eq!(request.body, Some(json!({"content": "new"})));

    let mut properties = serde_json::Map::new();
    properties.insert("x".into(), json!(1.5));
    api.update_properties(TOKEN, 5, &properties).await.unwrap();
    let request = recorder.last();
    assert_eq!(request.path, "/notes/properties/5");
    assert_eq!(request.body, Some(json!({"x": 1.5})));
}

#[tokio::test]
async fn test_rejected_token_is_auth_required() {
    let (api, recorder) = serve().await;

    let err = api.get_passkey("stale").await.unwrap_err();

    assert_eq!(err, ApiError::AuthRequired);
    assert_eq!(recorder.last().path, "/passkeys-user");
}
