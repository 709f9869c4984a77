//! Remote Notes API client.
//!
//! The backend reports most failures as a JSON body of the shape
//! `{"errors": {"message": "..."}, "customCode": N}`, sometimes with a 2xx
//! status. Those bodies are decoded here, once, into [`ApiError`]; callers
//! match on the variant and never look at message strings.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::{BoardError, BoardResult};
use crate::models::{NoteId, NoteProperties};

const MSG_ALREADY_SET: &str = "Already Set Security Key";
const MSG_KEY_NOT_FOUND: &str = "Security Key Not Found";
const MSG_PAGE_EMPTY: &str = "Page is empty";
const MSG_DECRYPT_FAILED: &str = "Error Will Decrypt Content";
const MSG_PASSWORD_NOT_CORRECT: &str = "Password Not Correct";
const CODE_DECRYPT_FAILED: i64 = 1001;

/// Decoded remote outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// A passkey already exists for this account
    #[error("security key already set")]
    AlreadySet,

    /// The whiteboard password does not unlock the stored key material
    #[error("password is not correct")]
    WrongPassword,

    /// Pagination ran past the last page
    #[error("page is empty")]
    PageEmpty,

    /// The access token was rejected (HTTP 401/403)
    #[error("authentication required")]
    AuthRequired,

    /// No passkey has been set up for this account
    #[error("security key not found")]
    PasskeyNotFound,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response ({status}): {message}")]
    Unknown { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    errors: Option<ErrorMessage>,
    custom_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    #[serde(default)]
    message: String,
}

/// Map an error message, custom code and HTTP status to an [`ApiError`].
pub fn classify_error(status: u16, custom_code: Option<i64>, message: &str) -> ApiError {
    match message.trim() {
        MSG_ALREADY_SET => return ApiError::AlreadySet,
        MSG_KEY_NOT_FOUND => return ApiError::PasskeyNotFound,
        MSG_PAGE_EMPTY => return ApiError::PageEmpty,
        MSG_DECRYPT_FAILED | MSG_PASSWORD_NOT_CORRECT => return ApiError::WrongPassword,
        _ => {}
    }

    if custom_code == Some(CODE_DECRYPT_FAILED) {
        return ApiError::WrongPassword;
    }

    match status {
        401 | 403 => ApiError::AuthRequired,
        _ => ApiError::Unknown {
            status,
            message: message.to_string(),
        },
    }
}

/// Check a response for an error body or a non-success status.
pub fn check_response(status: u16, body: &str) -> Result<(), ApiError> {
    if let Ok(ErrorBody {
        errors: Some(errors),
        custom_code,
    }) = serde_json::from_str::<ErrorBody>(body)
    {
        return Err(classify_error(status, custom_code, &errors.message));
    }

    if !(200..300).contains(&status) {
        return Err(classify_error(status, None, body));
    }

    Ok(())
}

/// Decode a successful response body into `T`.
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, ApiError> {
    check_response(status, body)?;
    serde_json::from_str(body).map_err(|e| ApiError::Unknown {
        status,
        message: format!("unexpected response body: {}", e),
    })
}

/// Key material returned by the passkey endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyInfo {
    #[serde(default)]
    pub id: Option<i64>,
    pub public_key: String,
}

/// A note as the server returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNote {
    #[serde(alias = "id")]
    pub note_id: NoteId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub properties: NoteProperties,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotesPageBody {
    List(Vec<RemoteNote>),
    Page {
        #[serde(alias = "notes")]
        content: Vec<RemoteNote>,
    },
}

/// Body for `POST /notes/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRemoteNote {
    pub content: String,
    pub properties: NoteProperties,
}

/// One entry of a sync batch: only what changed since the last sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotePayload {
    pub note_id: NoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
}

/// Body for `POST /notes/user-notes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBatchRequest {
    pub notes: Vec<SyncNotePayload>,
}

/// Per-record outcome of a sync batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNoteResult {
    pub send_note_id: NoteId,
    pub real_note_id: NoteId,
    /// Server still considers changes pending for this note
    #[serde(deserialize_with = "deserialize_flag")]
    pub modify_flag: bool,
}

/// Accepts `true`/`false`, `1`/`0` and their string forms.
fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        serde_json::Value::String(s) => Ok(matches!(s.trim(), "1" | "true")),
        serde_json::Value::Null => Ok(false),
        other => Err(D::Error::custom(format!("invalid modify flag: {}", other))),
    }
}

/// The remote notes backend.
///
/// Every call takes the caller's access token; the implementation holds no
/// session state.
#[async_trait]
pub trait NotesApi: Send + Sync {
    /// `POST /passkeys?password=`: create key material for this password
    async fn create_passkey(&self, token: &str, password: &str) -> Result<PasskeyInfo, ApiError>;

    /// `GET /passkeys-user`: does this account have a passkey
    async fn get_passkey(&self, token: &str) -> Result<PasskeyInfo, ApiError>;

    /// `GET /passkeys?password=`: check a password against the stored key
    async fn verify_passkey(&self, token: &str, password: &str) -> Result<PasskeyInfo, ApiError>;

    /// `GET /notes/?page=&size=&password=`: one page of decrypted notes
    async fn fetch_notes_page(
        &self,
        token: &str,
        page: u32,
        size: u32,
        password: &str,
    ) -> Result<Vec<RemoteNote>, ApiError>;

    /// `POST /notes/user-notes`: push a batch of dirty notes
    async fn sync_notes(
        &self,
        token: &str,
        batch: &SyncBatchRequest,
    ) -> Result<Vec<SyncNoteResult>, ApiError>;

    /// `POST /notes/`: create a single note
    async fn create_note(&self, token: &str, note: &NewRemoteNote) -> Result<RemoteNote, ApiError>;

    /// `PUT /notes/content/{id}`
    async fn update_content(&self, token: &str, note_id: NoteId, content: &str)
        -> Result<(), ApiError>;

    /// `PUT /notes/properties/{id}`
    async fn update_properties(
        &self,
        token: &str,
        note_id: NoteId,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ApiError>;
}

/// [`NotesApi`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpNotesApi {
    client: Client,
    base_url: String,
}

impl HttpNotesApi {
    pub fn new(base_url: impl Into<String>) -> BoardResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BoardError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(u16, String), ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok((status, body))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let (status, body) = self.execute(request).await?;
        decode_response(status, &body)
    }
}

#[async_trait]
impl NotesApi for HttpNotesApi {
    async fn create_passkey(&self, token: &str, password: &str) -> Result<PasskeyInfo, ApiError> {
        let url = self.url(&format!("/passkeys?password={}", urlencoding::encode(password)));
        self.fetch(self.client.post(url).bearer_auth(token)).await
    }

    async fn get_passkey(&self, token: &str) -> Result<PasskeyInfo, ApiError> {
        let url = self.url("/passkeys-user");
        self.fetch(self.client.get(url).bearer_auth(token)).await
    }

    async fn verify_passkey(&self, token: &str, password: &str) -> Result<PasskeyInfo, ApiError> {
        let url = self.url(&format!("/passkeys?password={}", urlencoding::encode(password)));
        self.fetch(self.client.get(url).bearer_auth(token)).await
    }

    async fn fetch_notes_page(
        &self,
        token: &str,
        page: u32,
        size: u32,
        password: &str,
    ) -> Result<Vec<RemoteNote>, ApiError> {
        let url = self.url(&format!(
            "/notes/?page={}&size={}&password={}",
            page,
            size,
            urlencoding::encode(password)
        ));
        let body: NotesPageBody = self.fetch(self.client.get(url).bearer_auth(token)).await?;
        Ok(match body {
            NotesPageBody::List(notes) => notes,
            NotesPageBody::Page { content } => content,
        })
    }

    async fn sync_notes(
        &self,
        token: &str,
        batch: &SyncBatchRequest,
    ) -> Result<Vec<SyncNoteResult>, ApiError> {
        let url = self.url("/notes/user-notes");
        self.fetch(self.client.post(url).bearer_auth(token).json(batch))
            .await
    }

    async fn create_note(&self, token: &str, note: &NewRemoteNote) -> Result<RemoteNote, ApiError> {
        let url = self.url("/notes/");
        self.fetch(self.client.post(url).bearer_auth(token).json(note))
            .await
    }

    async fn update_content(
        &self,
        token: &str,
        note_id: NoteId,
        content: &str,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("/notes/content/{}", note_id));
        let body = serde_json::json!({ "content": content });
        let (status, text) = self
            .execute(self.client.put(url).bearer_auth(token).json(&body))
            .await?;
        check_response(status, &text)
    }

    async fn update_properties(
        &self,
        token: &str,
        note_id: NoteId,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("/notes/properties/{}", note_id));
        let (status, text) = self
            .execute(self.client.put(url).bearer_auth(token).json(properties))
            .await?;
        check_response(status, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_set_is_not_auth_failure() {
        let body = r#"{"errors":{"message":"Already Set Security Key"},"customCode":403}"#;
        assert_eq!(check_response(403, body), Err(ApiError::AlreadySet));
        assert_eq!(check_response(200, body), Err(ApiError::AlreadySet));
    }

    #[test]
    fn test_decrypt_error_is_wrong_password() {
        let body = r#"{"errors":{"message":"Error Will Decrypt Content"},"customCode":1001}"#;
        assert_eq!(check_response(400, body), Err(ApiError::WrongPassword));

        let code_only = r#"{"errors":{"message":"decrypt"},"customCode":1001}"#;
        assert_eq!(check_response(400, code_only), Err(ApiError::WrongPassword));
    }

    #[test]
    fn test_page_empty_and_key_not_found() {
        let body = r#"{"errors":{"message":"Page is empty"},"customCode":404}"#;
        assert_eq!(check_response(404, body), Err(ApiError::PageEmpty));

        let body = r#"{"errors":{"message":"Security Key Not Found"}}"#;
        assert_eq!(check_response(404, body), Err(ApiError::PasskeyNotFound));
    }

    #[test]
    fn test_plain_unauthorized_status() {
        assert_eq!(check_response(401, ""), Err(ApiError::AuthRequired));
        assert_eq!(check_response(403, "Forbidden"), Err(ApiError::AuthRequired));
    }

    #[test]
    fn test_unknown_error_keeps_status_and_message() {
        assert_eq!(
            check_response(500, "boom"),
            Err(ApiError::Unknown {
                status: 500,
                message: "boom".into()
            })
        );
    }

    #[test]
    fn test_decode_sync_results_with_numeric_and_bool_flags() {
        let body = r#"[
            {"sendNoteId": -3, "realNoteId": 450, "modifyFlag": 0},
            {"sendNoteId": 12, "realNoteId": 12, "modifyFlag": 1},
            {"sendNoteId": 13, "realNoteId": 13, "modifyFlag": true}
        ]"#;
        let results: Vec<SyncNoteResult> = decode_response(200, body).unwrap();

        assert_eq!(
            results[0],
            SyncNoteResult {
                send_note_id: -3,
                real_note_id: 450,
                modify_flag: false
            }
        );
        assert!(results[1].modify_flag);
        assert!(results[2].modify_flag);
    }

    #[test]
    fn test_notes_page_accepts_list_and_page_shapes() {
        let list = r#"[{"noteId": 1, "content": "a", "properties": {"x": 3}}]"#;
        let page = r#"{"content": [{"id": 2, "content": "b"}], "totalPages": 1}"#;

        let NotesPageBody::List(notes) = decode_response::<NotesPageBody>(200, list).unwrap() else {
            panic!("expected list shape");
        };
        assert_eq!(notes[0].note_id, 1);
        assert_eq!(notes[0].properties.x, 3.0);
        assert_eq!(notes[0].properties.width, NoteProperties::default().width);

        let NotesPageBody::Page { content } = decode_response::<NotesPageBody>(200, page).unwrap()
        else {
            panic!("expected page shape");
        };
        assert_eq!(content[0].note_id, 2);
    }

    #[test]
    fn test_sync_payload_omits_unchanged_fields() {
        let payload = SyncNotePayload {
            note_id: 7,
            content: None,
            properties: Some(NoteProperties::default().to_partial_json(["x"])),
            is_deleted: None,
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json, serde_json::json!({"noteId": 7, "properties": {"x": 0.0}}));
    }

    #[test]
    fn test_http_client_trims_base_url() {
        let api = HttpNotesApi::new("https://api.example.com/").unwrap();
        assert_eq!(api.base_url(), "https://api.example.com");
        assert_eq!(api.url("/notes/"), "https://api.example.com/notes/");
    }
}
