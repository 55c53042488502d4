use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const PLAIN_TEXT_MIME_TYPE: &str = "text/plain";
pub const FILE_LINK_KIND: &str = "drive#fileLink";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_files(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<FileList, DriveError> {
        let mut url = self.files_endpoint(&[])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            pairs.append_pair("maxResults", &max_results.to_string());
            if let Some(token) = page_token.filter(|t| !t.is_empty()) {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<FileResource, DriveError> {
        let url = self.files_endpoint(&[file_id])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn insert_file(&self, metadata: &FileMetadata) -> Result<FileResource, DriveError> {
        let url = self.files_endpoint(&[])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy_file(
        &self,
        source_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, DriveError> {
        let url = self.files_endpoint(&[source_id, "copy"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_file(
        &self,
        file_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, DriveError> {
        let url = self.files_endpoint(&[file_id])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn trash_file(&self, file_id: &str) -> Result<FileResource, DriveError> {
        let metadata = FileMetadata {
            labels: Some(Labels {
                trashed: Some(true),
            }),
            ..FileMetadata::default()
        };
        self.update_file(file_id, &metadata).await
    }

    pub async fn list_permissions(&self, file_id: &str) -> Result<Vec<Permission>, DriveError> {
        let url = self.files_endpoint(&[file_id, "permissions"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: PermissionList = Self::handle_response(response).await?;
        Ok(list.items)
    }

    pub async fn insert_permission(
        &self,
        file_id: &str,
        permission: &Permission,
        send_notification_emails: bool,
    ) -> Result<Permission, DriveError> {
        let mut url = self.files_endpoint(&[file_id, "permissions"])?;
        url.query_pairs_mut().append_pair(
            "sendNotificationEmails",
            if send_notification_emails {
                "true"
            } else {
                "false"
            },
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(permission)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn download_text(&self, file_id: &str) -> Result<String, DriveError> {
        let mut url = self.files_endpoint(&[file_id])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.text().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn upload_text(
        &self,
        file_id: &str,
        content: &str,
    ) -> Result<FileResource, DriveError> {
        let mut url = self.endpoint("/upload/drive/v2/files")?;
        url.path_segments_mut()
            .map_err(|_| DriveError::InvalidBaseUrl)?
            .push(file_id);
        url.query_pairs_mut().append_pair("uploadType", "media");
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, PLAIN_TEXT_MIME_TYPE)
            .body(content.to_string())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    fn files_endpoint(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.endpoint("/drive/v2/files")?;
        if !segments.is_empty() {
            url.path_segments_mut()
                .map_err(|_| DriveError::InvalidBaseUrl)?
                .extend(segments);
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DriveError::Api { status, body }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, body } => Some(classify_api_error(*status, body)),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::RateLimit))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Human readable message; prefers the `error.message` field of an API error body.
    pub fn message(&self) -> String {
        match self {
            DriveError::Api { status, body } => serde_json::from_str::<ApiErrorEnvelope>(body)
                .ok()
                .and_then(|envelope| envelope.error.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("api returned {status}")),
            other => other.to_string(),
        }
    }
}

fn classify_api_error(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limit_body(body) {
        ApiErrorClass::RateLimit
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn is_rate_limit_body(body: &str) -> bool {
    let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(body) else {
        return body.contains("User rate limit exceeded");
    };
    let by_reason = envelope.error.errors.iter().any(|detail| {
        matches!(
            detail.reason.as_deref(),
            Some("userRateLimitExceeded" | "rateLimitExceeded")
        )
    });
    by_reason
        || envelope
            .error
            .message
            .is_some_and(|message| message.eq_ignore_ascii_case("User rate limit exceeded"))
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResource {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ParentReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<Owner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParentReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub id: String,
}

impl ParentReference {
    pub fn file_link(id: impl Into<String>) -> Self {
        Self {
            kind: Some(FILE_LINK_KIND.to_string()),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub items: Vec<FileResource>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ParentReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Labels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    #[serde(rename = "type")]
    pub permission_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_link: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PermissionList {
    #[serde(default)]
    items: Vec<Permission>,
}
