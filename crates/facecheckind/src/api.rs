//! Client for the remote attendance API.
//!
//! Four plain REST calls: the label listing, avatar images, and the two
//! multipart attendance endpoints. Nothing is retried here; callers decide
//! what a failure means.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const LABELS_PATH: &str = "/api/face/labels";
const CHECK_IN_PATH: &str = "/api/face/attendance";
const CHECK_OUT_PATH: &str = "/api/face/checkout";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
}

/// Employee identifier as issued by the API; numeric or textual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmployeeId {
    Number(i64),
    Text(String),
}

impl EmployeeId {
    /// `0` and empty strings are placeholders in the listing, not real ids.
    pub fn is_blank(&self) -> bool {
        match self {
            EmployeeId::Number(n) => *n == 0,
            EmployeeId::Text(s) => s.trim().is_empty(),
        }
    }
}

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmployeeId::Number(n) => write!(f, "{n}"),
            EmployeeId::Text(s) => f.write_str(s),
        }
    }
}

/// One entry of the label listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeLabel {
    pub label: String,
    pub id: EmployeeId,
    /// Avatar path relative to the API host; may be absent or empty.
    #[serde(default)]
    pub avatar: Option<String>,
}

impl EmployeeLabel {
    pub fn avatar_path(&self) -> Option<&str> {
        self.avatar.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }
}

/// Body of both attendance endpoints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttendanceResponse {
    pub status: String,
    #[serde(default)]
    pub time: Option<String>,
}

/// What the check-in endpoint reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInStatus {
    CheckedIn,
    AlreadyCheckedIn,
    Other(String),
}

/// What the checkout endpoint reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutStatus {
    CheckedOut,
    /// Anything else, in practice "already checked out".
    Other(String),
}

impl AttendanceResponse {
    pub fn check_in_status(&self) -> CheckInStatus {
        match self.status.as_str() {
            "checked-in" => CheckInStatus::CheckedIn,
            "already checked-in" => CheckInStatus::AlreadyCheckedIn,
            other => CheckInStatus::Other(other.to_string()),
        }
    }

    pub fn check_out_status(&self) -> CheckOutStatus {
        match self.status.as_str() {
            "checked-out" => CheckOutStatus::CheckedOut,
            other => CheckOutStatus::Other(other.to_string()),
        }
    }

    /// Server time rendered as local wall-clock `HH:MM:SS`, falling back to the raw string.
    pub fn local_time(&self) -> Option<String> {
        let raw = self.time.as_deref()?;
        Some(match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t.with_timezone(&Local).format("%H:%M:%S").to_string(),
            Err(_) => raw.to_string(),
        })
    }
}

/// Remote attendance operations.
#[async_trait]
pub trait AttendanceApi: Send + Sync {
    /// GET the employee label listing.
    async fn fetch_labels(&self) -> Result<Vec<EmployeeLabel>, ApiError>;
    /// GET an avatar image by the path found in the listing.
    async fn fetch_avatar(&self, avatar: &str) -> Result<Vec<u8>, ApiError>;
    /// POST a check-in with a JPEG snapshot.
    async fn check_in(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError>;
    /// POST a checkout with a JPEG snapshot.
    async fn check_out(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError>;
}

/// `reqwest`-backed [`AttendanceApi`].
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("facecheckind/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    async fn post_snapshot(
        &self,
        path: &str,
        image_field: &'static str,
        user_id: &EmployeeId,
        snapshot: &[u8],
    ) -> Result<AttendanceResponse, ApiError> {
        let image = Part::bytes(snapshot.to_vec())
            .file_name(format!("{user_id}.jpg"))
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("user_id", user_id.to_string())
            .part(image_field, image);

        let url = self.url(path);
        let response = self.client.post(&url).multipart(form).send().await?;
        let response = check_status(&url, response)?;
        Ok(response.json().await?)
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status { url: url.to_string(), status: status.as_u16() })
    }
}

#[async_trait]
impl AttendanceApi for ApiClient {
    async fn fetch_labels(&self) -> Result<Vec<EmployeeLabel>, ApiError> {
        let url = self.url(LABELS_PATH);
        let response = check_status(&url, self.client.get(&url).send().await?)?;
        Ok(response.json().await?)
    }

    async fn fetch_avatar(&self, avatar: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.url(avatar);
        let response = check_status(&url, self.client.get(&url).send().await?)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn check_in(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError> {
        self.post_snapshot(CHECK_IN_PATH, "img_checkin", user_id, snapshot).await
    }

    async fn check_out(&self, user_id: &EmployeeId, snapshot: &[u8]) -> Result<AttendanceResponse, ApiError> {
        self.post_snapshot(CHECK_OUT_PATH, "img_checkout", user_id, snapshot).await
    }
}
