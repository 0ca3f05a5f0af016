use serde::{Deserialize, Serialize};

/// Response envelope shared by the backend's REST endpoints.
///
/// `errorCode == 0` means success; anything else comes with a human-readable
/// `errorMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub error_code: i64,

    #[serde(default)]
    pub error_message: Option<String>,

    pub payload: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Returns true if the backend reported success.
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Error text for a failed response, falling back to the numeric code.
    pub fn error_text(&self) -> String {
        self.error_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("error code {}", self.error_code))
    }
}
