//! How a flow talks to the human in front of it.

use serde::{Deserialize, Serialize};

/// What the user needs to finish a device flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevicePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in_secs: u64,
}

/// Host hook for displaying codes and opening URLs.
pub trait UserPrompt: Send + Sync {
    /// Show the user code and where to enter it.
    fn show_device_code(&self, prompt: &DevicePrompt);

    /// Open (or print) the authorization URL for the redirect flow.
    fn open_authorization_url(&self, url: &str);
}

/// Writes prompts to the log. Suitable for headless agents whose logs a
/// human watches.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrompt;

impl UserPrompt for LogPrompt {
    fn show_device_code(&self, prompt: &DevicePrompt) {
        tracing::info!(
            user_code = %prompt.user_code,
            verification_uri = %prompt.verification_uri,
            "enter this code at the URL shown to authorize"
        );
        if let Some(complete) = &prompt.verification_uri_complete {
            tracing::info!(url = %complete, "or open this URL directly");
        }
    }

    fn open_authorization_url(&self, url: &str) {
        tracing::info!(url = %url, "open this URL in your browser to authorize");
    }
}
