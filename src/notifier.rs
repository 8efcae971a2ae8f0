use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

const CLASSIFIER_URL_ENV: &str = "MAILFEED_CLASSIFIER_URL";

/// Downstream classification trigger. The sync pass signals "N new emails
/// are available" and moves on; delivery is spawned as a detached task and
/// its outcome is never observed by the caller.
#[derive(Debug, Clone)]
pub struct ClassifierHook {
    client: Client,
    url: Option<String>,
}

impl ClassifierHook {
    pub fn from_env() -> Self {
        let url = std::env::var(CLASSIFIER_URL_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self::new(url)
    }

    pub fn new(url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn fire(&self, new_emails: usize) {
        let Some(url) = self.url.clone() else {
            debug!(new_emails, "no classifier hook configured");
            return;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            match client
                .post(&url)
                .json(&json!({ "new_emails": new_emails }))
                .send()
                .await
            {
                Ok(response) => {
                    debug!(status = %response.status(), "classifier hook delivered");
                }
                Err(error) => {
                    warn!(%error, "classifier hook delivery failed");
                }
            }
        });
    }
}
