use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "codellama";

#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum AssistantError {
    Unreachable { endpoint: String, message: String },
    Rejected { status: u16 },
    Decode { message: String },
}

impl std::fmt::Display for AssistantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssistantError::Unreachable { endpoint, message } => {
                write!(f, "inference server unreachable at {endpoint}: {message}")
            }
            AssistantError::Rejected { status } => {
                write!(f, "inference server rejected the request with status {status}")
            }
            AssistantError::Decode { message } => {
                write!(f, "failed to decode inference response: {message}")
            }
        }
    }
}

impl std::error::Error for AssistantError {}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<Value>,
}

#[derive(Clone)]
pub struct AssistantClient {
    config: AssistantConfig,
    client: reqwest::Client,
}

impl AssistantClient {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            config: AssistantConfig {
                base_url: normalize_base_url(&config.base_url),
                ..config
            },
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub async fn generate(&self, request: &str) -> Result<String, AssistantError> {
        self.complete(&generation_prompt(request)).await
    }

    pub async fn review(&self, code: &str) -> Result<String, AssistantError> {
        self.complete(&review_prompt(code)).await
    }

    // The model list passes through verbatim; the caller decides what it
    // cares about.
    pub async fn models(&self) -> Result<Vec<Value>, AssistantError> {
        let endpoint = format!("{}/api/tags", self.config.base_url);
        let response = self
            .client
            .get(&endpoint)
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .map_err(|err| unreachable_error(&endpoint, &err))?;
        if !response.status().is_success() {
            return Err(AssistantError::Rejected {
                status: response.status().as_u16(),
            });
        }
        let tags = response
            .json::<TagsResponse>()
            .await
            .map_err(|err| AssistantError::Decode {
                message: err.to_string(),
            })?;
        Ok(tags.models)
    }

    async fn complete(&self, prompt: &str) -> Result<String, AssistantError> {
        // A short probe first: a dead server fails in probe_timeout instead
        // of tying the caller up for the whole completion timeout.
        self.ensure_reachable().await?;

        let endpoint = format!("{}/api/generate", self.config.base_url);
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
        };
        let response = self
            .client
            .post(&endpoint)
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| unreachable_error(&endpoint, &err))?;
        if !response.status().is_success() {
            warn!(
                status = response.status().as_u16(),
                model = %self.config.model,
                "inference request rejected"
            );
            return Err(AssistantError::Rejected {
                status: response.status().as_u16(),
            });
        }
        let payload = response
            .json::<GenerateResponse>()
            .await
            .map_err(|err| AssistantError::Decode {
                message: err.to_string(),
            })?;
        info!(
            model = %self.config.model,
            response_bytes = payload.response.len(),
            "inference completed"
        );
        Ok(payload.response)
    }

    async fn ensure_reachable(&self) -> Result<(), AssistantError> {
        let endpoint = format!("{}/api/tags", self.config.base_url);
        let response = self
            .client
            .get(&endpoint)
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .map_err(|err| unreachable_error(&endpoint, &err))?;
        if !response.status().is_success() {
            return Err(AssistantError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

fn unreachable_error(endpoint: &str, err: &reqwest::Error) -> AssistantError {
    AssistantError::Unreachable {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn generation_prompt(request: &str) -> String {
    format!(
        concat!(
            "You are an Arduino firmware expert. Write Arduino C/C++ code for this request:\n",
            "\n",
            "{}\n",
            "\n",
            "The sketch must be complete and compile as-is, include any required\n",
            "libraries and setup, carry brief comments, and follow common Arduino\n",
            "conventions.\n",
            "\n",
            "Arduino Code:\n"
        ),
        request
    )
}

fn review_prompt(code: &str) -> String {
    format!(
        concat!(
            "You are an Arduino firmware expert. Review the sketch below and report\n",
            "code quality, likely bugs, performance improvements, and best-practice\n",
            "fixes.\n",
            "\n",
            "```cpp\n",
            "{}\n",
            "```\n",
            "\n",
            "Review:\n"
        ),
        code
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = AssistantClient::new(AssistantConfig {
            base_url: "http://127.0.0.1:11434///".to_string(),
            ..AssistantConfig::default()
        });
        assert_eq!(client.base_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn prompts_embed_the_payload() {
        assert!(generation_prompt("blink twice").contains("blink twice"));
        assert!(review_prompt("void loop() {}").contains("void loop() {}"));
    }
}
