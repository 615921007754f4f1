//! Post-session transcript analysis.
//!
//! When a session ends cleanly its transcript path is handed to a [`SessionSummarizer`]. The
//! call returns immediately; the work happens on a detached task and only ever logs its
//! outcome. The LLM-backed implementation sends the transcript to an OpenAI-compatible chat
//! completion endpoint and stores the answer next to the transcript as `<name>.log.summary`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::configuration::types::SummaryConfig;
use crate::error_handling::types::SummaryError;

const SYSTEM_PROMPT: &str = "You are a security analyst specializing in SSH session analysis.";
const TEMPERATURE: f32 = 0.3;

/// Receives finished transcripts. Implementations must not block the caller.
pub trait SessionSummarizer: Send + Sync {
    fn submit(&self, transcript: PathBuf);

    fn enabled(&self) -> bool {
        true
    }
}

/// Used when summaries are turned off or no API key is configured.
pub struct DisabledSummarizer;

impl SessionSummarizer for DisabledSummarizer {
    fn submit(&self, transcript: PathBuf) {
        debug!(
            "Session summary disabled, skipping {}",
            transcript.display()
        );
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// Builds the summarizer described by the configuration.
pub fn from_config(config: &SummaryConfig) -> Arc<dyn SessionSummarizer> {
    if !config.enabled || config.api_key.is_empty() {
        info!("LLM summarization is disabled or API key is missing");
        return Arc::new(DisabledSummarizer);
    }

    match LlmSummarizer::new(config.clone()) {
        Ok(summarizer) => Arc::new(summarizer),
        Err(e) => {
            warn!("Unable to build the summary client, summaries disabled: {}", e);
            Arc::new(DisabledSummarizer)
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn build_prompt(transcript: &str) -> String {
    format!(
        "
Analyze the following SSH session log and provide a security assessment:

1. Identify all commands executed during the session
2. Flag any potentially suspicious or dangerous commands
3. Evaluate the overall security risk (low, medium, high)
4. Provide recommendations if any security concerns are identified

SSH Session Log:
{}
",
        transcript
    )
}

const EXCERPT_LEN: usize = 200;

/// Decodes a chat completion body. A body that does not parse is reported with its beginning.
fn parse_response(body: &str) -> Result<ChatResponse, SummaryError> {
    serde_json::from_str(body).map_err(|e| {
        let excerpt: String = body.chars().take(EXCERPT_LEN).collect();
        SummaryError::BadResponse(format!("{}: {}", e, excerpt))
    })
}

/// Path of the summary written for `transcript`.
pub fn summary_path(transcript: &Path) -> PathBuf {
    let mut name = transcript.as_os_str().to_os_string();
    name.push(".summary");
    PathBuf::from(name)
}

#[derive(Clone)]
pub struct LlmSummarizer {
    client: reqwest::Client,
    config: SummaryConfig,
}

impl LlmSummarizer {
    pub fn new(config: SummaryConfig) -> Result<Self, SummaryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Reads the transcript, asks the model for an assessment and writes it next to the
    /// transcript. Returns the summary path.
    pub async fn summarize(&self, transcript: &Path) -> Result<PathBuf, SummaryError> {
        let content = tokio::fs::read_to_string(transcript).await?;

        let summary = match self.config.provider.as_str() {
            "openai" => self.call_openai(&content).await?,
            other => return Err(SummaryError::UnsupportedProvider(other.to_string())),
        };

        let out = summary_path(transcript);
        tokio::fs::write(&out, summary.as_bytes()).await?;
        Ok(out)
    }

    async fn call_openai(&self, transcript: &str) -> Result<String, SummaryError> {
        let prompt = build_prompt(transcript);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummaryError::Http(format!("API error ({}): {}", status, body)));
        }

        let body = response.text().await?;
        let parsed = parse_response(&body)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SummaryError::BadResponse(String::from("no message content")))
    }
}

impl SessionSummarizer for LlmSummarizer {
    fn submit(&self, transcript: PathBuf) {
        let this = self.clone();
        tokio::spawn(async move {
            info!(
                "Starting asynchronous security analysis of session: {}",
                transcript.display()
            );
            match this.summarize(&transcript).await {
                Ok(out) => info!("Security analysis written to {}", out.display()),
                Err(e) => warn!("Error summarizing session {}: {}", transcript.display(), e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves exactly one HTTP request with the given status and body, returning the raw
    /// request text.
    async fn one_shot_server(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });

        (format!("http://{}/v1/chat/completions", addr), handle)
    }

    fn test_config(endpoint: String) -> SummaryConfig {
        SummaryConfig {
            enabled: true,
            provider: String::from("openai"),
            api_key: String::from("sk-test"),
            model: String::from("test-model"),
            endpoint,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_summarize_writes_summary_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (endpoint, server) = one_shot_server(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"Risk: low"}}]}"#,
        )
        .await;

        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("alice_20240101-120000.log");
        std::fs::write(&transcript, "$ uptime\n").unwrap();

        let summarizer = LlmSummarizer::new(test_config(endpoint)).unwrap();
        let out = summarizer.summarize(&transcript).await.unwrap();

        assert_eq!(out, dir.path().join("alice_20240101-120000.log.summary"));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "Risk: low");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));

        let (_, body) = request.split_once("\r\n\r\n").unwrap();
        let sent: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(sent["model"], "test-model");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1]["role"], "user");
        assert!(sent["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("$ uptime"));
        assert!((sent["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_non_json_answer_is_bad_response() {
        let (endpoint, server) = one_shot_server("200 OK", "<html>gateway</html>").await;

        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("erin.log");
        std::fs::write(&transcript, "ls\n").unwrap();

        let summarizer = LlmSummarizer::new(test_config(endpoint)).unwrap();
        match summarizer.summarize(&transcript).await {
            Err(SummaryError::BadResponse(reason)) => {
                assert!(reason.ends_with("<html>gateway</html>"))
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("summary should fail"),
        }
        assert!(!summary_path(&transcript).exists());
        server.await.unwrap();
    }

    #[test]
    fn test_response_without_content_parses() {
        let parsed = parse_response(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert!(parsed.choices[0].message.content.is_none());
        assert!(parse_response(r#"{"id":"x"}"#).unwrap().choices.is_empty());
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let (endpoint, server) =
            one_shot_server("401 Unauthorized", r#"{"error":"bad key"}"#).await;

        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("bob.log");
        std::fs::write(&transcript, "ls\n").unwrap();

        let summarizer = LlmSummarizer::new(test_config(endpoint)).unwrap();
        let result = summarizer.summarize(&transcript).await;
        assert!(matches!(result, Err(SummaryError::Http(_))));
        assert!(!summary_path(&transcript).exists());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_choices_is_bad_response() {
        let (endpoint, server) = one_shot_server("200 OK", r#"{"choices":[]}"#).await;

        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("carol.log");
        std::fs::write(&transcript, "ls\n").unwrap();

        let summarizer = LlmSummarizer::new(test_config(endpoint)).unwrap();
        let result = summarizer.summarize(&transcript).await;
        assert!(matches!(result, Err(SummaryError::BadResponse(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("dave.log");
        std::fs::write(&transcript, "ls\n").unwrap();

        let mut config = test_config(String::from("http://127.0.0.1:9/"));
        config.provider = String::from("anthropic");
        let summarizer = LlmSummarizer::new(config).unwrap();
        assert!(matches!(
            summarizer.summarize(&transcript).await,
            Err(SummaryError::UnsupportedProvider(p)) if p == "anthropic"
        ));
    }

    #[tokio::test]
    async fn test_missing_transcript_is_io_error() {
        let summarizer =
            LlmSummarizer::new(test_config(String::from("http://127.0.0.1:9/"))).unwrap();
        assert!(matches!(
            summarizer.summarize(Path::new("/nonexistent/x.log")).await,
            Err(SummaryError::IoError(_))
        ));
    }

    #[test]
    fn test_from_config_disabled_without_key() {
        let mut config = test_config(String::from("http://127.0.0.1:9/"));
        config.api_key.clear();
        assert!(!from_config(&config).enabled());

        let mut config = test_config(String::from("http://127.0.0.1:9/"));
        config.enabled = false;
        assert!(!from_config(&config).enabled());
    }

    #[tokio::test]
    async fn test_from_config_enabled() {
        let config = test_config(String::from("http://127.0.0.1:9/"));
        assert!(from_config(&config).enabled());
    }

    #[test]
    fn test_prompt_embeds_transcript() {
        let prompt = build_prompt("$ rm -rf /\n");
        assert!(prompt.contains("provide a security assessment"));
        assert!(prompt.ends_with("SSH Session Log:\n$ rm -rf /\n\n"));
    }
}
