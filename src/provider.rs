//! LLM provider contract and adapters
//!
//! The pipeline consumes `summarize(subject, body)` returning a structured
//! outcome, plus a coarse capability tier that drives chunking and prompt
//! strategy. Two adapters ship here: an OpenAI-compatible cloud client
//! (with a Gemini-native branch) and a llama.cpp-style local CLI shim.
//! Provider output is untrusted text; parsing goes through the `jsonish`
//! cascade and transport failures degrade to an unavailable marker rather
//! than failing the message.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::creds;
use crate::errors::{AppError, AppResult};
use crate::jsonish;
use crate::settings::Settings;

/// Local inference invocations can legitimately take minutes
const LOCAL_CLI_TIMEOUT: Duration = Duration::from_secs(600);
/// Cloud request timeout
const CLOUD_TIMEOUT: Duration = Duration::from_secs(120);
/// Bodies are clipped before prompting to bound request size
const CLOUD_BODY_CLIP: usize = 12_000;

/// Coarse capability label reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Standard,
    Cloud,
}

/// Structured summarization result
#[derive(Debug, Clone, Default)]
pub struct LlmOutcome {
    pub summary: String,
    pub tags: Vec<String>,
    pub backlinks: Vec<String>,
    pub personal: bool,
}

/// Anything that can summarize one (subject, body) pair
///
/// The orchestrator is generic over this so tests can script outcomes.
pub trait Summarize {
    fn tier(&self) -> Tier;
    fn summarize(
        &self,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = AppResult<LlmOutcome>> + Send;
}

/// Configured provider, selected from settings
pub enum LlmProvider {
    Cloud(CloudProvider),
    LocalCli(LocalCliProvider),
}

impl Summarize for LlmProvider {
    fn tier(&self) -> Tier {
        match self {
            Self::Cloud(p) => p.tier(),
            Self::LocalCli(p) => p.tier(),
        }
    }

    async fn summarize(&self, subject: &str, body: &str) -> AppResult<LlmOutcome> {
        match self {
            Self::Cloud(p) => p.summarize(subject, body).await,
            Self::LocalCli(p) => p.summarize(subject, body).await,
        }
    }
}

/// Resolve the provider from settings, verifying its prerequisites
///
/// Fails fast with `LlmNotReady` before any pipeline side effect: a missing
/// local engine/model or an unset cloud key must abort the whole job.
pub fn get_provider(settings: &Settings) -> AppResult<LlmProvider> {
    match settings.llm_backend.as_str() {
        "cloud" => {
            let provider_name = settings.cloud_provider.as_str();
            let (base_url, default_model) = cloud_endpoint(provider_name);
            let api_key = creds::lookup(&creds::service_id(provider_name), "api_key")?
                .ok_or_else(|| {
                    AppError::LlmNotReady(format!("{provider_name} API key not stored"))
                })?;
            let model = if settings.cloud_model.trim().is_empty() {
                default_model.to_owned()
            } else {
                settings.cloud_model.clone()
            };
            Ok(LlmProvider::Cloud(CloudProvider::new(
                SecretString::new(api_key.into()),
                model,
                base_url.to_owned(),
            )))
        }
        _ => {
            let engine = PathBuf::from(settings.local_engine_path.trim());
            if settings.local_engine_path.trim().is_empty() || !engine.is_file() {
                return Err(AppError::LlmNotReady("local engine not installed".to_owned()));
            }
            let model = PathBuf::from(settings.local_model_path.trim());
            if settings.local_model_path.trim().is_empty() || !model.is_file() {
                return Err(AppError::LlmNotReady("local model not installed".to_owned()));
            }
            Ok(LlmProvider::LocalCli(LocalCliProvider::new(engine, model)))
        }
    }
}

/// Base URL and default model per cloud provider name
fn cloud_endpoint(provider: &str) -> (&'static str, &'static str) {
    match provider {
        "google" => ("https://generativelanguage.googleapis.com", "gemini-2.5-flash"),
        "upstage" => ("https://api.upstage.ai/v1/solar", "solar-mini"),
        "anthropic" => ("https://api.anthropic.com/v1", "claude-3-5-haiku-20241022"),
        "openrouter" => ("https://openrouter.ai/api/v1", "openai/gpt-4o-mini"),
        _ => ("https://api.openai.com/v1", "gpt-4o-mini"),
    }
}

/// OpenAI-compatible chat-completions client with a Gemini-native branch
pub struct CloudProvider {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl CloudProvider {
    pub fn new(api_key: SecretString, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::Cloud
    }

    pub async fn summarize(&self, subject: &str, body: &str) -> AppResult<LlmOutcome> {
        let prompt = build_cloud_prompt(subject, body);
        if self.base_url.contains("generativelanguage.googleapis.com") {
            return Ok(self.summarize_gemini(&prompt).await);
        }
        Ok(self.summarize_chat(&prompt).await)
    }

    async fn summarize_chat(&self, prompt: &str) -> LlmOutcome {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .timeout(CLOUD_TIMEOUT)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.2,
            }));
        if self.base_url.contains("openrouter.ai") {
            req = req.header("X-Title", "MailDigest");
        }
        if self.base_url.contains("api.anthropic.com") {
            req = req.header("anthropic-version", "2023-06-01");
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return unavailable(&format!("(LLM unavailable: {e})")),
        };
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let clip: String = text.chars().take(100).collect();
            return unavailable(&format!("(LLM error: {status} {clip})"));
        }
        let content = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                v["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::to_owned)
            })
            .unwrap_or_default();
        parse_outcome(&content)
    }

    /// Gemini native generateContent with bounded 429 retries
    ///
    /// A 429 whose body reports a zero daily limit is fatal immediately:
    /// retrying a key with no quota only burns time.
    async fn summarize_gemini(&self, prompt: &str) -> LlmOutcome {
        let mut model_id = self.model.clone();
        if !model_id.starts_with("models/") {
            model_id = format!("models/{model_id}");
        }
        let url = format!(
            "{}/v1beta/{model_id}:generateContent?key={}",
            self.base_url,
            self.api_key.expose_secret()
        );
        let payload = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": 0.2, "response_mime_type": "application/json"},
        });

        let mut last_status = String::new();
        let mut last_body = String::new();
        for attempt in 0..3u32 {
            let resp = self
                .client
                .post(&url)
                .timeout(CLOUD_TIMEOUT)
                .json(&payload)
                .send()
                .await;
            match resp {
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        if body.contains("\"limit\": 0") || body.contains("\"limit\":0") {
                            let clip: String = body.chars().take(100).collect();
                            return unavailable(&format!(
                                "(Gemini quota error: daily limit is 0 for this key: {clip})"
                            ));
                        }
                        last_status = status.to_string();
                        last_body = body;
                        tokio::time::sleep(Duration::from_secs(2 * u64::from(attempt + 1))).await;
                        continue;
                    }
                    if !status.is_success() {
                        let clip: String = body.chars().take(200).collect();
                        return unavailable(&format!("(Gemini error {status}: {clip})"));
                    }
                    let content = serde_json::from_str::<Value>(&body)
                        .ok()
                        .and_then(|v| {
                            v["candidates"][0]["content"]["parts"][0]["text"]
                                .as_str()
                                .map(str::to_owned)
                        })
                        .unwrap_or_default();
                    return parse_outcome(&content);
                }
                Err(e) => {
                    last_body = e.to_string();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        let clip: String = last_body.chars().take(200).collect();
        unavailable(&format!(
            "(Gemini failed after retries. Last status {last_status}: {clip})"
        ))
    }
}

/// Local llama.cpp-style CLI shim
///
/// Invokes the configured binary per call. The persistent-server variant is
/// a natural follow-up once the engine installer lands, but per-call
/// invocation keeps cancellation terminative and state trivial.
pub struct LocalCliProvider {
    engine_path: PathBuf,
    model_path: PathBuf,
}

impl LocalCliProvider {
    pub fn new(engine_path: PathBuf, model_path: PathBuf) -> Self {
        Self {
            engine_path,
            model_path,
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::Standard
    }

    pub async fn summarize(&self, subject: &str, body: &str) -> AppResult<LlmOutcome> {
        let prompt = build_cloud_prompt(subject, body);
        let child = Command::new(&self.engine_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(&prompt)
            .arg("--n-predict")
            .arg("1024")
            .arg("--no-display-prompt")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(LOCAL_CLI_TIMEOUT, child).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                warn!(error = %e, "local engine spawn failed");
                return Ok(unavailable(&format!("(LLM unavailable: {e})")));
            }
            Err(_) => {
                warn!("local engine timed out");
                return Ok(unavailable("(LLM unavailable: inference timed out)"));
            }
        };

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(parse_outcome(&text))
    }
}

fn unavailable(summary: &str) -> LlmOutcome {
    LlmOutcome {
        summary: summary.to_owned(),
        ..LlmOutcome::default()
    }
}

/// Shared summarization prompt carrying the JSON output contract
fn build_cloud_prompt(subject: &str, body: &str) -> String {
    let clipped: String = body.chars().take(CLOUD_BODY_CLIP).collect();
    format!(
        concat!(
            "You are an expert editor summarizing business communications.\n",
            "Return ONLY a single valid JSON object with keys: summary, tags (array of strings), ",
            "backlinks (array of strings), personal (boolean).\n",
            "The summary MUST be a structural bullet list (JSON array of strings).\n",
            "**Crucial Rules**:\n",
            "1. Ignore all footer/technical noise: addresses, phone numbers, unsubscribe links, ",
            "copyright, registration numbers, or technical part markers.\n",
            "2. Do NOT mention keywords like '정보통신망', '수신거부', '무단전재', '대표전화', '서울특별시'.\n",
            "3. Use bold grouping headers like **[Topic Name]** for related points.\n",
            "4. Ensure each group has at least 2 detailed points.\n",
            "Write everything in Korean.\n\n",
            "Subject: {subject}\n\n",
            "Body:\n{body}\n"
        ),
        subject = subject,
        body = clipped,
    )
}

/// Parse untrusted provider text into a structured outcome
fn parse_outcome(text: &str) -> LlmOutcome {
    if text.trim().is_empty() {
        return unavailable(jsonish::LLM_UNAVAILABLE);
    }

    if let Some(obj) = jsonish::extract_first_json_object(text) {
        let summary = obj
            .get("summary")
            .map(jsonish::coerce_summary_value)
            .unwrap_or_default();
        let outcome = LlmOutcome {
            summary,
            tags: string_list(obj.get("tags")),
            backlinks: string_list(obj.get("backlinks")),
            personal: obj.get("personal").and_then(Value::as_bool).unwrap_or(false),
        };
        if !outcome.summary.is_empty() {
            return finalize(outcome);
        }
    }

    let summary = jsonish::coerce_summary_text(text);
    finalize(LlmOutcome {
        summary: if summary.is_empty() {
            "(no summary)".to_owned()
        } else {
            summary
        },
        ..LlmOutcome::default()
    })
}

fn finalize(mut outcome: LlmOutcome) -> LlmOutcome {
    if jsonish::is_unusable(&outcome.summary) {
        outcome.summary = jsonish::LLM_UNAVAILABLE.to_owned();
    }
    outcome
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Remove NUL bytes and invalid sequences before prompting
///
/// Rust strings are already valid UTF-8, so unlike the archive decoders
/// this only has to strip NULs and control noise the backends choke on.
pub fn sanitize_text_for_llm(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\0' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Tier, cloud_endpoint, parse_outcome, sanitize_text_for_llm, string_list};

    #[test]
    fn structured_json_parses_into_outcome() {
        let out = parse_outcome(
            r#"{"summary": ["요점 하나", "요점 둘"], "tags": ["뉴스"], "backlinks": ["AI"], "personal": true}"#,
        );
        assert_eq!(out.summary, "- 요점 하나\n- 요점 둘");
        assert_eq!(out.tags, vec!["뉴스"]);
        assert_eq!(out.backlinks, vec!["AI"]);
        assert!(out.personal);
    }

    #[test]
    fn prose_output_passes_through_as_summary() {
        let out = parse_outcome("- bullet one\n- bullet two");
        assert_eq!(out.summary, "- bullet one\n- bullet two");
        assert!(out.tags.is_empty());
    }

    #[test]
    fn unusable_output_becomes_the_marker() {
        let out = parse_outcome("loading model from /tmp/x.gguf ...");
        assert_eq!(out.summary, "(LLM unavailable)");
        let out = parse_outcome("");
        assert_eq!(out.summary, "(LLM unavailable)");
    }

    #[test]
    fn endpoint_table_covers_known_providers() {
        assert_eq!(cloud_endpoint("openai").1, "gpt-4o-mini");
        assert!(cloud_endpoint("google").0.contains("generativelanguage"));
        assert_eq!(cloud_endpoint("unknown").0, "https://api.openai.com/v1");
    }

    #[test]
    fn tier_labels_are_stable() {
        assert_ne!(Tier::Fast, Tier::Cloud);
        assert_eq!(Tier::Standard, Tier::Standard);
    }

    #[test]
    fn nul_bytes_are_stripped_for_llm_input() {
        assert_eq!(sanitize_text_for_llm("a\0b"), "a b");
    }

    #[test]
    fn string_list_ignores_non_strings() {
        let v = serde_json::json!(["a", 1, " b ", ""]);
        assert_eq!(string_list(Some(&v)), vec!["a", "b"]);
    }
}
