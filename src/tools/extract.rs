//! Structured Extractor: sanitized playlist HTML → `CourseExtraction`, via an
//! OpenAI-compatible chat-completions endpoint pinned to a JSON schema.

use async_trait::async_trait;
use schemars::generate::SchemaSettings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::error::{HarvestError, HarvestResult};
use crate::core::types::{CourseExtraction, Taxonomy};
use crate::AppState;

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract(&self, html: &str) -> HarvestResult<CourseExtraction>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Output contract
// ─────────────────────────────────────────────────────────────────────────────

/// Keywords some structured-output backends reject; they add nothing the
/// field types do not already say.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "title", "format", "minimum"];

fn prune_schema(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                // `title` is also a property name of ours; only drop it as a keyword.
                if *key == "title" && map.get("title").map(|v| v.is_object()).unwrap_or(false) {
                    continue;
                }
                map.remove(*key);
            }
            for v in map.values_mut() {
                prune_schema(v);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(prune_schema),
        _ => {}
    }
}

static EXTRACTION_SCHEMA: OnceLock<serde_json::Value> = OnceLock::new();

/// JSON schema of `CourseExtraction` with every subschema inlined:
/// required `title` + `videos`; each video requires `url`, `title`,
/// `view_count` (integer) and may carry a `taxonomy` from the closed enum.
pub fn extraction_schema() -> &'static serde_json::Value {
    EXTRACTION_SCHEMA.get_or_init(|| {
        let generator = SchemaSettings::draft07()
            .with(|s| s.inline_subschemas = true)
            .into_generator();
        let schema = generator.into_root_schema_for::<CourseExtraction>();
        let mut value = serde_json::to_value(schema).unwrap_or_default();
        prune_schema(&mut value);
        value
    })
}

pub fn build_prompt(html: &str) -> String {
    let taxonomy = Taxonomy::ALL
        .iter()
        .map(|t| t.label())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"Extract course metadata from the following HTML of a video playlist page:
1. Course title (the playlist title)
2. For each video in the playlist, in page order:
   - Video title
   - URL (the relative link starting with /watch?v=)
   - View count as an integer (drop thousands separators and the "views" text)
   - Taxonomy, chosen from: {taxonomy}

Return JSON shaped like:
{{
  "title": "Course Title",
  "videos": [
    {{"url": "/watch?v=xyz", "title": "Video Title", "view_count": 1234, "taxonomy": "Physics"}}
  ]
}}

HTML:
{html}"#
    )
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse and validate a model response against the output contract.
pub fn parse_extraction(text: &str) -> HarvestResult<CourseExtraction> {
    serde_json::from_str::<CourseExtraction>(strip_code_fence(text))
        .map_err(|e| HarvestError::Schema(format!("extractor output rejected: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Gemini (OpenAI-compatible) extractor
// ─────────────────────────────────────────────────────────────────────────────

pub struct GeminiExtractor {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiExtractor {
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.http_client.clone(),
            state.config.llm.resolve_base_url(),
            state.credentials.gemini_api_key.clone(),
            state.config.llm.resolve_model(),
        )
    }

    fn request_body(&self, html: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                {"role": "user", "content": build_prompt(html)}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "course_info",
                    "schema": extraction_schema(),
                }
            }
        })
    }
}

#[async_trait]
impl StructuredExtractor for GeminiExtractor {
    async fn extract(&self, html: &str) -> HarvestResult<CourseExtraction> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let started = Instant::now();

        let response = self
            .http_client
            .post(url)
            .bearer_auth(self.api_key.trim())
            .json(&self.request_body(html))
            .send()
            .await
            .map_err(|e| match e.status() {
                Some(status) => HarvestError::http(
                    status.as_u16(),
                    format!("chat.completions request failed: {}", e),
                ),
                None => HarvestError::transport(format!("chat.completions request failed: {}", e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(500).collect();
            return Err(HarvestError::http(
                status.as_u16(),
                format!("chat.completions failed: status={} body={}", status, snippet),
            ));
        }

        // Reading the body can fail mid-stream; that is a transport failure,
        // only a complete body that does not parse is a schema failure.
        let body = response.text().await.map_err(|e| {
            HarvestError::transport(format!("reading chat.completions body failed: {}", e))
        })?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| HarvestError::Schema(format!("response is not JSON: {}", e)))?;

        let content = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| HarvestError::Schema("response carries no message content".into()))?;

        debug!(
            "chat.completions answered in {}ms ({} chars)",
            started.elapsed().as_millis(),
            content.len()
        );

        let extraction = parse_extraction(content)?;
        info!(
            "🧠 Extracted '{}' ({} videos)",
            extraction.title,
            extraction.videos.len()
        );
        Ok(extraction)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted extractor
// ─────────────────────────────────────────────────────────────────────────────

type Responder = dyn Fn(&str, usize) -> HarvestResult<String> + Send + Sync;

/// Answers each call with raw model text produced by a closure
/// `(html, call_index) -> text`, then runs it through `parse_extraction`
/// exactly as the live extractor does. Records the dispatch instant of
/// every call.
pub struct ScriptedExtractor {
    respond: Box<Responder>,
    calls: AtomicUsize,
    dispatched_at: Mutex<Vec<Instant>>,
}

impl ScriptedExtractor {
    pub fn new(
        respond: impl Fn(&str, usize) -> HarvestResult<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            dispatched_at: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn dispatch_instants(&self) -> Vec<Instant> {
        self.dispatched_at
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract(&self, html: &str) -> HarvestResult<CourseExtraction> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut v) = self.dispatched_at.lock() {
            v.push(Instant::now());
        }
        let text = (self.respond)(html, index)?;
        parse_extraction(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_required_fields() {
        let schema = extraction_schema();
        let top_required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(top_required.contains(&"title"));
        assert!(top_required.contains(&"videos"));

        let item = &schema["properties"]["videos"]["items"];
        let item_required: Vec<&str> = item["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        for f in ["url", "title", "view_count"] {
            assert!(item_required.contains(&f), "{f} not required");
        }
        assert!(!item_required.contains(&"taxonomy"));
        assert_eq!(item["properties"]["view_count"]["type"], "integer");
        assert!(item["properties"]["title"].is_object());
    }

    #[test]
    fn test_schema_lists_every_taxonomy_and_no_refs() {
        let text = extraction_schema().to_string();
        for t in Taxonomy::ALL {
            assert!(text.contains(t.label()), "{} missing", t.label());
        }
        assert!(!text.contains("$ref"));
        assert!(!text.contains("\"format\""));
    }

    #[test]
    fn test_prompt_embeds_html_and_taxonomy() {
        let prompt = build_prompt("<div>payload</div>");
        assert!(prompt.ends_with("<div>payload</div>"));
        assert!(prompt.contains("Business and Management"));
        assert!(prompt.contains("/watch?v="));
    }

    #[test]
    fn test_parse_extraction_accepts_fenced_json() {
        let text = "```json\n{\"title\":\"X\",\"videos\":[{\"url\":\"/watch?v=a\",\"title\":\"L1\",\"view_count\":5}]}\n```";
        let parsed = parse_extraction(text).unwrap();
        assert_eq!(parsed.title, "X");
        assert_eq!(parsed.videos[0].view_count, 5);
    }

    #[test]
    fn test_schema_violation_is_schema_error() {
        let err = parse_extraction(r#"{"title":"X","videos":[{"url":"/watch?v=z"}]}"#).unwrap_err();
        assert_eq!(err.kind(), "schema");
        let err = parse_extraction("not json at all").unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    /// One-shot HTTP server: reads a full request, writes `response` verbatim
    /// and closes the connection.
    async fn serve_once(response: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn extractor_for(base_url: String) -> GeminiExtractor {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        GeminiExtractor::new(client, base_url, "test-key", "gemini-1.5-flash")
    }

    #[tokio::test]
    async fn test_truncated_body_is_transport_error() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 500\r\n\r\n{\"choi"
                .to_string(),
        )
        .await;
        let err = extractor_for(base).extract("<p>x</p>").await.unwrap_err();
        assert_eq!(err.kind(), "transport", "{err}");
    }

    #[tokio::test]
    async fn test_complete_non_json_body_is_schema_error() {
        let body = "upstream says hello";
        let base = serve_once(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let err = extractor_for(base).extract("<p>x</p>").await.unwrap_err();
        assert_eq!(err.kind(), "schema", "{err}");
    }

    #[tokio::test]
    async fn test_server_error_mentioning_429_is_not_throttle() {
        let body = r#"{"error":{"message":"Internal error, request id 84291"}}"#;
        let base = serve_once(format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;
        let err = extractor_for(base).extract("<p>x</p>").await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(!err.is_throttle(), "{err}");
    }

    #[tokio::test]
    async fn test_scripted_extractor_counts_calls() {
        let ex = ScriptedExtractor::new(|_, i| {
            if i == 0 {
                Err(HarvestError::http(429, "Too Many Requests"))
            } else {
                Ok(r#"{"title":"T","videos":[]}"#.to_string())
            }
        });
        assert!(ex.extract("<p>").await.unwrap_err().is_throttle());
        assert_eq!(ex.extract("<p>").await.unwrap().title, "T");
        assert_eq!(ex.calls(), 2);
        assert_eq!(ex.dispatch_instants().len(), 2);
    }
}
