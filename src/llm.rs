//! LLM client seam.
//!
//! The model is an external synchronous request/response service:
//! `{prompt, max_tokens, model_id} → {text, stop_reason}`. The pipeline
//! budgets exactly one call per analysis. Timeouts and 5xx responses are
//! transient (the queue retries); refusals and unparseable output are fatal
//! for the analysis.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::model::{AnalysisSummary, Finding};

/// One completion request.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub model_id: String,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    /// Content-policy refusal; fatal for the analysis.
    Refusal,
}

/// One completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub stop_reason: StopReason,
}

/// Synchronous completion interface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;
}

// ─── HTTP client ─────────────────────────────────────────────────────────────

/// reqwest-backed client for the completion endpoint.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_config(client: reqwest::Client, cfg: &LlmConfig) -> Option<Self> {
        let endpoint = cfg.endpoint.clone()?;
        Some(Self::new(client, endpoint, Duration::from_millis(cfg.timeout_ms)))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let send = self.client.post(&self.endpoint).json(&request).send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => return Err(Error::LlmTimeout),
            Ok(Err(e)) if e.is_timeout() => return Err(Error::LlmTimeout),
            Ok(Err(e)) => return Err(Error::LlmUpstream(e.status().map(|s| s.as_u16()).unwrap_or(0))),
            Ok(Ok(resp)) => resp,
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(Error::LlmUpstream(status.as_u16()));
        }
        if !status.is_success() {
            return Err(Error::LlmMalformed(format!("unexpected status {status}")));
        }

        let parsed: LlmResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmMalformed(e.to_string()))?;
        if parsed.stop_reason == StopReason::Refusal {
            return Err(Error::LlmRefused(truncate(&parsed.text, 200)));
        }
        Ok(parsed)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ─── Prompt construction and response parsing ────────────────────────────────

static PROMPT_TEMPLATE: &str = r#"You are a legal document analyst. Review the document below together
with the clause findings already located by pattern matching, then reply
with a single JSON object and nothing else:

{"executive_summary": "...", "key_findings": ["..."], "recommendations": ["..."], "overall_risk_score": 0}

overall_risk_score is an integer from 0 (benign) to 100 (severe).

Document type: {{ document_type }}

Located clauses:
{% for finding in findings %}- [{{ finding.severity }}] {{ finding.category }}: {{ finding.excerpt }}
{% else %}- none
{% endfor %}
Document:
{{ text }}
"#;

static TERA: Lazy<tera::Tera> = Lazy::new(|| {
    let mut tera = tera::Tera::default();
    tera.add_raw_template("analysis_prompt", PROMPT_TEMPLATE)
        .expect("analysis prompt template parses");
    tera
});

#[derive(Serialize)]
struct PromptFinding<'a> {
    severity: &'a str,
    category: &'a str,
    excerpt: &'a str,
}

/// Render the summarization prompt for one analysis.
pub fn build_analysis_prompt(
    document_type: &str,
    normalized_text: &str,
    findings: &[Finding],
) -> Result<String> {
    let rows: Vec<PromptFinding<'_>> = findings
        .iter()
        .map(|f| PromptFinding {
            severity: f.severity.as_str(),
            category: &f.category,
            excerpt: &f.excerpt,
        })
        .collect();

    let mut context = tera::Context::new();
    context.insert("document_type", document_type);
    context.insert("text", normalized_text);
    context.insert("findings", &rows);

    TERA.render("analysis_prompt", &context)
        .map_err(|e| Error::Internal(format!("prompt render failed: {e}")))
}

#[derive(Deserialize)]
struct RawSummary {
    executive_summary: String,
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    overall_risk_score: Option<i64>,
}

/// Parse the model's JSON reply into summary fields.
///
/// Tolerates a fenced code block around the object; anything else that does
/// not parse is `LlmMalformed`. Out-of-range scores are dropped so the
/// deterministic fallback applies.
pub fn parse_summary(text: &str) -> Result<AnalysisSummary> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let raw: RawSummary = serde_json::from_str(body)
        .map_err(|e| Error::LlmMalformed(format!("summary is not valid JSON: {e}")))?;

    let score = raw.overall_risk_score.and_then(|s| {
        if (0..=100).contains(&s) {
            Some(s as u32)
        } else {
            log::warn!("model returned out-of-range risk score {s}; ignoring");
            None
        }
    });

    Ok(AnalysisSummary {
        executive_summary: raw.executive_summary,
        key_findings: raw.key_findings,
        recommendations: raw.recommendations,
        overall_risk_score: score,
    })
}
