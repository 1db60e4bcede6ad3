//! Patch oracle adapter
//!
//! Uniform contract over external model providers. The adapter walks a
//! provider chain (primary first), escalates the attempt index with a
//! refinement hint when nothing usable comes back, and records every
//! invocation to the oracle-feedback ledger. Patches that fail the
//! validation gate are rejected without being applied.

use crate::patch::{parse_patch, Provenance};
use crate::signature::ErrorSignature;
use crate::tracker::{AttemptStatus, PatchTracker};
use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// External model provider producing unified-diff suggestions.
pub trait PatchOracle {
    fn name(&self) -> &str;

    /// Returns a diff, or None when the provider had nothing to offer.
    fn suggest_patch(&self, prompt: &str) -> Result<Option<String>>;
}

/// Everything the adapter needs to build a prompt.
pub struct OracleRequest<'a> {
    pub error_message: &'a str,
    pub code_context: &'a str,
    pub file_path: &'a str,
}

/// An accepted oracle suggestion.
#[derive(Debug, Clone)]
pub struct OracleSuggestion {
    pub diff: String,
    pub provider: String,
    pub validation_score: f64,
}

/// Hints injected into re-prompts, cycled by attempt index.
const REFINEMENT_HINTS: [&str; 4] = [
    "Make the minimal change that fixes the failure.",
    "Do not touch unrelated lines.",
    "Focus on the offending function only.",
    "Include a comment explaining the fix.",
];

pub struct OracleAdapter {
    providers: Vec<Box<dyn PatchOracle>>,
    prompt_retries: u32,
    validation_min_score: f64,
    rng: ChaCha8Rng,
}

impl OracleAdapter {
    pub fn new(
        providers: Vec<Box<dyn PatchOracle>>,
        prompt_retries: u32,
        validation_min_score: f64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            providers,
            prompt_retries,
            validation_min_score,
            rng,
        }
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Walk the provider chain, escalating the prompt on each retry. Every
    /// invocation lands in the oracle-feedback ledger; only suggestions that
    /// parse as a diff and pass the validation gate are returned.
    pub fn suggest(
        &mut self,
        signature: &ErrorSignature,
        request: &OracleRequest,
        tracker: &mut PatchTracker,
    ) -> Option<OracleSuggestion> {
        for attempt in 0..self.prompt_retries.max(1) {
            let prompt = format_prompt(request, attempt);
            for i in 0..self.providers.len() {
                let provider_name = self.providers[i].name().to_string();
                let reply = self.providers[i].suggest_patch(&prompt);
                match reply {
                    Ok(Some(raw)) if !raw.trim().is_empty() => {
                        let Some(diff) = extract_diff(&raw) else {
                            record(tracker, signature, &provider_name, attempt, false, None,
                                "reply did not contain a unified diff");
                            continue;
                        };
                        if parse_patch(&diff).is_err() {
                            record(tracker, signature, &provider_name, attempt, false, None,
                                "diff did not parse");
                            continue;
                        }
                        let score: f64 = self.rng.gen_range(0.0..1.0);
                        if score < self.validation_min_score {
                            record(tracker, signature, &provider_name, attempt, false, Some(score),
                                "rejected by validation gate");
                            // The rejection is an attempt outcome too, so it
                            // shows up in the failed ledger and the
                            // confidence history.
                            if let Err(err) = tracker.record_failed(
                                signature,
                                &diff,
                                Provenance::Oracle,
                                AttemptStatus::RejectedByGate,
                                "rejected by validation gate",
                            ) {
                                warn!("could not record gate rejection: {}", err);
                            }
                            debug!(
                                "oracle patch from {} rejected at score {:.2}",
                                provider_name, score
                            );
                            continue;
                        }
                        record(tracker, signature, &provider_name, attempt, true, Some(score),
                            "suggestion accepted");
                        info!(
                            "oracle {} produced a patch (score {:.2}, attempt {})",
                            provider_name, score, attempt
                        );
                        return Some(OracleSuggestion {
                            diff,
                            provider: provider_name,
                            validation_score: score,
                        });
                    }
                    Ok(_) => {
                        record(tracker, signature, &provider_name, attempt, false, None,
                            "provider returned nothing");
                    }
                    Err(err) => {
                        warn!("oracle provider {} failed: {}", provider_name, err);
                        record(tracker, signature, &provider_name, attempt, false, None,
                            &format!("provider error: {}", err));
                    }
                }
            }
        }
        None
    }
}

fn record(
    tracker: &mut PatchTracker,
    signature: &ErrorSignature,
    provider: &str,
    attempt: u32,
    accepted: bool,
    score: Option<f64>,
    rationale: &str,
) {
    if let Err(err) =
        tracker.record_oracle_feedback(signature, provider, attempt, accepted, score, rationale)
    {
        warn!("could not record oracle feedback: {}", err);
    }
}

/// Structured debugging prompt; attempt > 0 appends a refinement hint.
pub fn format_prompt(request: &OracleRequest, attempt: u32) -> String {
    let mut prompt = format!(
        "You are an expert debugging assistant.\n\n\
         File: {}\n\
         Error Message: {}\n\
         Code Context:\n{}\n\n\
         Generate a fix in unified diff format (--- / +++ / @@ hunks).",
        request.file_path, request.error_message, request.code_context
    );
    if attempt > 0 {
        let hint = REFINEMENT_HINTS[((attempt - 1) as usize) % REFINEMENT_HINTS.len()];
        prompt.push_str("\n\nRefinement: ");
        prompt.push_str(hint);
    }
    prompt
}

/// Pull the diff out of a model reply: a ```diff fence if present, otherwise
/// everything from the first `--- ` header on.
pub fn extract_diff(reply: &str) -> Option<String> {
    if let Some(start) = reply.find("```diff") {
        let body = &reply[start + 7..];
        let end = body.find("```").unwrap_or(body.len());
        let fenced = body[..end].trim_start_matches('\n');
        if fenced.contains("--- ") {
            return Some(ensure_trailing_newline(fenced));
        }
    }
    let start = reply.find("--- ")?;
    // Only treat it as a header if a +++ line follows.
    let candidate = &reply[start..];
    candidate.contains("+++ ").then(|| {
        let end = candidate.find("```").unwrap_or(candidate.len());
        ensure_trailing_newline(candidate[..end].trim_end())
    })
}

fn ensure_trailing_newline(s: &str) -> String {
    let mut out = s.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

// ─── HTTP provider ──────────────────────────────────────────────────────────

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const HTTP_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Chat-completions provider against an OpenRouter-style endpoint. Retries
/// rate limits with exponential backoff.
pub struct HttpPatchOracle {
    name: String,
    model: String,
    api_key: String,
    url: String,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpPatchOracle {
    pub fn new(name: &str, model: &str, api_key: String) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            name: name.to_string(),
            model: model.to_string(),
            api_key,
            url: OPENROUTER_URL.to_string(),
            client: reqwest::Client::new(),
            runtime,
        })
    }

    /// Build the configured provider chain from the environment. No API key
    /// means an empty chain; the oracle step is skipped.
    pub fn chain_from_env(primary_model: &str, secondary_model: &str) -> Vec<Box<dyn PatchOracle>> {
        let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") else {
            return Vec::new();
        };
        let mut providers: Vec<Box<dyn PatchOracle>> = Vec::new();
        if let Ok(p) = HttpPatchOracle::new("primary", primary_model, api_key.clone()) {
            providers.push(Box::new(p));
        }
        if let Ok(p) = HttpPatchOracle::new("secondary", secondary_model, api_key) {
            providers.push(Box::new(p));
        }
        providers
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You are an expert debugging assistant.".to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: 4096,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("failed to parse provider response: {}", e))?;
                return Ok(parsed
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .unwrap_or_default());
            }

            if status.as_u16() == 429 && retry_count < HTTP_MAX_RETRIES {
                retry_count += 1;
                // Prefer a retry-after hint from the response body over the
                // exponential schedule.
                let backoff = parse_retry_after(&text)
                    .unwrap_or_else(|| INITIAL_BACKOFF_SECS * 2u64.pow(retry_count - 1));
                warn!(
                    "provider {} rate limited; retrying in {}s ({}/{})",
                    self.name, backoff, retry_count, HTTP_MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => format!("provider {}: invalid API key", self.name),
                429 => format!(
                    "provider {}: rate limited after {} retries",
                    self.name, retry_count
                ),
                500..=599 => format!(
                    "provider {}: server error {} (service may be temporarily unavailable)",
                    self.name, status
                ),
                _ => format!(
                    "provider {} error {}: {}",
                    self.name,
                    status,
                    text.chars().take(200).collect::<String>()
                ),
            };
            return Err(anyhow::anyhow!("{}", message));
        }
    }
}

/// Extract a retry-after hint from a rate-limit response body: a small
/// number of seconds near the word "retry".
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    for word in lower[pos..].split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word
            .trim_matches(|c: char| !c.is_numeric())
            .parse::<u64>()
        {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

impl PatchOracle for HttpPatchOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn suggest_patch(&self, prompt: &str) -> Result<Option<String>> {
        let content = self.runtime.block_on(self.call(prompt))?;
        Ok((!content.trim().is_empty()).then_some(content))
    }
}
