//! Provider subsystem for the text-generation backend.
//!
//! Every provider implements [`Provider`] from [`traits`]. [`create_provider`]
//! builds the configured backend and wraps it in [`ReliableProvider`] so
//! transient failures get a bounded number of retries.

pub mod compatible;
pub mod error;
pub mod reliable;
pub mod traits;

pub use compatible::OpenAiCompatibleProvider;
pub use error::{ProviderError, ProviderErrorKind};
pub use reliable::{ReliableProvider, RetryPolicy};
pub use traits::{ChatMessage, GenerationOptions, Provider};

use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;

const MAX_API_ERROR_CHARS: usize = 200;
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    input[from..]
        .char_indices()
        .find(|&(_, c)| !is_secret_char(c))
        .map_or(input.len(), |(i, _)| from + i)
}

/// `<digits>:<secret>`, the shape of a Telegram bot token.
fn is_bot_token(candidate: &str) -> bool {
    candidate.split_once(':').is_some_and(|(id, secret)| {
        !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !secret.is_empty()
    })
}

/// Scrub secret-like tokens from backend error strings before they reach logs.
///
/// Covers OpenAI keys (`sk-`, `sk-proj-`) and Telegram-style bot tokens
/// echoed back inside URLs (`/bot<digits>:<secret>`).
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 2] = ["sk-", "/bot"];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        while let Some(rel) = scrubbed[search_from..].find(prefix) {
            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start
                || (prefix == "/bot" && !is_bot_token(&scrubbed[content_start..end]))
            {
                search_from = content_start;
                continue;
            }

            let replacement = if prefix == "/bot" {
                "/bot[REDACTED]"
            } else {
                "[REDACTED]"
            };
            scrubbed.replace_range(start..end, replacement);
            search_from = start + replacement.len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Resolve the backend API key: explicit value first, then the environment.
pub fn resolve_provider_credential(credential_override: Option<&str>) -> Option<String> {
    if let Some(value) = credential_override.map(str::trim) {
        if !value.is_empty() {
            return Some(value.to_owned());
        }
    }

    ["POSITRONIC_API_KEY", "OPENAI_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Resolve `provider` / `api_url` into a base URL.
fn resolve_base_url(provider: &str, api_url: Option<&str>) -> anyhow::Result<String> {
    if let Some(url) = api_url.map(str::trim).filter(|url| !url.is_empty()) {
        return Ok(url.to_string());
    }

    match provider.trim() {
        "openai" => Ok(OPENAI_BASE_URL.to_string()),
        custom if custom.starts_with("custom:") => {
            let url = custom.trim_start_matches("custom:").trim();
            if url.is_empty() {
                anyhow::bail!("custom provider requires a URL, e.g. custom:http://localhost:8080/v1");
            }
            reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("Invalid custom provider URL {url}: {e}"))?;
            Ok(url.to_string())
        }
        other => anyhow::bail!(
            "Unknown provider: {other}. Supported: \"openai\" or \"custom:<URL>\"."
        ),
    }
}

/// Factory: build the configured backend with its retry wrapper.
pub fn create_provider(config: &Config) -> anyhow::Result<Arc<dyn Provider>> {
    let base_url = resolve_base_url(&config.provider, config.api_url.as_deref())?;
    let api_key = resolve_provider_credential(config.api_key.as_deref());
    let name = if config.provider.starts_with("custom:") {
        "custom"
    } else {
        config.provider.trim()
    };

    let inner: Arc<dyn Provider> = Arc::new(OpenAiCompatibleProvider::with_timeout(
        name,
        &base_url,
        api_key.as_deref(),
        Duration::from_secs(config.backend.request_timeout_secs),
    ));

    Ok(Arc::new(ReliableProvider::new(
        inner,
        config.backend.retry_policy(),
    )))
}
