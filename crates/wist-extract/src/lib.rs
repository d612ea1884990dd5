//! External-collaborator adapters: mailbox providers and LLM extraction.
//!
//! The scan pipeline sees only the [`MailboxProvider`] and
//! [`ExtractionService`] traits. `GmailMailbox` and `ClaudeExtractor` are the
//! production implementations; `FixtureMailbox` and `ScriptedExtractor` serve
//! tests and fixture-driven CLI runs.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use wist_core::{ExtractionResult, FetchedEmail, User};

pub const CRATE_NAME: &str = "wist-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Message(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Ingestion gateway contract: candidate messages newer than `after`.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    async fn fetch_since(
        &self,
        user: &User,
        after: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<FetchedEmail>, ExtractError>;
}

/// LLM extraction contract: one email in, a best-effort structured result
/// out. Failures are ordinary errors; the scan loop counts them and moves on.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, email: &FetchedEmail) -> Result<ExtractionResult, ExtractError>;
}

// ---------------------------------------------------------------------------
// HTML side-channel mining
// ---------------------------------------------------------------------------

/// Plausibility window for mined prices. Retail emails are full of numbers
/// that are not prices (order ids, sizes, tracking fragments).
const PRICE_MIN: f64 = 0.5;
const PRICE_MAX: f64 = 2000.0;

const MAX_IMAGE_HINTS: usize = 5;
const MAX_CLEAN_TEXT_CHARS: usize = 5000;
const MAX_PLAIN_TEXT_CHARS: usize = 4000;

/// Substrings marking non-product images: logos, pixels, footer chrome.
const IMAGE_SKIP_PATTERNS: &[&str] = &[
    "logo",
    "icon",
    "pixel",
    "track",
    "spacer",
    "badge",
    "social",
    "facebook",
    "instagram",
    "twitter",
    "unsubscribe",
    "footer",
    "header-img",
];

fn parse_amount(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let cleaned = cleaned.trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    // Reject tokens with more than one decimal point ("1.2.3" fragments).
    if cleaned.matches('.').count() > 1 {
        return None;
    }
    cleaned.parse().ok()
}

/// Mines dollar amounts out of an HTML email body. Recognizes `$12.99`,
/// `$1,234.56`, `USD 12.99` and `12.99 USD`, filters to the plausibility
/// window, deduplicates, and sorts ascending.
pub fn extract_prices_from_html(html: &str) -> Vec<f64> {
    if html.is_empty() {
        return Vec::new();
    }
    let text = html_to_text(html);
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let mut prices = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        let candidate = if let Some(rest) = token.strip_prefix('$') {
            if rest.is_empty() {
                tokens.get(idx + 1).and_then(|t| parse_amount(t))
            } else {
                parse_amount(rest)
            }
        } else if let Some(rest) = token.strip_prefix("USD") {
            if rest.is_empty() {
                tokens.get(idx + 1).and_then(|t| parse_amount(t))
            } else {
                parse_amount(rest)
            }
        } else if tokens.get(idx + 1).is_some_and(|t| *t == "USD") {
            parse_amount(token)
        } else {
            None
        };

        if let Some(value) = candidate {
            if (PRICE_MIN..=PRICE_MAX).contains(&value) {
                prices.push(value);
            }
        }
    }

    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    prices.dedup();
    prices
}

/// Collects product-image URLs from `<img>` tags: https only, tracking
/// pixels and chrome imagery skipped, capped at [`MAX_IMAGE_HINTS`].
pub fn extract_images_from_html(html: &str) -> Vec<String> {
    if html.is_empty() {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("img") else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for element in document.select(&selector) {
        let Some(src) = element.value().attr("src") else {
            continue;
        };
        if !src.starts_with("https://") {
            continue;
        }

        let tiny = ["width", "height"].iter().any(|attr| {
            element
                .value()
                .attr(attr)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .is_some_and(|px| px < 50)
        });
        if tiny {
            continue;
        }

        let src_lower = src.to_lowercase();
        if IMAGE_SKIP_PATTERNS.iter().any(|p| src_lower.contains(p)) {
            continue;
        }

        images.push(src.to_string());
        if images.len() >= MAX_IMAGE_HINTS {
            break;
        }
    }
    images
}

fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let joined = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tag-stripped, whitespace-collapsed body text, capped so a huge marketing
/// email does not blow the extraction prompt.
pub fn html_to_clean_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    truncate_chars(&html_to_text(html), MAX_CLEAN_TEXT_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Assembles the pipeline handoff record from raw MIME leaves, mining the
/// HTML part for the side-channel hints.
pub fn build_fetched_email(
    message_id: impl Into<String>,
    thread_id: impl Into<String>,
    subject: impl Into<String>,
    snippet: impl Into<String>,
    plain_text: &str,
    html_raw: &str,
    date_header: Option<String>,
) -> FetchedEmail {
    let snippet = snippet.into();
    let plain_text = if plain_text.is_empty() {
        snippet.clone()
    } else {
        truncate_chars(plain_text, MAX_PLAIN_TEXT_CHARS)
    };
    FetchedEmail {
        message_id: message_id.into(),
        thread_id: thread_id.into(),
        subject: subject.into(),
        snippet,
        plain_text,
        html_text: html_to_clean_text(html_raw),
        prices_found: extract_prices_from_html(html_raw),
        image_urls: extract_images_from_html(html_raw),
        date_header,
    }
}

// ---------------------------------------------------------------------------
// Gmail REST mailbox
// ---------------------------------------------------------------------------

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail search terms marking purchase-related mail.
const PURCHASE_QUERY_TERMS: &str =
    "(order OR receipt OR shipped OR confirmation OR invoice OR purchase OR delivery)";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    snippet: String,
    payload: Option<MimePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MimePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<MimeHeader>,
    #[serde(default)]
    body: MimeBody,
    #[serde(default)]
    parts: Vec<MimePart>,
}

#[derive(Debug, Deserialize)]
struct MimeHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct MimeBody {
    #[serde(default)]
    data: Option<String>,
}

/// Decodes Gmail's unpadded base64url body encoding; malformed bytes degrade
/// lossily instead of failing the message.
fn decode_base64url(data: &str) -> String {
    let trimmed = data.trim_end_matches('=');
    match URL_SAFE_NO_PAD.decode(trimmed) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

/// Walks a MIME tree and returns the first text/plain and text/html leaves.
fn extract_mime_parts(part: &MimePart) -> (String, String) {
    let mut plain = String::new();
    let mut html = String::new();

    match part.mime_type.as_str() {
        "text/plain" => {
            if let Some(data) = &part.body.data {
                plain = decode_base64url(data);
            }
        }
        "text/html" => {
            if let Some(data) = &part.body.data {
                html = decode_base64url(data);
            }
        }
        _ => {}
    }

    for sub in &part.parts {
        let (sub_plain, sub_html) = extract_mime_parts(sub);
        if plain.is_empty() && !sub_plain.is_empty() {
            plain = sub_plain;
        }
        if html.is_empty() && !sub_html.is_empty() {
            html = sub_html;
        }
    }

    (plain, html)
}

fn header_value(part: Option<&MimePart>, name: &str) -> Option<String> {
    part?.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl GmailConfig {
    pub fn from_env() -> Self {
        Self {
            client_id: std::env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
        }
    }
}

/// Gmail REST provider: exchanges the stored refresh token for an access
/// token, searches for purchase mail after the cursor date, and mines each
/// full message for body text and side-channel hints.
#[derive(Debug)]
pub struct GmailMailbox {
    client: reqwest::Client,
    config: GmailConfig,
}

impl GmailMailbox {
    pub fn new(config: GmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn access_token(&self, refresh_token: &str) -> Result<String, ExtractError> {
        let response = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtractError::Message(format!(
                "token refresh failed with status {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<FetchedEmail, ExtractError> {
        let url = format!("{GMAIL_API_BASE}/messages/{message_id}?format=full");
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtractError::Message(format!(
                "message fetch failed with status {}",
                response.status()
            )));
        }
        let message: GmailMessage = response.json().await?;

        let subject = header_value(message.payload.as_ref(), "Subject").unwrap_or_default();
        let date_header = header_value(message.payload.as_ref(), "Date");
        let (plain, html) = message
            .payload
            .as_ref()
            .map(extract_mime_parts)
            .unwrap_or_default();

        Ok(build_fetched_email(
            message.id,
            message.thread_id,
            subject,
            message.snippet,
            &plain,
            &html,
            date_header,
        ))
    }
}

#[async_trait]
impl MailboxProvider for GmailMailbox {
    async fn fetch_since(
        &self,
        user: &User,
        after: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<FetchedEmail>, ExtractError> {
        let refresh_token = user
            .mailbox_refresh_token
            .as_deref()
            .ok_or_else(|| ExtractError::Message("no mailbox credential on file".to_string()))?;
        let access_token = self.access_token(refresh_token).await?;

        let query = format!("after:{} {}", after.format("%Y/%m/%d"), PURCHASE_QUERY_TERMS);
        let max_results = max_results.to_string();
        let list_url = format!("{GMAIL_API_BASE}/messages");
        let response = self
            .client
            .get(&list_url)
            .bearer_auth(&access_token)
            .query(&[("q", query.as_str()), ("maxResults", max_results.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtractError::Message(format!(
                "message list failed with status {}",
                response.status()
            )));
        }
        let list: MessageListResponse = response.json().await?;
        debug!(count = list.messages.len(), "mailbox search returned messages");

        let mut emails = Vec::with_capacity(list.messages.len());
        for message_ref in &list.messages {
            emails.push(self.fetch_message(&access_token, &message_ref.id).await?);
        }
        Ok(emails)
    }
}

/// Serves a fixed email list; backs tests and the CLI fixture-scan path.
/// The lower bound is ignored — fixture files already represent one window.
#[derive(Debug, Default)]
pub struct FixtureMailbox {
    emails: Vec<FetchedEmail>,
}

impl FixtureMailbox {
    pub fn new(emails: Vec<FetchedEmail>) -> Self {
        Self { emails }
    }

    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExtractError::Message(format!("reading {}: {e}", path.display())))?;
        let emails = serde_json::from_str(&text)
            .map_err(|e| ExtractError::Message(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::new(emails))
    }
}

#[async_trait]
impl MailboxProvider for FixtureMailbox {
    async fn fetch_since(
        &self,
        _user: &User,
        _after: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<FetchedEmail>, ExtractError> {
        Ok(self.emails.iter().take(max_results).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Claude extraction
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_EXTRACTION_MODEL: &str = "claude-haiku-4-5-20251001";
const EXTRACTION_MAX_TOKENS: u32 = 1024;
const MAX_PROMPT_BODY_CHARS: usize = 3500;

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are a shopping receipt parser. Given an order confirmation email, extract every clothing item purchased.

Respond with ONLY a raw JSON object, no markdown fences and no explanation.

Format:
{
  \"merchant\": \"Store name or null\",
  \"items\": [
    {
      \"item_name\": \"Short clean name (max 60 chars, no marketing copy)\",
      \"price\": 29.99,
      \"purchased_at\": \"YYYY-MM-DD\",
      \"image_url\": \"https://... or null\",
      \"category_guess\": \"Tops|Bottoms|Outerwear|Shoes|Accessories|Other\",
      \"size\": \"M or null\",
      \"confidence\": 0.95,
      \"is_clothing\": true
    }
  ]
}

Rules:
- is_clothing=true: clothing, shoes, bags, jewelry, hats, belts, socks, underwear, swimwear
- is_clothing=false: electronics, food, gift cards, home goods, hair clips, candles
- price: only use values from the pre-extracted prices list. null if unsure.
- confidence: 0.9+ clear receipt, 0.7-0.89 unclear, 0.5-0.69 maybe marketing, <0.5 skip it
- If no clothing found: {\"merchant\": null, \"items\": []}";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub model: String,
}

impl ClaudeConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: std::env::var("WIST_EXTRACTION_MODEL")
                .unwrap_or_else(|_| DEFAULT_EXTRACTION_MODEL.to_string()),
        }
    }
}

/// Messages-API extraction client. Every failure mode (transport, status,
/// fence-wrapped garbage, unparseable JSON) is an error the scan loop counts;
/// nothing here panics or aborts a scan.
#[derive(Debug)]
pub struct ClaudeExtractor {
    client: reqwest::Client,
    config: ClaudeConfig,
}

impl ClaudeExtractor {
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

/// Builds the user prompt: subject, truncated body, and the side-channel
/// hints the model is told to choose prices and images from.
pub fn build_extraction_prompt(email: &FetchedEmail) -> String {
    let mut lines = vec![format!("Subject: {}", email.subject)];

    let body = truncate_chars(email.plain_text.trim(), MAX_PROMPT_BODY_CHARS);
    if !body.is_empty() {
        lines.push(format!("\nEmail body:\n{body}"));
    }

    if email.prices_found.is_empty() {
        lines.push("\nNo prices found; set price to null.".to_string());
    } else {
        let prices = email
            .prices_found
            .iter()
            .map(|p| format!("${p:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("\nPre-extracted prices: {prices}"));
    }

    if email.image_urls.is_empty() {
        lines.push("\nNo images; set image_url to null.".to_string());
    } else {
        let urls = email
            .image_urls
            .iter()
            .take(MAX_IMAGE_HINTS)
            .map(|u| format!("  {u}"))
            .collect::<Vec<_>>()
            .join("\n");
        lines.push(format!("\nProduct image URLs:\n{urls}"));
    }

    lines.join("\n")
}

/// Strips accidental markdown fences around a model response.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest.trim_start();
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest.trim_start();
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

/// Decodes the model's JSON. A top-level array is tolerated by taking its
/// first element, matching what sloppier responses occasionally produce.
pub fn parse_extraction_response(raw: &str) -> Result<ExtractionResult, ExtractError> {
    let text = strip_code_fences(raw);
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ExtractError::Message(format!("unparseable extraction JSON: {e}")))?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
        serde_json::Value::Array(_) => serde_json::Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(value)
        .map_err(|e| ExtractError::Message(format!("unexpected extraction shape: {e}")))
}

#[async_trait]
impl ExtractionService for ClaudeExtractor {
    async fn extract(&self, email: &FetchedEmail) -> Result<ExtractionResult, ExtractError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: EXTRACTION_MAX_TOKENS,
            system: EXTRACTION_SYSTEM_PROMPT,
            messages: vec![RequestMessage {
                role: "user",
                content: build_extraction_prompt(email),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Message(format!(
                "extraction API returned {status}: {body}"
            )));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .first()
            .map(|block| block.text.as_str())
            .unwrap_or_default();
        parse_extraction_response(text)
    }
}

/// Test double keyed by message id. Unknown messages extract to an empty
/// result; registered failures surface as errors like a real outage would.
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    responses: HashMap<String, Option<ExtractionResult>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, message_id: impl Into<String>, result: ExtractionResult) -> Self {
        self.responses.insert(message_id.into(), Some(result));
        self
    }

    pub fn with_failure(mut self, message_id: impl Into<String>) -> Self {
        self.responses.insert(message_id.into(), None);
        self
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtractor {
    async fn extract(&self, email: &FetchedEmail) -> Result<ExtractionResult, ExtractError> {
        match self.responses.get(&email.message_id) {
            Some(Some(result)) => Ok(result.clone()),
            Some(None) => Err(ExtractError::Message(format!(
                "scripted extraction failure for {}",
                email.message_id
            ))),
            None => Ok(ExtractionResult::default()),
        }
    }
}
