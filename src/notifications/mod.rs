//! Discord webhook delivery for grouped and single-event notifications.
//!
//! Sends are best-effort: a failed webhook is logged and never surfaced to
//! the paths that triggered it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::Config;

pub const TITLE_LIMIT: usize = 256;
pub const DESCRIPTION_LIMIT: usize = 4096;
pub const FIELD_NAME_LIMIT: usize = 256;
pub const FIELD_VALUE_LIMIT: usize = 1024;
pub const FOOTER_LIMIT: usize = 2048;
pub const TOTAL_LIMIT: usize = 6000;

pub const WEBHOOK_USERNAME: &str = "Mediasync";
pub const FOOTER_TEXT: &str = "Mediasync Media Monitor";

/// Embed accent colors.
pub mod colors {
    pub const BLUE: u32 = 0x3498DB;
    pub const GREEN: u32 = 0x2ECC71;
    pub const RED: u32 = 0xE74C3C;
    pub const GOLD: u32 = 0xF1C40F;
    pub const ORANGE: u32 = 0xE67E22;
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    pub timestamp: DateTime<Utc>,
}

impl Embed {
    pub fn new(title: impl Into<String>, description: impl Into<String>, color: u32) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            color,
            fields: Vec::new(),
            footer: Some(EmbedFooter {
                text: FOOTER_TEXT.to_string(),
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter { text: text.into() });
        self
    }

    /// Character count the way Discord computes it.
    pub fn total_length(&self) -> usize {
        let mut length = self.title.chars().count() + self.description.chars().count();
        if let Some(footer) = &self.footer {
            length += footer.text.chars().count();
        }
        for field in &self.fields {
            length += field.name.chars().count() + field.value.chars().count();
        }
        length
    }

    /// Clamp every part to its per-field cap.
    pub fn enforce_limits(&mut self) {
        self.title = truncate(&self.title, TITLE_LIMIT);
        self.description = truncate(&self.description, DESCRIPTION_LIMIT);
        if let Some(footer) = &mut self.footer {
            footer.text = truncate(&footer.text, FOOTER_LIMIT);
        }
        for field in &mut self.fields {
            field.name = truncate(&field.name, FIELD_NAME_LIMIT);
            field.value = truncate(&field.value, FIELD_VALUE_LIMIT);
        }
    }
}

/// Truncate with a three-character ellipsis, counting chars, not bytes.
pub fn truncate(value: &str, max_length: usize) -> String {
    if value.chars().count() <= max_length {
        return value.to_string();
    }
    let kept: String = value.chars().take(max_length.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Render a file list for an embed field, eliding past `max_items` and
/// fitting the result inside a closed code block.
pub fn format_file_list(files: &[String], max_items: usize, prefix: &str, language: &str) -> String {
    if files.is_empty() {
        return "None".to_string();
    }

    let mut formatted = files
        .iter()
        .take(max_items)
        .map(|f| format!("{prefix}{f}"))
        .collect::<Vec<_>>()
        .join("\n");

    if files.len() > max_items {
        formatted.push_str(&format!("\n...and {} more", files.len() - max_items));
    }

    // Truncate before wrapping so the code block always closes.
    let max_inner = 1000 - language.len();
    let formatted = truncate(&formatted, max_inner);
    format!("```{language}\n{formatted}\n```")
}

/// Build the webhook payload, collapsing to a minimal embed when the total
/// still exceeds Discord's limit after per-field truncation.
pub fn build_payload(mut embed: Embed) -> serde_json::Value {
    embed.enforce_limits();

    if embed.total_length() > TOTAL_LIMIT {
        let mut fallback = Embed {
            title: embed.title,
            description: embed.description,
            color: embed.color,
            fields: Vec::new(),
            footer: Some(EmbedFooter {
                text: "Note: Some details were truncated due to length limits.".to_string(),
            }),
            timestamp: embed.timestamp,
        };
        if let Some(first) = embed.fields.into_iter().next() {
            fallback.fields.push(first);
        }
        embed = fallback;
    }

    json!({
        "username": WEBHOOK_USERNAME,
        "embeds": [embed],
    })
}

/// Fire-and-forget webhook sender.
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    enabled: bool,
    dry_run: bool,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: config
                .notifications
                .discord_webhook_url
                .clone()
                .filter(|u| u.starts_with("http")),
            enabled: config.notifications.enabled,
            dry_run: config.behaviour.dry_run,
        }
    }

    /// Post one embed. Failures are logged, never raised.
    pub async fn send(&self, embed: Embed) {
        if self.dry_run {
            info!("[DRY RUN] Would send notification: {}", embed.title);
            return;
        }
        if !self.enabled {
            debug!("Notifications disabled, dropping: {}", embed.title);
            return;
        }
        let Some(url) = &self.webhook_url else {
            debug!("No webhook URL configured, dropping: {}", embed.title);
            return;
        };

        let payload = build_payload(embed);
        match self.client.post(url).json(&payload).send().await {
            Ok(response) => {
                if let Err(e) = response.error_for_status() {
                    error!("Webhook rejected notification: {e}");
                }
            }
            Err(e) => error!("Failed to send notification: {e}"),
        }
    }

    /// One-off notification for a single event.
    pub async fn send_single(&self, title: &str, description: &str, color: u32) {
        self.send(Embed::new(title, description, color)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_appends_ellipsis() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(30);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn file_list_elides_overflow_and_closes_code_block() {
        let files: Vec<String> = (0..15).map(|i| format!("file{i}.mkv")).collect();
        let rendered = format_file_list(&files, 10, "+ ", "diff");
        assert!(rendered.starts_with("```diff\n"));
        assert!(rendered.ends_with("\n```"));
        assert!(rendered.contains("...and 5 more"));
        assert!(rendered.contains("+ file9.mkv"));
        assert!(!rendered.contains("file10.mkv"));
    }

    #[test]
    fn enforce_limits_caps_every_part() {
        let mut embed = Embed::new("t".repeat(300), "d".repeat(5000), colors::BLUE)
            .field("n".repeat(300), "v".repeat(2000), false);
        embed.enforce_limits();
        assert_eq!(embed.title.chars().count(), TITLE_LIMIT);
        assert_eq!(embed.description.chars().count(), DESCRIPTION_LIMIT);
        assert_eq!(embed.fields[0].name.chars().count(), FIELD_NAME_LIMIT);
        assert_eq!(embed.fields[0].value.chars().count(), FIELD_VALUE_LIMIT);
    }

    #[test]
    fn oversized_embed_falls_back_to_first_field() {
        let mut embed = Embed::new("Summary", "d".repeat(4000), colors::BLUE);
        for i in 0..8 {
            embed = embed.field(format!("field {i}"), "v".repeat(1000), false);
        }
        let payload = build_payload(embed);
        let embeds = payload["embeds"].as_array().unwrap();
        assert_eq!(embeds.len(), 1);
        let fields = embeds[0]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0]["name"], "field 0");
        assert!(embeds[0]["footer"]["text"]
            .as_str()
            .unwrap()
            .contains("truncated"));
    }

    #[test]
    fn payload_respects_total_limit() {
        let embed = Embed::new("Update", "All good", colors::GREEN).field("Added", "one.mkv", false);
        let payload = build_payload(embed.clone());
        assert_eq!(payload["username"], WEBHOOK_USERNAME);
        assert!(embed.total_length() <= TOTAL_LIMIT);
    }

    #[test]
    fn sends_are_dropped_without_a_webhook_url() {
        let notifier = Notifier::new(&Config::default());
        // Best-effort contract: nothing configured, nothing raised.
        tokio_test::block_on(notifier.send(Embed::new("Update", "noop", colors::BLUE)));
    }
}
