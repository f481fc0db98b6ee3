use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::models::Report;

const RESEND_EMAILS_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Mail transport used by the delivery dispatcher. Returns the provider's
/// message id when it reports one.
#[async_trait]
pub trait ReportMailer: Send + Sync {
    async fn send(&self, message: &ReportMessage) -> Result<Option<String>, String>;
}

pub struct ResendMailer {
    http_client: Client,
    api_key: String,
    from_address: String,
}

impl ResendMailer {
    pub fn new(http_client: Client, api_key: String, from_address: String) -> Self {
        Self {
            http_client,
            api_key,
            from_address,
        }
    }
}

#[async_trait]
impl ReportMailer for ResendMailer {
    async fn send(&self, message: &ReportMessage) -> Result<Option<String>, String> {
        let payload = json!({
            "from": self.from_address,
            "to": [message.to],
            "subject": message.subject,
            "html": message.html,
        });

        let response = self
            .http_client
            .post(RESEND_EMAILS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Resend API request failed");
                "Resend API request failed.".to_string()
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or(json!({"error": "failed to parse response"}));

        if status.is_success() {
            Ok(body.get("id").and_then(Value::as_str).map(ToOwned::to_owned))
        } else {
            let error_msg = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown Resend API error");
            Err(format!("Resend API error ({status}): {error_msg}"))
        }
    }
}

pub fn render_report_email(report: &Report, recipient: &str) -> ReportMessage {
    let figures = &report.figures;
    let rows = [
        ("Cold water", figures.meter_cost_cold_raw),
        ("Hot water", figures.meter_cost_hot_raw),
        ("Heating", figures.meter_cost_heating_raw),
        ("Fixed costs", figures.fixed_cost_raw),
        ("Total", figures.actual_rent_raw),
        ("Advance payment", figures.advance_payment()),
        ("Balance", figures.balance_raw),
    ]
    .iter()
    .map(|(label, amount)| {
        format!(
            "<tr><td>{label}</td><td style=\"text-align: right;\">{}</td></tr>",
            format_minor_units(*amount)
        )
    })
    .collect::<String>();

    ReportMessage {
        to: recipient.to_string(),
        subject: format!("Utility billing report for {}", report.month),
        html: format!(
            "<div style=\"font-family: sans-serif; max-width: 600px; margin: 0 auto;\">\
             <h2>Utility billing report for {}</h2><table>{rows}</table>\
             <p>Report {}</p></div>",
            report.month, report.id
        ),
    }
}

/// Renders minor units with two decimals, e.g. `-1234` as `-12.34`.
fn format_minor_units(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let magnitude = amount.unsigned_abs();
    format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100)
}
