use reqwest::Client;

use crate::core::types::{AlertDeliveryResult, WafAlert};

/// Posts one alert to the notification webhook. Delivery failures come
/// back inside the result value; the caller records them and moves on,
/// retries belong to the collaborator behind the webhook.
pub async fn send_webhook_alert(
    client: &Client,
    webhook_url: &str,
    alert: &WafAlert,
) -> AlertDeliveryResult {
    let text = format_alert_text(alert);
    let outcome = client
        .post(webhook_url)
        .json(&serde_json::json!({ "text": text, "alert": alert }))
        .send()
        .await
        .and_then(|resp| resp.error_for_status());

    match outcome {
        Ok(_) => AlertDeliveryResult {
            alert_id: alert.id.clone(),
            delivered: true,
            error: None,
        },
        Err(err) => {
            tracing::warn!("alert {} delivery failed: {}", alert.id, err);
            AlertDeliveryResult {
                alert_id: alert.id.clone(),
                delivered: false,
                error: Some(err.to_string()),
            }
        }
    }
}

fn format_alert_text(alert: &WafAlert) -> String {
    let mut lines = vec![format!(
        "[{:?}] {} | source={}",
        alert.severity, alert.title, alert.source_ip
    )];
    if let Some(tt) = &alert.threat_type {
        lines.push(format!("  threat: {:?}", tt));
    }
    if let Some(key) = &alert.campaign_key {
        lines.push(format!("  campaign: {}", key));
    }
    lines.push(format!("  {}", alert.detail));
    lines.join("\n")
}
