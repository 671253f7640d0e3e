//! Fetches the imaging host's recent event history for boot seeding and
//! manual refreshes. Transport retries live in the shared API client; a
//! failure here is never fatal to the gateway.

use lib_common::retrieve::client::ApiClient;
use serde_json::Value;

use crate::gateway_logic::config::Config;

/// Retrieves the raw historical events, oldest format quirks included.
/// Accepts both a bare JSON array and the host's `{ "Response": [...] }`
/// envelope.
pub async fn fetch_event_history(config: &Config) -> anyhow::Result<Vec<Value>> {
    let client = ApiClient::new(&config.nina_http_base(), config.nina_timeout())?;
    let body: Value = client.get_json("api/nina/event-history").await?;

    let events = match body {
        Value::Array(events) => events,
        Value::Object(mut map) => match map.remove("Response") {
            Some(Value::Array(events)) => events,
            _ => anyhow::bail!("event history response has no Response array"),
        },
        other => anyhow::bail!("unexpected event history shape: {}", other),
    };

    log::info!("Fetched {} historical events from imaging host", events.len());
    Ok(events)
}
