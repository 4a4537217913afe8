//! `continuum status`: fetch and print a running daemon's snapshot.

use std::time::Duration;

use anyhow::Context;
use ct_domain::config::Config;
use serde_json::Value;

/// Base URL of the local status server.
pub fn default_url(config: &Config) -> String {
    format!("http://{}:{}", config.server.host, config.server.port)
}

/// Print the snapshot. Returns whether the daemon reports healthy.
pub async fn run(base_url: &str, raw_json: bool) -> anyhow::Result<bool> {
    let url = format!("{}/v1/status", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("building HTTP client")?;
    let snapshot: Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("requesting {url}"))?
        .json()
        .await
        .context("decoding status snapshot")?;

    if raw_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", summarize(&snapshot));
    }
    Ok(snapshot["healthy"].as_bool().unwrap_or(false))
}

/// Human-readable digest of a snapshot.
pub fn summarize(snap: &Value) -> String {
    let field = |key: &str| match &snap[key] {
        Value::Null => "-".to_owned(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let phase = |name: &str| {
        let p = &snap["catchup"][name];
        if p["completed"].as_bool().unwrap_or(false) {
            "done".to_owned()
        } else if p["running"].as_bool().unwrap_or(false) {
            format!("running (attempt {})", p["attempts"])
        } else {
            "pending".to_owned()
        }
    };

    let mut out = String::new();
    out.push_str(&format!("healthy:        {}\n", field("healthy")));
    out.push_str(&format!("state:          {}\n", field("state")));
    out.push_str(&format!("retry count:    {}\n", field("retry_count")));
    out.push_str(&format!("restarts:       {}\n", field("restart_count")));
    out.push_str(&format!("last event ms:  {}\n", field("last_event_ms")));
    out.push_str(&format!("watermark ms:   {}\n", field("watermark_ms")));
    out.push_str(&format!("sessions:       {}\n", field("active_sessions")));
    out.push_str(&format!(
        "catch-up:       prefill {}, backfill {}\n",
        phase("prefill"),
        phase("backfill")
    ));
    if !snap["detail"].is_null() {
        out.push_str(&format!("detail:         {}\n", field("detail")));
    }
    out
}
