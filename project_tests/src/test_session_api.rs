//! # Session API Sweep
//!
//! Hits every session endpoint of a running gateway and prints the
//! responses, including a manual refresh round-trip.

use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    /// Gateway HTTP base URL.
    #[clap(long, default_value = "http://127.0.0.1:3001")]
    base: String,

    /// Also trigger POST /api/session/refresh.
    #[clap(long)]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    for path in [
        "/api/session",
        "/api/nina/session-state",
        "/api/session/stats",
        "/api/session/health",
        "/api/config/health",
        "/api/state",
    ] {
        let url = format!("{}{}", args.base, path);
        match client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                println!(
                    "=== GET {} [{}] ===\n{}",
                    path,
                    status,
                    serde_json::to_string_pretty(&body)?
                );
            }
            Err(e) => {
                eprintln!("[ERROR] GET {} failed: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    if args.refresh {
        let url = format!("{}/api/session/refresh", args.base);
        let response = client.post(&url).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        println!(
            "=== POST /api/session/refresh [{}] ===\n{}",
            status,
            serde_json::to_string_pretty(&body)?
        );
    }

    Ok(())
}
