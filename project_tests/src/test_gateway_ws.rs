//! # Dashboard WebSocket Fan-out Test
//!
//! Connects to a running gateway's dashboard socket, optionally narrows the
//! subscription, and prints every frame as it arrives. Useful for watching
//! the welcome document, sessionUpdate broadcasts and heartbeats live.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
struct Args {
    /// Gateway WebSocket URL.
    #[clap(long, default_value = "ws://127.0.0.1:3001/ws")]
    url: String,

    /// Frame types to subscribe to (all when omitted).
    #[clap(long)]
    events: Vec<String>,

    /// Stop after this many frames (0 = run forever).
    #[clap(long, default_value = "0")]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    println!("[*] Connecting to {}", args.url);
    let (ws_stream, _) = connect_async(&args.url).await?;
    let (mut write, mut read) = ws_stream.split();

    if !args.events.is_empty() {
        let subscribe = json!({ "type": "subscribe", "events": args.events }).to_string();
        write.send(Message::Text(subscribe.into())).await?;
        println!("[*] Subscription filter sent");
    }

    let mut received = 0usize;
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let pretty = serde_json::from_str::<serde_json::Value>(&text)
                    .and_then(|v| serde_json::to_string_pretty(&v))
                    .unwrap_or_else(|_| text.to_string());
                println!(
                    "--- frame {} @ {} ---\n{}",
                    received,
                    chrono::Utc::now().to_rfc3339(),
                    pretty
                );
                received += 1;
                if args.limit > 0 && received >= args.limit {
                    break;
                }
            }
            Message::Close(cf) => {
                println!("[!] Server closed the connection: {:?}", cf);
                break;
            }
            _ => {}
        }
    }

    println!("[*] Done after {} frames", received);
    Ok(())
}
