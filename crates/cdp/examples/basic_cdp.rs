//! Basic CDP example - connecting, issuing commands and listening for events
//!
//! Start Chrome with `--remote-debugging-port=9222` and pass the browser
//! WebSocket URL from `http://localhost:9222/json/version` as the first argument.

use cdp::{CDPClient, CDPEvent, SocketConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    let config = SocketConfig::new(url).with_command_timeout(Duration::from_secs(10));
    println!("Connecting to Chrome at: {}", config.url);

    let client = CDPClient::connect(config).await?;
    println!("Connected!");

    // Subscribe to target events before asking for them
    client.subscribe(
        "Target.targetCreated",
        Arc::new(|event: CDPEvent| {
            println!("Target created: {}", event.params["targetInfo"]["url"]);
        }),
    );

    // Both commands are in flight at once
    let version = client.send_command("Browser.getVersion", None);
    let targets = client.send_command("Target.getTargets", None);

    println!("Browser version: {}", version.await?);
    println!("Targets: {}", targets.await?);

    client
        .send_request(
            "Target.setDiscoverTargets",
            Some(serde_json::json!({ "discover": true })),
        )
        .await?;

    // Keep alive for a bit to see events
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Clean shutdown
    client.stop().await;
    println!("Disconnected");

    Ok(())
}
