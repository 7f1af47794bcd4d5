//! Session example - attach to a new tab and drive it through a flat session

use cdp::{CDPClient, CDPSession, Command, Empty, Event, SocketConfig};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTarget {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTargetResult {
    target_id: String,
}

impl Command for CreateTarget {
    const METHOD: &'static str = "Target.createTarget";
    type Response = CreateTargetResult;
}

#[derive(Serialize)]
struct PageEnable;

impl Command for PageEnable {
    const METHOD: &'static str = "Page.enable";
    type Response = Empty;
}

#[derive(Debug, Deserialize)]
struct LoadEventFired {
    timestamp: f64,
}

impl Event for LoadEventFired {
    const METHOD: &'static str = "Page.loadEventFired";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    let client = CDPClient::connect(SocketConfig::new(url)).await?;

    client.on(|event: LoadEventFired| {
        println!("Page loaded at {}", event.timestamp);
    });

    let created = client
        .execute(&CreateTarget {
            url: "about:blank".to_string(),
        })
        .await?;
    println!("Created tab: {}", created.target_id);

    let session = CDPSession::attach(client.clone(), created.target_id).await?;
    session.execute(&PageEnable).await?;
    session
        .send(
            "Page.navigate",
            Some(serde_json::json!({ "url": "https://www.rust-lang.org" })),
        )
        .await?;

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    let title = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": "document.title", "returnByValue": true })),
        )
        .await?;
    println!("Page title via JS: {}", title["result"]["value"]);

    session.detach().await?;
    client.stop().await;
    Ok(())
}
