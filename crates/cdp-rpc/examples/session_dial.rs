//! Session example - attaching to a page target and driving it

use cdp_rpc::{Conn, ConnConfig, Manager};
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let ws_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    let conn = Conn::dial(&ws_url, ConnConfig::default()).await?;
    let manager = Manager::new(conn.clone())?;

    let created = conn
        .invoke("Target.createTarget", Some(json!({ "url": "about:blank" })))
        .await?;
    let target_id = created["targetId"]
        .as_str()
        .ok_or("createTarget returned no targetId")?
        .to_string();

    let session = manager.dial(target_id.clone()).await?;
    println!("Attached to {} ({} session {})", target_id, session.mode(), session.id());

    let page = session.conn();
    let loaded = page.subscribe("Page.loadEventFired")?;
    page.invoke("Page.enable", None).await?;
    page.invoke("Page.navigate", Some(json!({ "url": "https://www.rust-lang.org" })))
        .await?;

    match tokio::time::timeout(Duration::from_secs(10), loaded.recv::<Value>()).await {
        Ok(event) => println!("Loaded at {}", event?["timestamp"]),
        Err(_) => println!("Load timed out"),
    }

    let title = page
        .invoke(
            "Runtime.evaluate",
            Some(json!({ "expression": "document.title", "returnByValue": true })),
        )
        .await?;
    println!("Title: {}", title["result"]["value"]);

    session.close().await?;
    manager.close().await?;
    conn.invoke("Target.closeTarget", Some(json!({ "targetId": target_id })))
        .await?;
    conn.close().await?;
    Ok(())
}
