//! Basic RPC example - connecting, calling and reading notifications

use cdp_rpc::{Conn, ConnConfig};
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let ws_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    println!("Connecting to {}", ws_url);

    let config = ConnConfig {
        request_timeout: Some(Duration::from_secs(10)),
        ..ConnConfig::default()
    };
    let conn = Conn::dial(&ws_url, config).await?;

    let version = conn.invoke("Browser.getVersion", None).await?;
    println!("Browser version: {}", version["product"]);

    // Subscribe before enabling discovery so no notification is missed.
    let created = conn.subscribe("Target.targetCreated")?;
    conn.invoke("Target.setDiscoverTargets", Some(json!({ "discover": true })))
        .await?;

    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        match created.recv_until::<Value, _>(&mut deadline).await {
            Ok(event) => println!("Target: {} {}", event["targetInfo"]["type"], event["targetInfo"]["url"]),
            Err(e) if e.is_cancelled() || e.is_closing() => break,
            Err(e) => return Err(e.into()),
        }
    }

    conn.close().await?;
    println!("Disconnected");
    Ok(())
}
