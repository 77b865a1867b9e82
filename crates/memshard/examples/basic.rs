//! Minimal demo against a running memcached fleet.
//!
//! ```text
//! cargo run --example basic -- cache-1:11211 cache-2:11211
//! ```

use anyhow::Result;
use memshard::{ClientConfig, ShardedClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let hosts: Vec<String> = std::env::args().skip(1).collect();
    let config = ClientConfig::from_strs(if hosts.is_empty() {
        vec!["127.0.0.1:11211".to_owned()]
    } else {
        hosts
    })?;

    let client = ShardedClient::connected(config).await?;
    println!("connected backends: {:?}", client.connected_backends());

    client
        .set("memshard:demo", "hello from memshard", 0, 60)
        .await;
    if let Some(value) = client.get("memshard:demo").await {
        println!("read back: {}", String::from_utf8_lossy(&value.data));
    }

    for (server, version) in client.version().await {
        println!("{server}: memcached {version}");
    }

    client.disconnect();
    Ok(())
}
