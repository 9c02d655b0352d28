//! CityForge webhook server binary.

use cityforge_webhook_server::{WebhookServer, config_or_default, load_config, log_level};

const DEFAULT_CONFIG_PATH: &str = "cityforge.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CITYFORGE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let loaded = load_config(&path);
    tracing_subscriber::fmt().with_max_level(log_level(&loaded)).init();
    let config = config_or_default(&path, loaded);

    let server = WebhookServer::new(config)?;
    server.run().await?;

    Ok(())
}
