use std::sync::Arc;

use clap::Parser;
use storyframe::config::{UpstreamConfig, setup_logging};
use storyframe::upstream::UpstreamClient;
use tracing::{error, info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = storyframe::cli::CliOptions::parse();

    if setup_logging(cli.debug).is_err() {
        return;
    }

    let config = UpstreamConfig::from_cli(&cli);
    if config.is_configured() {
        info!(
            "Using {:?} upstream protocol, default model {}",
            config.protocol, config.default_model
        );
    } else {
        warn!(
            "OPENAI_BASE_URL and OPENAI_API_KEY are not both set, generation requests will fail"
        );
    }

    let client = match UpstreamClient::new(config) {
        Ok(client) => client,
        Err(err) => {
            error!("Failed to build upstream client: {}", err);
            return;
        }
    };

    let app = storyframe::web::create_app(Arc::new(client), &cli.static_dir);
    if let Err(err) = storyframe::web::setup_server(&cli.listen_address, cli.port, app).await {
        error!("Application error: {}", err);
    }
}
