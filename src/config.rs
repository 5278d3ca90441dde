//! Config handling

use std::time::Duration;

use tracing::log::LevelFilter;

use crate::cli::{CliOptions, UpstreamProtocol};
use crate::constants::{DEFAULT_MODEL, DEFAULT_SIZE, DEFAULT_UPSTREAM_TIMEOUT};

/// Sets up logging based on the debug flag
pub fn setup_logging(debug: bool) -> Result<(), Box<std::io::Error>> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut logger = simple_logger::SimpleLogger::new().with_level(level);
    if !debug {
        logger = logger
            .with_module_level("tracing", LevelFilter::Warn)
            .with_module_level("rustls", LevelFilter::Info)
            .with_module_level("reqwest", LevelFilter::Info)
            .with_module_level("hyper_util", LevelFilter::Info)
            .with_module_level("h2", LevelFilter::Info);
    }
    logger.init().map_err(|err| {
        eprintln!("Failed to initialize logger: {}", err);
        Box::new(std::io::Error::other(err))
    })
}

/// Everything the upstream client needs to know.
///
/// `base_url` and `api_key` stay optional so the server can start without
/// them; every generation request fails with a configuration error until
/// both are set.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Base URL of the upstream service.
    pub base_url: Option<String>,
    /// Bearer token for the upstream service.
    pub api_key: Option<String>,
    /// Which endpoint shape to talk to.
    pub protocol: UpstreamProtocol,
    /// Model used when the request doesn't name one.
    pub default_model: String,
    /// Size used when the request doesn't name one.
    pub default_size: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            protocol: UpstreamProtocol::default(),
            default_model: DEFAULT_MODEL.to_string(),
            default_size: DEFAULT_SIZE.to_string(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

impl UpstreamConfig {
    /// Builds the upstream config from parsed CLI options.
    ///
    /// Blank values are treated as missing, so `OPENAI_API_KEY=""` is still a
    /// configuration error rather than an empty bearer token.
    pub fn from_cli(cli: &CliOptions) -> Self {
        Self {
            base_url: non_blank(cli.openai_base_url.as_deref()),
            api_key: non_blank(cli.openai_api_key.as_deref()),
            protocol: cli.upstream_protocol,
            default_model: cli.default_model.clone(),
            default_size: cli.default_size.clone(),
            timeout: Duration::from_secs(cli.upstream_timeout),
        }
    }

    /// True when both the base URL and the API key are present.
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
