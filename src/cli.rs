//! CLI parser
use clap::{Parser, ValueEnum};
use std::num::NonZeroU16;
use std::path::PathBuf;

use crate::constants::{DEFAULT_MODEL, DEFAULT_SIZE};

/// Which upstream API shape the base URL points at
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum UpstreamProtocol {
    /// `POST {base}/v1/images/generations`, structured image array in the response
    #[default]
    Images,
    /// `POST {base}/chat/completions`, image pulled out of markdown in the reply
    Chat,
}

#[derive(Parser, Debug)]
/// CLI Options
pub struct CliOptions {
    #[clap(long, help = "Enable debug logging", env = "STORYFRAME_DEBUG")]
    /// Enable debug logging. Env: STORYFRAME_DEBUG
    pub debug: bool,
    #[clap(long, short, default_value = "3000", env = "PORT")]
    /// http listener, defaults to `3000`.
    /// Env: PORT
    pub port: NonZeroU16,
    #[clap(
        long,
        short,
        default_value = "127.0.0.1",
        env = "STORYFRAME_LISTEN_ADDRESS"
    )]
    /// Listen address, defaults to `127.0.0.1`.
    /// Env: STORYFRAME_LISTEN_ADDRESS
    pub listen_address: String,

    #[clap(long, env = "OPENAI_BASE_URL")]
    /// Base URL of the OpenAI-compatible upstream, eg `https://api.openai.com`.
    /// Env: OPENAI_BASE_URL
    pub openai_base_url: Option<String>,

    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    /// Bearer token for the upstream.
    /// Env: OPENAI_API_KEY
    pub openai_api_key: Option<String>,

    #[clap(long, value_enum, default_value_t, env = "OPENAI_PROTOCOL")]
    /// Upstream protocol, `images` or `chat`.
    /// Env: OPENAI_PROTOCOL
    pub upstream_protocol: UpstreamProtocol,

    #[clap(long, default_value = DEFAULT_MODEL, env = "STORYFRAME_DEFAULT_MODEL")]
    /// Model used when a request doesn't name one.
    /// Env: STORYFRAME_DEFAULT_MODEL
    pub default_model: String,

    #[clap(long, default_value = DEFAULT_SIZE, env = "STORYFRAME_DEFAULT_SIZE")]
    /// Image size used when a request doesn't name one.
    /// Env: STORYFRAME_DEFAULT_SIZE
    pub default_size: String,

    #[clap(long, default_value = "120", env = "STORYFRAME_UPSTREAM_TIMEOUT")]
    /// Per-call upstream timeout in seconds.
    /// Env: STORYFRAME_UPSTREAM_TIMEOUT
    pub upstream_timeout: u64,

    #[clap(long, default_value = "./static", env = "STORYFRAME_STATIC_DIR")]
    /// Directory holding the browser UI, `index.html` is the fallback page.
    /// Env: STORYFRAME_STATIC_DIR
    pub static_dir: PathBuf,
}
