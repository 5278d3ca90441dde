//! Client for the OpenAI-compatible image generation upstream.
//!
//! Two endpoint shapes are supported, picked by [`UpstreamProtocol`]:
//! the images API, which answers with a structured array, and chat
//! completions, where the image has to be fished out of the markdown the
//! model writes back.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::cli::UpstreamProtocol;
use crate::config::UpstreamConfig;
use crate::constants::{CHAT_IMAGE_INSTRUCTION, NO_IMAGE_EXCERPT_CHARS};

/// Failures from a single upstream generation call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Base URL or API key is missing
    #[error(
        "Server is not configured. OPENAI_BASE_URL and OPENAI_API_KEY environment variables are required."
    )]
    NotConfigured,
    /// The configured base URL can't be turned into an endpoint
    #[error("Invalid upstream base URL {base}: {reason}")]
    InvalidBaseUrl {
        /// What was configured
        base: String,
        /// Why it was rejected
        reason: String,
    },
    /// Upstream answered with a non-success status
    #[error("Upstream API error {status}: {}", summarize_body(.body))]
    Upstream {
        /// Upstream HTTP status
        status: u16,
        /// Raw upstream response body
        body: String,
    },
    /// We couldn't talk to the upstream at all
    #[error("Failed to connect to the image generation API: {0}")]
    Connection(String),
    /// Upstream said yes but the body wasn't what we expected
    #[error("Unexpected response from the image generation API: {0}")]
    InvalidResponse(String),
    /// Upstream succeeded but there was no image in the answer
    #[error("No image was produced. Model said: {excerpt}")]
    NoImageProduced {
        /// Start of the upstream text, for diagnosing what went wrong
        excerpt: String,
    },
}

impl UpstreamError {
    fn connection(err: reqwest::Error) -> Self {
        UpstreamError::Connection(err.to_string())
    }
}

/// Pulls `error.message` out of an OpenAI-style error body, falling back to
/// the start of the raw body.
fn summarize_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| excerpt(body))
}

/// A reference to a generated image, either an `http(s)` URL or a `data:` URL.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Where the browser can load the image from
    pub url: String,
}

/// Something that can turn a prompt into an image.
#[async_trait]
pub trait ImageGenerator: Send + Sync + std::fmt::Debug {
    /// Fails with [`UpstreamError::NotConfigured`] when a call could never succeed.
    fn ensure_configured(&self) -> Result<(), UpstreamError>;

    /// Generate one image. `model` and `size` fall back to configured defaults.
    async fn generate_image(
        &self,
        prompt: &str,
        model: Option<&str>,
        size: Option<&str>,
    ) -> Result<ImageRef, UpstreamError>;
}

/// Request body for POST /v1/images/generations
#[derive(Serialize, Debug)]
struct ImagesGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
}

#[derive(Deserialize, Debug)]
struct ImagesGenerateResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize, Debug)]
struct ImageData {
    b64_json: Option<String>,
    url: Option<String>,
    revised_prompt: Option<String>,
}

#[derive(Serialize, Debug)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage; 1],
}

#[derive(Serialize, Debug)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize, Debug)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Markdown image, `![alt](url)`, where the url is http(s) or an inline image.
static MARKDOWN_IMAGE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"!\[[^\]]*\]\(((?:https?://|data:image/)[^\s)]+)\)")
});

/// Returns the URL of the first markdown image in `text`.
pub fn extract_markdown_image(text: &str) -> Option<&str> {
    let pattern = MARKDOWN_IMAGE.as_ref().ok()?;
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|found| found.as_str())
}

/// First [`NO_IMAGE_EXCERPT_CHARS`] characters of `text`.
pub fn excerpt(text: &str) -> String {
    text.chars().take(NO_IMAGE_EXCERPT_CHARS).collect()
}

fn trimmed_base(base: &str) -> &str {
    base.trim().trim_end_matches('/')
}

fn parse_endpoint(base: &str, endpoint: String) -> Result<Url, UpstreamError> {
    Url::parse(&endpoint).map_err(|err| UpstreamError::InvalidBaseUrl {
        base: base.to_string(),
        reason: err.to_string(),
    })
}

/// `{base}/v1/images/generations`, tolerating a base that already ends in `/v1`.
pub fn images_endpoint(base: &str) -> Result<Url, UpstreamError> {
    let clean = trimmed_base(base);
    let clean = clean.strip_suffix("/v1").unwrap_or(clean);
    parse_endpoint(base, format!("{clean}/v1/images/generations"))
}

/// `{base}/chat/completions`.
pub fn chat_endpoint(base: &str) -> Result<Url, UpstreamError> {
    parse_endpoint(base, format!("{}/chat/completions", trimmed_base(base)))
}

/// Talks to the configured upstream over HTTP.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Builds the HTTP client with the configured per-call timeout.
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn credentials(&self) -> Result<(&str, &str), UpstreamError> {
        match (
            self.config.base_url.as_deref(),
            self.config.api_key.as_deref(),
        ) {
            (Some(base), Some(key)) => Ok((base, key)),
            _ => Err(UpstreamError::NotConfigured),
        }
    }

    async fn post_json<B, R>(&self, url: Url, api_key: &str, body: &B) -> Result<R, UpstreamError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!("POST {}", url);
        let resp = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(UpstreamError::connection)?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(UpstreamError::connection)?;
        if !status.is_success() {
            return Err(UpstreamError::Upstream {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|err| UpstreamError::InvalidResponse(err.to_string()))
    }

    async fn generate_via_images(
        &self,
        base: &str,
        api_key: &str,
        prompt: &str,
        model: &str,
        size: &str,
    ) -> Result<ImageRef, UpstreamError> {
        let body = ImagesGenerateRequest {
            model,
            prompt,
            n: 1,
            size,
        };
        let parsed: ImagesGenerateResponse = self
            .post_json(images_endpoint(base)?, api_key, &body)
            .await?;

        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::NoImageProduced {
                excerpt: "upstream returned no image data".to_string(),
            })?;

        if let Some(revised_prompt) = first.revised_prompt {
            debug!("Revised prompt from upstream: {revised_prompt}");
        }

        match (first.url, first.b64_json) {
            (Some(url), _) => Ok(ImageRef { url }),
            (None, Some(b64_json)) => Ok(ImageRef {
                url: format!("data:image/png;base64,{b64_json}"),
            }),
            (None, None) => Err(UpstreamError::NoImageProduced {
                excerpt: "image response missing b64_json and url fields".to_string(),
            }),
        }
    }

    async fn generate_via_chat(
        &self,
        base: &str,
        api_key: &str,
        prompt: &str,
        model: &str,
    ) -> Result<ImageRef, UpstreamError> {
        let body = ChatCompletionRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: format!("{CHAT_IMAGE_INSTRUCTION}{prompt}"),
            }],
        };
        let parsed: ChatCompletionResponse =
            self.post_json(chat_endpoint(base)?, api_key, &body).await?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        match extract_markdown_image(&text) {
            Some(url) => Ok(ImageRef {
                url: url.to_string(),
            }),
            None => Err(UpstreamError::NoImageProduced {
                excerpt: excerpt(&text),
            }),
        }
    }
}

#[async_trait]
impl ImageGenerator for UpstreamClient {
    fn ensure_configured(&self) -> Result<(), UpstreamError> {
        self.credentials().map(|_| ())
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: Option<&str>,
        size: Option<&str>,
    ) -> Result<ImageRef, UpstreamError> {
        let (base, api_key) = self.credentials()?;
        let model = model.unwrap_or(&self.config.default_model);
        let size = size.unwrap_or(&self.config.default_size);

        match self.config.protocol {
            UpstreamProtocol::Images => {
                self.generate_via_images(base, api_key, prompt, model, size)
                    .await
            }
            UpstreamProtocol::Chat => self.generate_via_chat(base, api_key, prompt, model).await,
        }
    }
}

/// Serves `router` on an ephemeral local port, returning its base URL.
#[cfg(test)]
pub(crate) async fn spawn_test_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test upstream");
    let addr = listener.local_addr().expect("test upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};

    fn client_for(base: &str, protocol: UpstreamProtocol) -> UpstreamClient {
        UpstreamClient::new(UpstreamConfig {
            base_url: Some(base.to_string()),
            api_key: Some("sk-test".to_string()),
            protocol,
            ..UpstreamConfig::default()
        })
        .expect("build client")
    }

    #[test]
    fn images_endpoint_strips_slashes_and_v1() {
        for base in [
            "https://api.example.com",
            "https://api.example.com/",
            "https://api.example.com/v1",
            "https://api.example.com/v1//",
        ] {
            assert_eq!(
                images_endpoint(base).expect("endpoint").as_str(),
                "https://api.example.com/v1/images/generations",
                "base {base}"
            );
        }
    }

    #[test]
    fn chat_endpoint_appends_path() {
        assert_eq!(
            chat_endpoint("https://llm.example.com/api/v1/")
                .expect("endpoint")
                .as_str(),
            "https://llm.example.com/api/v1/chat/completions"
        );
    }

    #[test]
    fn garbage_base_is_rejected() {
        assert!(matches!(
            images_endpoint("not a url"),
            Err(UpstreamError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn markdown_image_is_extracted() {
        assert_eq!(
            extract_markdown_image("Here: ![img](https://x.test/a.png) done"),
            Some("https://x.test/a.png")
        );
        assert_eq!(
            extract_markdown_image("![](data:image/png;base64,iVBORw0KGgo=)"),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
        assert_eq!(
            extract_markdown_image("first ![a](http://a.test/1.png) then ![b](http://b.test/2.png)"),
            Some("http://a.test/1.png")
        );
    }

    #[test]
    fn markdown_image_requires_allowed_scheme() {
        assert_eq!(extract_markdown_image("![img](ftp://x.test/a.png)"), None);
        assert_eq!(extract_markdown_image("[link](https://x.test/a.png)"), None);
        assert_eq!(extract_markdown_image("just words"), None);
    }

    #[test]
    fn excerpt_counts_characters() {
        let text = "é".repeat(300);
        let cut = excerpt(&text);
        assert_eq!(cut.chars().count(), NO_IMAGE_EXCERPT_CHARS);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn upstream_error_message_prefers_error_field() {
        let err = UpstreamError::Upstream {
            status: 429,
            body: r#"{"error":{"message":"slow down"}}"#.to_string(),
        };
        assert_eq!(err.to_string(), "Upstream API error 429: slow down");
    }

    #[tokio::test]
    async fn missing_configuration_fails_without_io() {
        let client = UpstreamClient::new(UpstreamConfig {
            api_key: Some("sk-test".to_string()),
            ..UpstreamConfig::default()
        })
        .expect("build client");
        assert!(matches!(
            client.ensure_configured(),
            Err(UpstreamError::NotConfigured)
        ));
        let result = client.generate_image("a cat", None, None).await;
        assert!(matches!(result, Err(UpstreamError::NotConfigured)));
    }

    #[tokio::test]
    async fn images_protocol_returns_url() {
        let router = Router::new().route(
            "/v1/images/generations",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer sk-test")
                );
                assert_eq!(body["n"], 1);
                assert_eq!(body["size"], "1024x1024");
                assert_eq!(body["model"], "nano-banana-pro");
                Json(json!({"created": 1, "data": [{"url": "https://img.test/1.png"}]}))
            }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&format!("{base}/v1/"), UpstreamProtocol::Images);

        let image = client
            .generate_image("a lighthouse", None, None)
            .await
            .expect("image");
        assert_eq!(image.url, "https://img.test/1.png");
    }

    #[tokio::test]
    async fn images_protocol_wraps_base64() {
        let router = Router::new().route(
            "/v1/images/generations",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["size"], "512x512");
                assert_eq!(body["model"], "dall-e-2");
                Json(json!({"data": [{"b64_json": "aGVsbG8="}]}))
            }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&base, UpstreamProtocol::Images);

        let image = client
            .generate_image("a lighthouse", Some("dall-e-2"), Some("512x512"))
            .await
            .expect("image");
        assert_eq!(image.url, "data:image/png;base64,aGVsbG8=");
    }

    #[tokio::test]
    async fn images_protocol_empty_data_is_no_image() {
        let router = Router::new().route(
            "/v1/images/generations",
            post(|| async { Json(json!({"data": []})) }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&base, UpstreamProtocol::Images);

        let result = client.generate_image("nothing", None, None).await;
        assert!(matches!(
            result,
            Err(UpstreamError::NoImageProduced { .. })
        ));
    }

    #[tokio::test]
    async fn upstream_status_and_body_are_relayed() {
        let router = Router::new().route(
            "/v1/images/generations",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": {"message": "quota exceeded"}})),
                )
            }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&base, UpstreamProtocol::Images);

        match client.generate_image("busy", None, None).await {
            Err(UpstreamError::Upstream { status, body }) => {
                assert_eq!(status, 429);
                assert!(body.contains("quota exceeded"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_protocol_extracts_markdown_image() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["messages"][0]["role"], "user");
                assert_eq!(
                    body["messages"][0]["content"],
                    "Generate an image: a lighthouse at dawn"
                );
                Json(json!({
                    "choices": [
                        {"message": {"role": "assistant", "content": "Here: ![img](https://x.test/a.png) done"}}
                    ]
                }))
            }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&base, UpstreamProtocol::Chat);

        let image = client
            .generate_image("a lighthouse at dawn", None, None)
            .await
            .expect("image");
        assert_eq!(image.url, "https://x.test/a.png");
    }

    #[tokio::test]
    async fn chat_protocol_without_image_reports_text() {
        let chatter = "I cannot draw that, but here is a poem. ".repeat(10);
        let reply = chatter.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move || {
                let reply = reply.clone();
                async move { Json(json!({"choices": [{"message": {"content": reply}}]})) }
            }),
        );
        let base = spawn_test_upstream(router).await;
        let client = client_for(&base, UpstreamProtocol::Chat);

        match client.generate_image("a poem", None, None).await {
            Err(UpstreamError::NoImageProduced { excerpt: text }) => {
                assert_eq!(text, chatter.chars().take(200).collect::<String>());
            }
            other => panic!("expected NoImageProduced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client = client_for(&format!("http://{addr}"), UpstreamProtocol::Images);

        let result = client.generate_image("anyone there", None, None).await;
        assert!(matches!(result, Err(UpstreamError::Connection(_))));
    }
}
