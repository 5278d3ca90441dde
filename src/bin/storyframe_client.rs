use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose;
use clap::Parser;
use futures::StreamExt;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use storyframe::beats::normalize_scene_count;
use storyframe::config::setup_logging;
use storyframe::pipeline::SceneOutcome;
use storyframe::progress::{NdjsonDecoder, SceneProgress, SceneResultSet, SlotState};

/// Generate a story as a series of scenes on a running storyframe server.
///
/// Minimal UX:
///   storyframe_client "a lighthouse at dawn" --scenes 3 --out-dir ./story
#[derive(Parser, Debug)]
#[command(name = "storyframe_client")]
#[command(about = "Stream a multi-scene story from a storyframe server and save the images")]
struct Args {
    /// Story prompt, split into scenes by the server
    prompt: String,

    /// Number of scenes, 2 to 8
    #[arg(long, short, default_value_t = 5)]
    scenes: i64,

    /// Image model, defaults to whatever the server is configured with
    #[arg(long)]
    model: Option<String>,

    /// Server base URL
    #[arg(long, default_value = "http://127.0.0.1:3000", env = "STORYFRAME_SERVER")]
    server: String,

    /// Save successful scenes here as scene-01.png, scene-02.png, ...
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Splits a `data:` URL into its mime type and decoded payload.
fn decode_data_url(url: &str) -> Result<(String, Vec<u8>)> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("Not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("Data URL has no payload"))?;
    let mime = header.strip_suffix(";base64").ok_or_else(|| {
        anyhow!("Only base64 data URLs are supported, got header {header}")
    })?;
    let bytes = general_purpose::STANDARD
        .decode(payload)
        .context("Failed to base64-decode image")?;
    Ok((mime.to_string(), bytes))
}

fn extension_for(mime: Option<&str>, url: &str) -> String {
    match mime {
        Some("image/jpeg") => return "jpg".to_string(),
        Some("image/webp") => return "webp".to_string(),
        Some("image/png") => return "png".to_string(),
        _ => {}
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| matches!(*ext, "png" | "jpg" | "jpeg" | "webp"))
        .unwrap_or("png")
        .to_string()
}

async fn fetch_image(client: &reqwest::Client, url: &str) -> Result<(String, Vec<u8>)> {
    if url.starts_with("data:") {
        let (mime, bytes) = decode_data_url(url)?;
        return Ok((extension_for(Some(&mime), url), bytes));
    }

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {url}"))?;
    let status = resp.status();
    let mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = resp
        .bytes()
        .await
        .context("Failed to read downloaded image bytes")?;
    if !status.is_success() {
        bail!("Image download error {status} for {url}");
    }
    Ok((extension_for(mime.as_deref(), url), bytes.to_vec()))
}

/// Writes every image in story order.
async fn save_results(
    client: &reqwest::Client,
    out_dir: &Path,
    results: &SceneResultSet,
) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    for image in results.images() {
        let (ext, bytes) = fetch_image(client, &image.url).await?;
        let path = out_dir.join(format!("scene-{:02}.{ext}", image.index + 1));
        fs::write(&path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Saved: {}", path.display());
    }
    Ok(())
}

fn report(progress: &mut SceneProgress, outcome: SceneOutcome) {
    let index = outcome.index;
    let total = progress.total();
    let line = match progress.apply(outcome) {
        Some(SlotState::Done(url)) if url.starts_with("data:") => {
            format!("Scene {}/{} ready (inline image)", index + 1, total)
        }
        Some(SlotState::Done(url)) => format!("Scene {}/{} ready: {url}", index + 1, total),
        Some(SlotState::Failed(error)) => format!("Scene {}/{} failed: {error}", index + 1, total),
        Some(SlotState::Pending) | None => format!("Ignoring unexpected scene index {index}"),
    };
    eprintln!("[{:>3}%] {line}", progress.percent());
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.debug)?;

    let total = normalize_scene_count(Some(&json!(args.scenes)));
    let url = format!("{}/api/generate-scenes", args.server.trim_end_matches('/'));
    let client = reqwest::Client::new();

    let resp = client
        .post(&url)
        .json(&json!({
            "prompt": args.prompt,
            "sceneCount": total,
            "model": args.model,
        }))
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(body);
        bail!("Server returned {status}: {message}");
    }

    eprintln!("Generating {total} scenes...");
    let mut progress = SceneProgress::new(total);
    let mut decoder = NdjsonDecoder::<SceneOutcome>::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Scene stream interrupted")?;
        for outcome in decoder.push(&chunk) {
            report(&mut progress, outcome);
        }
    }
    if let Some(outcome) = decoder.finish() {
        report(&mut progress, outcome);
    }
    eprintln!("{}", progress.progress_text());

    let results = progress.finish();
    if results.is_empty() {
        eprintln!("No scenes succeeded, nothing to save.");
        return Ok(());
    }

    match args.out_dir {
        Some(out_dir) => save_results(&client, &out_dir, &results).await?,
        None => {
            for image in results.images() {
                println!("{}\t{}", image.index + 1, image.url);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_is_decoded() {
        let (mime, bytes) = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn non_base64_data_url_is_refused() {
        assert!(decode_data_url("data:image/svg+xml,<svg/>").is_err());
        assert!(decode_data_url("https://x.test/a.png").is_err());
    }

    #[test]
    fn extension_follows_mime_then_path() {
        assert_eq!(extension_for(Some("image/jpeg"), "https://x.test/a"), "jpg");
        assert_eq!(extension_for(None, "https://x.test/a.webp?sig=1"), "webp");
        assert_eq!(extension_for(Some("application/octet-stream"), "https://x.test/a"), "png");
    }
}
