//! Newline-delimited JSON response bodies.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use futures::stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::constants::NDJSON_CONTENT_TYPE;
use crate::error::StoryframeError;

/// One record, one line.
pub(crate) fn encode_line<T: Serialize>(record: &T) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Streams every record from `records` as its own body chunk.
///
/// The body ends once all senders are dropped. Dropping the body (client
/// disconnect) drops the receiver, which the sending side can observe.
pub(crate) fn ndjson_response<T>(records: mpsc::Receiver<T>) -> Result<Response, StoryframeError>
where
    T: Serialize + Send + 'static,
{
    let lines = stream::unfold(records, |mut records| async move {
        loop {
            let record = records.recv().await?;
            match encode_line(&record) {
                Ok(line) => return Some((Ok::<_, Infallible>(line), records)),
                Err(err) => error!("Dropping stream record that won't serialize: {}", err),
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(lines))
        .map_err(StoryframeError::from)
}
