//! Shared constants/defaults for things
//!

use std::time::Duration;

/// Model sent upstream when the caller doesn't pick one
pub const DEFAULT_MODEL: &str = "nano-banana-pro";

/// Image size sent upstream when the caller doesn't pick one
pub const DEFAULT_SIZE: &str = "1024x1024";

/// Upper bound on a single upstream call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Scene count used when the request doesn't carry a usable one.
pub const DEFAULT_SCENE_COUNT: usize = 5;

/// Fewest scenes a story can be split into.
pub const MIN_SCENE_COUNT: usize = 2;

/// Most scenes a story can be split into.
pub const MAX_SCENE_COUNT: usize = 8;

/// How much of the model's text we keep when it didn't produce an image.
pub const NO_IMAGE_EXCERPT_CHARS: usize = 200;

/// Prefix for the single user message in the chat-completions protocol.
pub const CHAT_IMAGE_INSTRUCTION: &str = "Generate an image: ";

/// Content type for the scene stream.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Outcomes buffered between the scene coordinator and the response body.
pub const SCENE_CHANNEL_CAPACITY: usize = 1;
