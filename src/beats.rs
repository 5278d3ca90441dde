//! Narrative beats and per-scene prompt composition.

use serde_json::Value;

use crate::constants::{DEFAULT_SCENE_COUNT, MAX_SCENE_COUNT, MIN_SCENE_COUNT};

/// The fixed story arc scenes are sampled from, in order.
pub const BEATS: [&str; 8] = [
    "establishing shot, introducing the setting and the main character",
    "the inciting moment, something unexpected disrupts the calm",
    "rising action, the journey begins and the stakes become clear",
    "a challenge appears, obstacles block the way forward",
    "the turning point, tension builds as everything changes",
    "the climax, the most dramatic and intense moment of the story",
    "the aftermath, calm returns and the resolution begins",
    "final scene, satisfying conclusion that brings the story full circle",
];

/// Index into [`BEATS`] for scene `index` of `count`.
///
/// Beats are sampled proportionally, `floor(index / count * 8)`, so fewer
/// than eight scenes skip beats and uneven counts repeat some.
pub fn beat_index(index: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    (index * BEATS.len() / count).min(BEATS.len() - 1)
}

/// Beat descriptor for scene `index` of `count`.
pub fn beat_for(index: usize, count: usize) -> &'static str {
    BEATS[beat_index(index, count)]
}

/// Builds the prompt sent upstream for one scene.
///
/// `count` is expected to be normalized already, see [`normalize_scene_count`].
pub fn compose_prompt(base_prompt: &str, index: usize, count: usize) -> String {
    format!(
        "Scene {} of {}: {} — {}",
        index + 1,
        count,
        base_prompt,
        beat_for(index, count)
    )
}

/// Normalizes a raw `sceneCount` value from a request body.
///
/// Missing, null, non-numeric, zero and negative values become the default,
/// numeric strings are read up to the first non-digit, fractions truncate.
/// The result is clamped to the supported range.
pub fn normalize_scene_count(raw: Option<&Value>) -> usize {
    let requested = match raw {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Some(Value::String(text)) => leading_integer(text),
        _ => None,
    };

    let count = match requested {
        Some(count) if count > 0 => usize::try_from(count).unwrap_or(MAX_SCENE_COUNT),
        _ => DEFAULT_SCENE_COUNT,
    };
    count.clamp(MIN_SCENE_COUNT, MAX_SCENE_COUNT)
}

fn leading_integer(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    // overflow saturates
    Some(digits[..end].parse::<i64>().map_or(sign * i64::MAX, |n| sign * n))
}
