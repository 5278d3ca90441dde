//! Client-side view of a scene stream.
//!
//! [`NdjsonDecoder`] turns arbitrary body chunks into records, and
//! [`SceneProgress`] keeps the per-scene slots, the completion counter and
//! the images collected for bulk download.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::pipeline::{SceneOutcome, SceneStatus};

/// Incremental newline-delimited JSON reader.
///
/// Bytes after the last newline are held until the rest of the line shows
/// up. Lines that don't parse are dropped without ending the stream.
#[derive(Debug)]
pub struct NdjsonDecoder<T> {
    buffer: Vec<u8>,
    skipped: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> Default for NdjsonDecoder<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            skipped: 0,
            _record: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> NdjsonDecoder<T> {
    /// A decoder with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk, returning every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = self.buffer.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete
            .split(|byte| *byte == b'\n')
            .filter_map(|line| self.parse_line(line))
            .collect()
    }

    /// Call at end of stream: parses a final line that had no newline.
    pub fn finish(&mut self) -> Option<T> {
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(&line)
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Lines dropped because they weren't valid records.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<T> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("Skipping malformed stream line: {}", err);
                self.skipped += 1;
                None
            }
        }
    }
}

/// What a scene's card shows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Still waiting on the server
    Pending,
    /// Image ready
    Done(String),
    /// Upstream failed for this scene
    Failed(String),
}

/// A successful scene kept for download.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SceneImage {
    /// 0-based scene position
    pub index: usize,
    /// Image location, http(s) or `data:` URL
    pub url: String,
}

/// Successful scenes in story order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SceneResultSet {
    images: Vec<SceneImage>,
}

impl SceneResultSet {
    /// Images sorted by scene index.
    pub fn images(&self) -> &[SceneImage] {
        &self.images
    }

    /// Nothing to download; the bulk download button stays disabled.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }
}

/// Progress of one scene stream.
#[derive(Clone, Debug)]
pub struct SceneProgress {
    total: usize,
    slots: Vec<SlotState>,
    completed: usize,
    images: Vec<SceneImage>,
}

impl SceneProgress {
    /// Creates a pending slot for each of `total` scenes.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            slots: vec![SlotState::Pending; total],
            completed: 0,
            images: Vec::new(),
        }
    }

    /// Records one outcome. Returns the slot's new state, or `None` when the
    /// index doesn't belong to this stream (it still counts as completed).
    pub fn apply(&mut self, outcome: SceneOutcome) -> Option<&SlotState> {
        self.completed += 1;
        let index = outcome.index;
        let state = match outcome.status {
            SceneStatus::Ok { url } => {
                self.images.push(SceneImage {
                    index,
                    url: url.clone(),
                });
                SlotState::Done(url)
            }
            SceneStatus::Error { error } => SlotState::Failed(error),
        };

        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = state;
                Some(&*slot)
            }
            None => {
                warn!("Scene index {} outside of 0..{}", index, self.total);
                None
            }
        }
    }

    /// Outcomes received so far, in arrival order.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Number of scenes in the stream.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Current state of every slot, by index.
    pub fn slots(&self) -> &[SlotState] {
        &self.slots
    }

    /// `round(completed / total * 100)`.
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.completed as f64 / self.total as f64 * 100.0).round() as u32
    }

    /// Line shown under the progress bar.
    pub fn progress_text(&self) -> String {
        format!(
            "{} of {} scenes complete ({}%)",
            self.completed,
            self.total,
            self.percent()
        )
    }

    /// Ends the stream, handing back the successful scenes sorted by index.
    pub fn finish(self) -> SceneResultSet {
        let mut images = self.images;
        images.sort_by_key(|image| image.index);
        SceneResultSet { images }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lines_wait_for_the_newline() {
        let mut decoder = NdjsonDecoder::<SceneOutcome>::new();
        let line = serde_json::to_string(&SceneOutcome::ok(0, 2, "https://x.test/0.png"))
            .expect("serialize");
        let (head, tail) = line.split_at(10);

        assert!(decoder.push(head.as_bytes()).is_empty());
        assert_eq!(decoder.pending(), head.len());
        assert!(decoder.push(tail.as_bytes()).is_empty());

        let records = decoder.push(b"\n");
        assert_eq!(records, vec![SceneOutcome::ok(0, 2, "https://x.test/0.png")]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn several_records_in_one_chunk() {
        let mut decoder = NdjsonDecoder::<SceneOutcome>::new();
        let chunk = concat!(
            r#"{"index":0,"total":3,"status":"ok","url":"a"}"#,
            "\n",
            r#"{"index":1,"total":3,"status":"error","error":"bad"}"#,
            "\n",
            r#"{"index":2,"total":3,"#,
        );
        let records = decoder.push(chunk.as_bytes());
        assert_eq!(
            records,
            vec![SceneOutcome::ok(0, 3, "a"), SceneOutcome::error(1, 3, "bad")]
        );
        assert!(decoder.pending() > 0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut decoder = NdjsonDecoder::<SceneOutcome>::new();
        let records = decoder.push(
            b"not json\n\n{\"index\":1,\"total\":2,\"status\":\"ok\",\"url\":\"b\"}\r\n{\"index\":\n",
        );
        assert_eq!(records, vec![SceneOutcome::ok(1, 2, "b")]);
        assert_eq!(decoder.skipped(), 2);
    }

    #[test]
    fn finish_parses_unterminated_tail() {
        let mut decoder = NdjsonDecoder::<SceneOutcome>::new();
        assert!(decoder
            .push(br#"{"index":0,"total":2,"status":"ok","url":"z"}"#)
            .is_empty());
        assert_eq!(decoder.finish(), Some(SceneOutcome::ok(0, 2, "z")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn slots_update_by_index_and_counter_by_arrival() {
        let mut progress = SceneProgress::new(3);
        assert_eq!(progress.slots(), &[SlotState::Pending, SlotState::Pending, SlotState::Pending]);
        assert_eq!(progress.percent(), 0);

        progress.apply(SceneOutcome::ok(2, 3, "c"));
        assert_eq!(progress.completed(), 1);
        assert_eq!(progress.percent(), 33);
        assert_eq!(progress.slots()[2], SlotState::Done("c".to_string()));
        assert_eq!(progress.slots()[0], SlotState::Pending);

        progress.apply(SceneOutcome::error(0, 3, "nope"));
        assert_eq!(progress.percent(), 67);
        assert_eq!(progress.slots()[0], SlotState::Failed("nope".to_string()));

        progress.apply(SceneOutcome::ok(1, 3, "b"));
        assert_eq!(progress.percent(), 100);
        assert_eq!(progress.progress_text(), "3 of 3 scenes complete (100%)");
    }

    #[test]
    fn out_of_range_index_counts_but_touches_no_slot() {
        let mut progress = SceneProgress::new(2);
        assert!(progress.apply(SceneOutcome::ok(7, 2, "x")).is_none());
        assert_eq!(progress.completed(), 1);
        assert_eq!(progress.slots(), &[SlotState::Pending, SlotState::Pending]);
    }

    #[test]
    fn results_are_sorted_by_index() {
        let mut progress = SceneProgress::new(4);
        progress.apply(SceneOutcome::ok(3, 4, "d"));
        progress.apply(SceneOutcome::ok(1, 4, "b"));
        progress.apply(SceneOutcome::error(2, 4, "lost"));
        progress.apply(SceneOutcome::ok(0, 4, "a"));

        let results = progress.finish();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results
                .images()
                .iter()
                .map(|image| (image.index, image.url.as_str()))
                .collect::<Vec<_>>(),
            vec![(0, "a"), (1, "b"), (3, "d")]
        );
    }

    #[test]
    fn no_successes_means_nothing_to_download() {
        let mut progress = SceneProgress::new(2);
        progress.apply(SceneOutcome::error(0, 2, "x"));
        progress.apply(SceneOutcome::error(1, 2, "y"));
        assert_eq!(progress.percent(), 100);
        assert!(progress.finish().is_empty());
    }
}
