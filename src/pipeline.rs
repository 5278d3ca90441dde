//! Multi-scene generation: one story prompt in, one outcome per scene out.
//!
//! Scenes run strictly one after another, so outcomes come out in index
//! order without any reordering buffer. A failing scene turns into an
//! `error` outcome for that index and the rest of the story carries on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::beats::compose_prompt;
use crate::constants::SCENE_CHANNEL_CAPACITY;
use crate::upstream::ImageGenerator;

/// What happened to one scene, streamed to the client as a single NDJSON line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SceneOutcome {
    /// 0-based scene position
    pub index: usize,
    /// Number of scenes in the story
    pub total: usize,
    /// `ok` with a url, or `error` with a message
    #[serde(flatten)]
    pub status: SceneStatus,
}

/// Success or failure of a scene.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SceneStatus {
    /// The upstream produced an image
    Ok {
        /// Image location, http(s) or `data:` URL
        url: String,
    },
    /// The upstream call failed
    Error {
        /// Human readable failure
        error: String,
    },
}

impl SceneOutcome {
    /// A successful scene.
    pub fn ok(index: usize, total: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            total,
            status: SceneStatus::Ok { url: url.into() },
        }
    }

    /// A failed scene.
    pub fn error(index: usize, total: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            total,
            status: SceneStatus::Error {
                error: error.into(),
            },
        }
    }

    /// The image URL when the scene succeeded.
    pub fn url(&self) -> Option<&str> {
        match &self.status {
            SceneStatus::Ok { url } => Some(url),
            SceneStatus::Error { .. } => None,
        }
    }
}

/// One unit of work: the composed prompt for a scene.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SceneTask {
    /// 0-based scene position
    pub index: usize,
    /// Prompt sent upstream, base prompt plus the scene's beat
    pub prompt: String,
}

/// Counters from a finished (or abandoned) run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PipelineReport {
    /// Outcomes handed to the sink
    pub emitted: usize,
    /// Of those, how many carried an image
    pub succeeded: usize,
    /// The sink went away before every scene was delivered
    pub aborted: bool,
}

/// The ordered list of scenes for one story.
#[derive(Clone, Debug)]
pub struct ScenePipeline {
    tasks: Vec<SceneTask>,
    model: Option<String>,
}

impl ScenePipeline {
    /// Expands `base_prompt` into `count` scene tasks.
    ///
    /// `count` should already be normalized with
    /// [`normalize_scene_count`](crate::beats::normalize_scene_count).
    pub fn new(base_prompt: &str, count: usize, model: Option<String>) -> Self {
        let tasks = (0..count)
            .map(|index| SceneTask {
                index,
                prompt: compose_prompt(base_prompt, index, count),
            })
            .collect();
        Self { tasks, model }
    }

    /// The scenes in the order they will run.
    pub fn tasks(&self) -> &[SceneTask] {
        &self.tasks
    }

    /// Number of scenes.
    pub fn total(&self) -> usize {
        self.tasks.len()
    }

    /// Runs every scene in order, sending each outcome as soon as it's known.
    ///
    /// If the receiving side of `sink` is dropped the run stops, including
    /// the upstream call that is in flight at the time.
    pub async fn run(
        self,
        generator: &dyn ImageGenerator,
        sink: mpsc::Sender<SceneOutcome>,
    ) -> PipelineReport {
        let total = self.total();
        let mut report = PipelineReport::default();

        for task in self.tasks {
            debug!("Scene {} of {}: {}", task.index + 1, total, task.prompt);
            let call = generator.generate_image(&task.prompt, self.model.as_deref(), None);
            let result = tokio::select! {
                result = call => result,
                () = sink.closed() => {
                    info!("Client went away during scene {} of {}, stopping", task.index + 1, total);
                    report.aborted = true;
                    break;
                }
            };

            let outcome = match result {
                Ok(image) => {
                    report.succeeded += 1;
                    SceneOutcome::ok(task.index, total, image.url)
                }
                Err(err) => {
                    warn!("Scene {} of {} failed: {}", task.index + 1, total, err);
                    SceneOutcome::error(task.index, total, err.to_string())
                }
            };

            if sink.send(outcome).await.is_err() {
                info!("Client went away after scene {} of {}, stopping", task.index + 1, total);
                report.aborted = true;
                break;
            }
            report.emitted += 1;
        }

        report
    }

    /// Runs the pipeline on its own task, returning the outcome stream.
    pub fn spawn(
        self,
        generator: Arc<dyn ImageGenerator>,
    ) -> (mpsc::Receiver<SceneOutcome>, JoinHandle<PipelineReport>) {
        let (tx, rx) = mpsc::channel(SCENE_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let total = self.total();
            let report = self.run(generator.as_ref(), tx).await;
            info!(
                "Scene run finished: {}/{} delivered, {} succeeded, aborted={}",
                report.emitted, total, report.succeeded, report.aborted
            );
            report
        });
        (rx, handle)
    }
}

/// Scripted stand-in for the upstream, numbering calls from 0.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FakeGenerator {
    pub(crate) failing_calls: Vec<usize>,
    pub(crate) hang_on_call: Option<usize>,
    pub(crate) unconfigured: bool,
    pub(crate) prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeGenerator {
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ImageGenerator for FakeGenerator {
    fn ensure_configured(&self) -> Result<(), crate::upstream::UpstreamError> {
        if self.unconfigured {
            Err(crate::upstream::UpstreamError::NotConfigured)
        } else {
            Ok(())
        }
    }

    async fn generate_image(
        &self,
        prompt: &str,
        model: Option<&str>,
        _size: Option<&str>,
    ) -> Result<crate::upstream::ImageRef, crate::upstream::UpstreamError> {
        self.ensure_configured()?;
        let call = {
            let mut prompts = self.prompts.lock().expect("prompts lock");
            prompts.push(prompt.to_string());
            prompts.len() - 1
        };
        if self.hang_on_call == Some(call) {
            std::future::pending::<()>().await;
        }
        if self.failing_calls.contains(&call) {
            return Err(crate::upstream::UpstreamError::Upstream {
                status: 500,
                body: r#"{"error":{"message":"boom"}}"#.to_string(),
            });
        }
        Ok(crate::upstream::ImageRef {
            url: format!(
                "https://img.test/{call}.png?model={}",
                model.unwrap_or("default")
            ),
        })
    }
}
