//! Wiring of dispatcher, session actor and companion delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::angle::AngleTrigger;
use crate::companion::{CompanionHandle, FeedbackMessage};
use crate::config::Config;
use crate::detection::DetectedObject;
use crate::dispatch::FrameDispatcher;
use crate::frame::RecentFrames;
use crate::pose::PoseKeypointSet;
use crate::recognition::{LabelScore, Models, RecognitionResult};
use crate::session::{Effects, SessionEvent, SessionRecord, SessionState};

/// Inbound traffic of the session actor. Recognition completions carry the
/// session generation they were requested under.
pub(crate) enum PipelineEvent {
    Pose {
        generation: u64,
        frame_index: u64,
        result: RecognitionResult<PoseKeypointSet>,
    },
    Objects {
        generation: u64,
        frame_index: u64,
        timestamp: f64,
        result: RecognitionResult<Vec<DetectedObject>>,
    },
    Swing {
        generation: u64,
        frame_index: u64,
        result: RecognitionResult<Vec<LabelScore>>,
    },
    Angle {
        generation: u64,
        trigger: AngleTrigger,
        result: RecognitionResult<Vec<LabelScore>>,
    },
    VideoReference(String),
    Reset,
    Stop(oneshot::Sender<SessionRecord>),
}

pub struct Pipeline {
    dispatcher: FrameDispatcher,
    events: mpsc::UnboundedSender<PipelineEvent>,
    task: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn the session actor on the current tokio runtime. Session events are
    /// published on the returned receiver.
    pub fn start(
        config: &Config,
        models: Models,
        companion: CompanionHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let runtime = Handle::try_current().context("pipeline must start inside a tokio runtime")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let recent = RecentFrames::new(config.dispatch.recent_frames);

        let dispatcher = FrameDispatcher::new(
            runtime.clone(),
            models.clone(),
            tx.clone(),
            generation.clone(),
            recent.clone(),
            config.dispatch.frame_skip,
        );
        let actor = SessionActor {
            state: SessionState::new(config),
            models,
            recent,
            companion,
            generation,
            inbox: tx.clone(),
            out: out_tx,
        };
        let task = runtime.spawn(actor.run(rx));
        info!(frame_skip = config.dispatch.frame_skip, "pipeline started");
        Ok((
            Self {
                dispatcher,
                events: tx,
                task,
            },
            out_rx,
        ))
    }

    /// Handle for the capture thread.
    pub fn dispatcher(&self) -> FrameDispatcher {
        self.dispatcher.clone()
    }

    /// Begin a new session. In-flight results of the old one are discarded.
    pub fn reset(&self) {
        let _ = self.events.send(PipelineEvent::Reset);
    }

    pub fn set_video_reference(&self, reference: impl Into<String>) {
        let _ = self.events.send(PipelineEvent::VideoReference(reference.into()));
    }

    /// Stop accepting frames, finalize the session and announce its end to the
    /// companion.
    pub async fn stop(self) -> Result<SessionRecord> {
        self.dispatcher.stop();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(PipelineEvent::Stop(reply_tx))
            .map_err(|_| anyhow!("session actor already stopped"))?;
        let record = reply_rx.await.context("session actor dropped the stop request")?;
        self.task.await.context("session actor panicked")?;
        Ok(record)
    }
}

struct SessionActor {
    state: SessionState,
    models: Models,
    recent: RecentFrames,
    companion: CompanionHandle,
    generation: Arc<AtomicU64>,
    inbox: mpsc::UnboundedSender<PipelineEvent>,
    out: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
        while let Some(event) = rx.recv().await {
            let effects = match event {
                PipelineEvent::Pose {
                    generation,
                    frame_index,
                    result,
                } => {
                    if self.is_stale(generation, "pose") {
                        continue;
                    }
                    self.state.on_pose(frame_index, result)
                }
                PipelineEvent::Objects {
                    generation,
                    frame_index,
                    timestamp,
                    result,
                } => {
                    if self.is_stale(generation, "objects") {
                        continue;
                    }
                    self.state.on_detections(frame_index, timestamp, result)
                }
                PipelineEvent::Swing {
                    generation,
                    frame_index,
                    result,
                } => {
                    if self.is_stale(generation, "swing") {
                        continue;
                    }
                    self.state.on_swing(frame_index, result)
                }
                PipelineEvent::Angle {
                    generation,
                    trigger,
                    result,
                } => {
                    if self.is_stale(generation, "angle") {
                        continue;
                    }
                    self.state.on_angle(trigger, result)
                }
                PipelineEvent::VideoReference(reference) => {
                    self.state.set_video_reference(reference);
                    continue;
                }
                PipelineEvent::Reset => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.state.reset();
                    self.recent.clear();
                    info!(generation, "session reset");
                    continue;
                }
                PipelineEvent::Stop(reply) => {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    let record = self.state.finish();
                    info!(
                        total = record.total_attempts,
                        success = record.successful_shots,
                        failed = record.failed_shots,
                        "session finished"
                    );
                    self.companion.send(FeedbackMessage::session_ended());
                    let _ = reply.send(record);
                    break;
                }
            };
            self.apply(effects);
        }
    }

    fn is_stale(&self, generation: u64, source: &'static str) -> bool {
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            debug!(source, generation, current, "stale result dropped");
            return true;
        }
        false
    }

    fn apply(&mut self, effects: Effects) {
        let generation = self.generation.load(Ordering::SeqCst);

        for message in effects.messages {
            self.companion.send(message);
        }

        if let Some(window) = effects.swing_request {
            let frame_index = window.last().map(|p| p.frame_index).unwrap_or_default();
            let model = self.models.swing.clone();
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                let result = model.classify(window).await;
                let _ = inbox.send(PipelineEvent::Swing {
                    generation,
                    frame_index,
                    result,
                });
            });
        }

        if let Some(trigger) = effects.angle_request {
            match self.recent.get(trigger.frame_index) {
                Some(frame) => {
                    let model = self.models.angle.clone();
                    let inbox = self.inbox.clone();
                    tokio::spawn(async move {
                        let result = model.classify(frame).await;
                        let _ = inbox.send(PipelineEvent::Angle {
                            generation,
                            trigger,
                            result,
                        });
                    });
                }
                None => debug!(frame_index = trigger.frame_index, "frame evicted before angle analysis"),
            }
        }

        for event in effects.events {
            let _ = self.out.send(event);
        }
    }
}
