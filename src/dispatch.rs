//! Fan-out of captured frames to the recognition models.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::frame::{Frame, RecentFrames};
use crate::pipeline::PipelineEvent;
use crate::recognition::Models;

/// Entry point for the capture thread. `submit` never blocks: each retained
/// frame spawns independent pose and object tasks whose completions are sent
/// to the session actor tagged with the session generation.
#[derive(Clone)]
pub struct FrameDispatcher {
    runtime: Handle,
    models: Models,
    events: mpsc::UnboundedSender<PipelineEvent>,
    generation: Arc<AtomicU64>,
    recent: RecentFrames,
    frame_skip: u64,
    received: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl FrameDispatcher {
    pub(crate) fn new(
        runtime: Handle,
        models: Models,
        events: mpsc::UnboundedSender<PipelineEvent>,
        generation: Arc<AtomicU64>,
        recent: RecentFrames,
        frame_skip: u64,
    ) -> Self {
        Self {
            runtime,
            models,
            events,
            generation,
            recent,
            frame_skip: frame_skip.max(1),
            received: Arc::new(AtomicU64::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns whether the frame was dispatched.
    pub fn submit(&self, frame: Frame) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let n = self.received.fetch_add(1, Ordering::SeqCst);
        if n % self.frame_skip != 0 {
            trace!(frame_index = frame.index, "frame skipped");
            return false;
        }
        self.recent.push(frame.clone());
        let generation = self.generation.load(Ordering::SeqCst);
        let frame_index = frame.index;
        let timestamp = frame.secs();

        let pose = self.models.pose.clone();
        let events = self.events.clone();
        let pose_frame = frame.clone();
        self.runtime.spawn(async move {
            let result = pose.estimate(pose_frame).await;
            let _ = events.send(PipelineEvent::Pose {
                generation,
                frame_index,
                result,
            });
        });

        let objects = self.models.objects.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let result = objects.detect(frame).await;
            let _ = events.send(PipelineEvent::Objects {
                generation,
                frame_index,
                timestamp,
                result,
            });
        });
        true
    }

    /// Most recently dispatched frame
    pub fn current_frame(&self) -> Option<Frame> {
        self.recent.current()
    }

    pub fn frames_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
