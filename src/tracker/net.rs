use tracing::debug;

use crate::config::{NetLockMode, TrackerConfig};
use crate::geometry::NormRect;

/// Net box estimate for one tracking session.
///
/// Observations are only considered during the first `max_frames` frames. Once
/// confirmed the box never changes until `reset`.
pub struct NetBoxEstimator {
    mode: NetLockMode,
    max_frames: u32,
    average_frames: u32,
    frames_seen: u32,
    sum: [f32; 4],
    observations: u32,
    latest: Option<NormRect>,
    confirmed: Option<NormRect>,
}

impl NetBoxEstimator {
    pub fn new(mode: NetLockMode, max_frames: u32, average_frames: u32) -> Self {
        Self {
            mode,
            max_frames,
            average_frames: average_frames.max(1),
            frames_seen: 0,
            sum: [0.0; 4],
            observations: 0,
            latest: None,
            confirmed: None,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.net_lock, config.net_detection_max_frames, config.net_average_frames)
    }

    /// Called once per frame with that frame's accepted net box, if any.
    pub fn observe(&mut self, net: Option<NormRect>) {
        if self.confirmed.is_some() {
            return;
        }
        self.frames_seen = self.frames_seen.saturating_add(1);
        let in_window = self.frames_seen <= self.max_frames;

        if in_window {
            if let Some(rect) = net {
                self.latest = Some(rect);
                self.sum[0] += rect.min_x();
                self.sum[1] += rect.min_y();
                self.sum[2] += rect.max_x();
                self.sum[3] += rect.max_y();
                self.observations += 1;

                let ready = match self.mode {
                    NetLockMode::First => true,
                    NetLockMode::Average => self.observations >= self.average_frames,
                };
                if ready {
                    self.confirm();
                }
            }
        }

        // 検出ウィンドウ終了時、平均モードでは集まった分で確定
        if self.frames_seen >= self.max_frames && self.confirmed.is_none() && self.observations > 0 {
            self.confirm();
        }
    }

    fn confirm(&mut self) {
        let rect = match self.mode {
            NetLockMode::First => self.latest,
            NetLockMode::Average => self.average(),
        };
        if let Some(rect) = rect {
            debug!(
                min_x = rect.min_x(),
                min_y = rect.min_y(),
                max_x = rect.max_x(),
                max_y = rect.max_y(),
                observations = self.observations,
                "net box confirmed"
            );
            self.confirmed = Some(rect);
        }
    }

    fn average(&self) -> Option<NormRect> {
        if self.observations == 0 {
            return None;
        }
        let n = self.observations as f32;
        Some(NormRect::from_edges(
            self.sum[0] / n,
            self.sum[1] / n,
            self.sum[2] / n,
            self.sum[3] / n,
        ))
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }

    /// Confirmed box, or the provisional running average while still collecting.
    pub fn net_box(&self) -> Option<NormRect> {
        self.confirmed.or_else(|| self.average())
    }

    pub fn reset(&mut self) {
        self.frames_seen = 0;
        self.sum = [0.0; 4];
        self.observations = 0;
        self.latest = None;
        self.confirmed = None;
    }
}
