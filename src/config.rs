use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub swing: SwingConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub angle: AngleConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub companion: CompanionConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Process every n-th captured frame (1 = every frame)
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    /// Number of recent frames kept for on-demand classification
    #[serde(default = "default_recent_frames")]
    pub recent_frames: usize,
}

fn default_frame_skip() -> u64 { 1 }
fn default_recent_frames() -> usize { 8 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            recent_frames: default_recent_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SwingConfig {
    /// スイング分類に渡すポーズサンプル数
    #[serde(default = "default_window_len")]
    pub window_len: usize,
    #[serde(default = "default_impact_label")]
    pub impact_label: String,
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f32,
}

fn default_window_len() -> usize { 30 }
fn default_impact_label() -> String { "impact".to_string() }
fn default_impact_threshold() -> f32 { 0.1 }

impl Default for SwingConfig {
    fn default() -> Self {
        Self {
            window_len: default_window_len(),
            impact_label: default_impact_label(),
            impact_threshold: default_impact_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_label_threshold")]
    pub ball_threshold: f32,
    #[serde(default = "default_label_threshold")]
    pub net_threshold: f32,
    #[serde(default = "default_label_threshold")]
    pub racquet_threshold: f32,
    /// Smoothing factor of the running ball-area EMA
    #[serde(default = "default_size_ema_alpha")]
    pub size_ema_alpha: f32,
    #[serde(default = "default_size_min_ratio")]
    pub size_min_ratio: f32,
    #[serde(default = "default_size_max_ratio")]
    pub size_max_ratio: f32,
    /// Consecutive size rejections after which the EMA is re-seeded
    #[serde(default = "default_size_reset_after")]
    pub size_reset_after: u32,
}

fn default_label_threshold() -> f32 { 0.5 }
fn default_size_ema_alpha() -> f32 { 0.1 }
fn default_size_min_ratio() -> f32 { 0.5 }
fn default_size_max_ratio() -> f32 { 2.0 }
fn default_size_reset_after() -> u32 { 15 }

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ball_threshold: default_label_threshold(),
            net_threshold: default_label_threshold(),
            racquet_threshold: default_label_threshold(),
            size_ema_alpha: default_size_ema_alpha(),
            size_min_ratio: default_size_min_ratio(),
            size_max_ratio: default_size_max_ratio(),
            size_reset_after: default_size_reset_after(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetLockMode {
    /// 最初の検出で確定
    First,
    /// 複数フレームの平均で確定
    Average,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_trajectory_len")]
    pub trajectory_len: usize,
    #[serde(default = "default_velocity_window")]
    pub velocity_window: usize,
    #[serde(default = "default_velocity_alpha")]
    pub velocity_alpha: f32,
    #[serde(default = "default_approach_distance")]
    pub approach_distance: f32,
    #[serde(default = "default_crossing_distance")]
    pub crossing_distance: f32,
    #[serde(default = "default_crossed_distance")]
    pub crossed_distance: f32,
    #[serde(default = "default_lost_timeout_secs")]
    pub lost_timeout_secs: f64,
    #[serde(default = "default_net_detection_max_frames")]
    pub net_detection_max_frames: u32,
    #[serde(default = "default_net_lock")]
    pub net_lock: NetLockMode,
    #[serde(default = "default_net_average_frames")]
    pub net_average_frames: u32,
}

fn default_trajectory_len() -> usize { 10 }
fn default_velocity_window() -> usize { 5 }
fn default_velocity_alpha() -> f32 { 0.5 }
fn default_approach_distance() -> f32 { 0.15 }
fn default_crossing_distance() -> f32 { 0.05 }
fn default_crossed_distance() -> f32 { 0.1 }
fn default_lost_timeout_secs() -> f64 { 1.0 }
fn default_net_detection_max_frames() -> u32 { 10 }
fn default_net_lock() -> NetLockMode { NetLockMode::First }
fn default_net_average_frames() -> u32 { 5 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            trajectory_len: default_trajectory_len(),
            velocity_window: default_velocity_window(),
            velocity_alpha: default_velocity_alpha(),
            approach_distance: default_approach_distance(),
            crossing_distance: default_crossing_distance(),
            crossed_distance: default_crossed_distance(),
            lost_timeout_secs: default_lost_timeout_secs(),
            net_detection_max_frames: default_net_detection_max_frames(),
            net_lock: default_net_lock(),
            net_average_frames: default_net_average_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Frames during which further crossing results are ignored
    #[serde(default = "default_cooldown_frames")]
    pub cooldown_frames: u64,
}

fn default_cooldown_frames() -> u64 { 10 }

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            cooldown_frames: default_cooldown_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AngleConfig {
    #[serde(default = "default_proximity_threshold")]
    pub proximity_threshold: f32,
    #[serde(default = "default_angle_cooldown_secs")]
    pub cooldown_secs: f64,
}

fn default_proximity_threshold() -> f32 { 0.22 }
fn default_angle_cooldown_secs() -> f64 { 0.1 }

impl Default for AngleConfig {
    fn default() -> Self {
        Self {
            proximity_threshold: default_proximity_threshold(),
            cooldown_secs: default_angle_cooldown_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_absent_frames")]
    pub absent_frames: u32,
}

fn default_presence_min_confidence() -> f32 { 0.3 }
fn default_absent_frames() -> u32 { 30 }

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_presence_min_confidence(),
            absent_frames: default_absent_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompanionConfig {
    /// ウェアラブル側ブリッジのアドレス
    #[serde(default = "default_companion_addr")]
    pub addr: String,
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: f64,
}

fn default_companion_addr() -> String { "127.0.0.1:47800".to_string() }
fn default_throttle_secs() -> f64 { 0.5 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay_secs() -> f64 { 2.0 }
fn default_poll_interval_secs() -> f64 { 1.0 }
fn default_ack_timeout_secs() -> f64 { 1.0 }

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            addr: default_companion_addr(),
            throttle_secs: default_throttle_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl CompanionConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_secs_f64(self.throttle_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ack_timeout_secs)
    }
}

/// ONNX model files, used with the `onnx` feature.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default)]
    pub pose: Option<PathBuf>,
    #[serde(default)]
    pub objects: Option<PathBuf>,
    /// Class order of the detector output
    #[serde(default = "default_object_labels")]
    pub object_labels: Vec<String>,
    #[serde(default = "default_object_input_size")]
    pub object_input_size: usize,
    #[serde(default)]
    pub angle: Option<PathBuf>,
    #[serde(default = "default_angle_labels")]
    pub angle_labels: Vec<String>,
    #[serde(default = "default_angle_input_size")]
    pub angle_input_size: usize,
    #[serde(default)]
    pub swing: Option<PathBuf>,
    #[serde(default = "default_swing_labels")]
    pub swing_labels: Vec<String>,
}

fn default_object_labels() -> Vec<String> { vec!["ball".into(), "net".into(), "racquet".into()] }
fn default_object_input_size() -> usize { 640 }
fn default_angle_labels() -> Vec<String> { vec!["open".into(), "flat".into(), "closed".into()] }
fn default_angle_input_size() -> usize { 224 }
fn default_swing_labels() -> Vec<String> {
    vec!["idle".into(), "backswing".into(), "impact".into(), "follow_through".into()]
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            pose: None,
            objects: None,
            object_labels: default_object_labels(),
            object_input_size: default_object_input_size(),
            angle: None,
            angle_labels: default_angle_labels(),
            angle_input_size: default_angle_input_size(),
            swing: None,
            swing_labels: default_swing_labels(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 読み込みに失敗した場合はデフォルト値
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err:#}; using default configuration");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.frame_skip == 0 {
            bail!("dispatch.frame_skip must be at least 1");
        }
        if self.dispatch.recent_frames == 0 {
            bail!("dispatch.recent_frames must be at least 1");
        }
        if self.swing.window_len == 0 {
            bail!("swing.window_len must be at least 1");
        }
        if self.tracker.trajectory_len < 2 {
            bail!("tracker.trajectory_len must be at least 2");
        }
        if self.tracker.velocity_window == 0 {
            bail!("tracker.velocity_window must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.tracker.velocity_alpha) {
            bail!("tracker.velocity_alpha must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.detection.size_ema_alpha) {
            bail!("detection.size_ema_alpha must be within 0.0..=1.0");
        }
        if self.detection.size_min_ratio <= 0.0
            || self.detection.size_min_ratio > self.detection.size_max_ratio
        {
            bail!("detection size ratios must satisfy 0 < size_min_ratio <= size_max_ratio");
        }
        if self.companion.max_attempts == 0 {
            bail!("companion.max_attempts must be at least 1");
        }
        if self.companion.throttle_secs < 0.0
            || self.companion.retry_delay_secs < 0.0
            || self.companion.poll_interval_secs <= 0.0
            || self.companion.ack_timeout_secs <= 0.0
        {
            bail!("companion durations must be positive");
        }
        if self.models.object_input_size == 0 || self.models.angle_input_size == 0 {
            bail!("model input sizes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.dispatch.frame_skip, 1);
        assert_eq!(config.swing.window_len, 30);
        assert_eq!(config.swing.impact_threshold, 0.1);
        assert_eq!(config.detection.ball_threshold, 0.5);
        assert_eq!(config.detection.size_ema_alpha, 0.1);
        assert_eq!(config.tracker.trajectory_len, 10);
        assert_eq!(config.tracker.velocity_window, 5);
        assert_eq!(config.tracker.net_detection_max_frames, 10);
        assert_eq!(config.tracker.net_lock, NetLockMode::First);
        assert_eq!(config.angle.proximity_threshold, 0.22);
        assert_eq!(config.companion.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [dispatch]
            frame_skip = 2

            [tracker]
            net_lock = "average"
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatch.frame_skip, 2);
        assert_eq!(config.dispatch.recent_frames, 8);
        assert_eq!(config.tracker.net_lock, NetLockMode::Average);
        assert_eq!(config.tracker.lost_timeout_secs, 1.0);
        assert_eq!(config.companion.throttle_secs, 0.5);
    }

    #[test]
    fn test_validate_rejects_zero_frame_skip() {
        let mut config = Config::default();
        config.dispatch.frame_skip = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_size_ratios() {
        let mut config = Config::default();
        config.detection.size_min_ratio = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("does/not/exist.toml");
        assert_eq!(config.scoring.cooldown_frames, 10);
    }
}
