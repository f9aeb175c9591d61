//! ONNX Runtime backends: MoveNet pose, YOLO-style ball/net/racquet detector
//! and plain label classifiers for swing phase and racquet face.
//!
//! Sessions are not reentrant, so each model serializes its runs behind a mutex
//! and inference happens on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use ndarray::{Array3, Array4, ArrayD, ArrayViewD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use crate::config::ModelsConfig;
use crate::detection::{DetectedObject, ObjectLabel};
use crate::error::RecognitionError;
use crate::frame::Frame;
use crate::geometry::NormRect;
use crate::pose::{Keypoint, KeypointIndex, PoseKeypointSet};

use super::{AngleModel, LabelScore, Models, ObjectModel, PoseEstimator, RecognitionResult, SwingModel};

/// MoveNet用の入力サイズ
pub const MOVENET_INPUT_SIZE: usize = 192;

const POSE: &str = "pose";
const OBJECTS: &str = "objects";
const SWING: &str = "swing";
const ANGLE: &str = "angle";

/// 検出候補の最低スコア (ラベル別の閾値はフィルタ側)
const CANDIDATE_MIN_SCORE: f32 = 0.25;
const NMS_IOU: f32 = 0.5;

struct OnnxModel {
    session: Mutex<Session>,
    input: String,
    output: String,
}

impl OnnxModel {
    fn load(path: &Path, input: &str, output: &str) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model {}", path.display()))?;
        info!(model = %path.display(), "ONNX model loaded");
        Ok(Self {
            session: Mutex::new(session),
            input: input.to_string(),
            output: output.to_string(),
        })
    }

    fn run(&self, input: Tensor<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("session mutex poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input.as_str() => input])
            .context("inference failed")?;
        let output: ArrayViewD<f32> = outputs[self.output.as_str()]
            .try_extract_array()
            .context("failed to extract output tensor")?;
        Ok(output.to_owned())
    }
}

async fn blocking<T, F>(model: &'static str, f: F) -> RecognitionResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RecognitionResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| RecognitionError::Cancelled { model })?
}

/// Nearest-neighbour RGB sample of `frame` scaled to `size`x`size`.
fn sampler(frame: &Frame, size: usize) -> Result<impl Fn(usize, usize) -> [u8; 3] + '_> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w == 0 || h == 0 || frame.data.len() < w * h * 3 {
        bail!("frame {} has no RGB pixel data ({}x{}, {} bytes)", frame.index, w, h, frame.data.len());
    }
    Ok(move |x: usize, y: usize| {
        let sx = (x * w / size).min(w - 1);
        let sy = (y * h / size).min(h - 1);
        let i = (sy * w + sx) * 3;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    })
}

/// [1, size, size, 3] in 0.0-255.0
pub fn nhwc_input(frame: &Frame, size: usize) -> Result<Array4<f32>> {
    let sample = sampler(frame, size)?;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for y in 0..size {
        for x in 0..size {
            let px = sample(x, y);
            for c in 0..3 {
                tensor[[0, y, x, c]] = px[c] as f32;
            }
        }
    }
    Ok(tensor)
}

/// [1, 3, size, size] normalized to 0.0-1.0
pub fn nchw_input(frame: &Frame, size: usize) -> Result<Array4<f32>> {
    let sample = sampler(frame, size)?;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let px = sample(x, y);
            for c in 0..3 {
                tensor[[0, c, y, x]] = px[c] as f32 / 255.0;
            }
        }
    }
    Ok(tensor)
}

/// MoveNet の出力は [1, 1, 17, 3] (y, x, confidence)
pub fn decode_movenet(output: ArrayViewD<f32>, frame_index: u64) -> Result<PoseKeypointSet> {
    if output.shape() != [1, 1, KeypointIndex::COUNT, 3] {
        bail!("unexpected MoveNet output shape {:?}", output.shape());
    }
    let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
    for (i, kp) in keypoints.iter_mut().enumerate() {
        let y = output[[0, 0, i, 0]];
        let x = output[[0, 0, i, 1]];
        let confidence = output[[0, 0, i, 2]];
        *kp = Keypoint::new(x, y, confidence);
    }
    Ok(PoseKeypointSet::new(frame_index, keypoints))
}

fn iou(a: &NormRect, b: &NormRect) -> f32 {
    let ix = (a.max_x().min(b.max_x()) - a.min_x().max(b.min_x())).max(0.0);
    let iy = (a.max_y().min(b.max_y()) - a.min_y().max(b.min_y())).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Decode a `[1, 4 + classes, N]` detector output with boxes as
/// `(cx, cy, w, h)` in input pixels. Classes mapping to `None` are ignored.
/// Overlapping boxes of the same label are suppressed.
pub fn decode_detections(
    output: ArrayViewD<f32>,
    classes: &[Option<ObjectLabel>],
    input_size: usize,
) -> Result<Vec<DetectedObject>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] != 4 + classes.len() {
        bail!(
            "unexpected detector output shape {:?} for {} classes",
            shape,
            classes.len()
        );
    }
    let n = shape[2];
    let scale = input_size as f32;

    let mut candidates = Vec::new();
    for i in 0..n {
        let best = (0..classes.len())
            .map(|c| (c, output[[0, 4 + c, i]]))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let Some((class, score)) = best else { continue };
        let Some(label) = classes[class] else { continue };
        if score < CANDIDATE_MIN_SCORE {
            continue;
        }
        let cx = output[[0, 0, i]] / scale;
        let cy = output[[0, 1, i]] / scale;
        let w = output[[0, 2, i]] / scale;
        let h = output[[0, 3, i]] / scale;
        let bbox = NormRect::from_edges(
            (cx - w / 2.0).clamp(0.0, 1.0),
            (cy - h / 2.0).clamp(0.0, 1.0),
            (cx + w / 2.0).clamp(0.0, 1.0),
            (cy + h / 2.0).clamp(0.0, 1.0),
        );
        candidates.push(DetectedObject::new(label, score, bbox));
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectedObject> = Vec::new();
    for det in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.label == det.label && iou(&k.bbox, &det.bbox) > NMS_IOU);
        if !overlaps {
            kept.push(det);
        }
    }
    Ok(kept)
}

/// Pair a flat score vector with its labels.
pub fn decode_scores(output: ArrayViewD<f32>, labels: &[String]) -> Result<Vec<LabelScore>> {
    if output.len() != labels.len() {
        bail!("classifier produced {} scores for {} labels", output.len(), labels.len());
    }
    Ok(labels
        .iter()
        .zip(output.iter())
        .map(|(label, &score)| LabelScore::new(label.clone(), score))
        .collect())
}

/// [1, T, 51] swing model input, oldest sample first.
pub fn swing_input(window: &[PoseKeypointSet]) -> Array3<f32> {
    let features = KeypointIndex::COUNT * 3;
    let mut tensor = Array3::<f32>::zeros((1, window.len(), features));
    for (t, pose) in window.iter().enumerate() {
        for (f, value) in pose.to_features().iter().enumerate() {
            tensor[[0, t, f]] = *value;
        }
    }
    tensor
}

/// MoveNet を使用した姿勢推定
pub struct MoveNetPose {
    model: Arc<OnnxModel>,
}

impl MoveNetPose {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model = OnnxModel::load(
            model_path.as_ref(),
            "serving_default_input_0",
            "StatefulPartitionedCall_0",
        )?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

impl PoseEstimator for MoveNetPose {
    fn estimate(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<PoseKeypointSet>> {
        let model = self.model.clone();
        blocking(POSE, move || {
            let input = nhwc_input(&frame, MOVENET_INPUT_SIZE).map_err(|e| RecognitionError::inference(POSE, e))?;
            let tensor = Tensor::from_array(input).map_err(|e| RecognitionError::inference(POSE, e))?;
            let output = model.run(tensor).map_err(|e| RecognitionError::inference(POSE, e))?;
            decode_movenet(output.view(), frame.index).map_err(|e| RecognitionError::output(POSE, format!("{e:#}")))
        })
        .boxed()
    }
}

/// YOLO系の物体検出器 (ball / net / racquet)
pub struct YoloObjects {
    model: Arc<OnnxModel>,
    classes: Arc<Vec<Option<ObjectLabel>>>,
    input_size: usize,
}

impl YoloObjects {
    pub fn new<P: AsRef<Path>>(model_path: P, labels: &[String], input_size: usize) -> Result<Self> {
        let model = OnnxModel::load(model_path.as_ref(), "images", "output0")?;
        let classes = labels.iter().map(|l| ObjectLabel::from_label(l)).collect();
        Ok(Self {
            model: Arc::new(model),
            classes: Arc::new(classes),
            input_size,
        })
    }
}

impl ObjectModel for YoloObjects {
    fn detect(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<DetectedObject>>> {
        let model = self.model.clone();
        let classes = self.classes.clone();
        let size = self.input_size;
        blocking(OBJECTS, move || {
            let input = nchw_input(&frame, size).map_err(|e| RecognitionError::inference(OBJECTS, e))?;
            let tensor = Tensor::from_array(input).map_err(|e| RecognitionError::inference(OBJECTS, e))?;
            let output = model.run(tensor).map_err(|e| RecognitionError::inference(OBJECTS, e))?;
            decode_detections(output.view(), &classes, size)
                .map_err(|e| RecognitionError::output(OBJECTS, format!("{e:#}")))
        })
        .boxed()
    }
}

/// Single-input, single-output classifier producing one score per label.
pub struct LabelClassifier {
    name: &'static str,
    model: Arc<OnnxModel>,
    labels: Arc<Vec<String>>,
    input_size: usize,
}

impl LabelClassifier {
    fn new(name: &'static str, model_path: &Path, labels: &[String], input_size: usize) -> Result<Self> {
        let model = OnnxModel::load(model_path, "input", "output")?;
        Ok(Self {
            name,
            model: Arc::new(model),
            labels: Arc::new(labels.to_vec()),
            input_size,
        })
    }

    /// Racquet-face classifier over a `[1, 3, S, S]` image.
    pub fn angle<P: AsRef<Path>>(model_path: P, labels: &[String], input_size: usize) -> Result<Self> {
        Self::new(ANGLE, model_path.as_ref(), labels, input_size)
    }

    /// Swing-phase classifier over a `[1, T, 51]` pose window.
    pub fn swing<P: AsRef<Path>>(model_path: P, labels: &[String]) -> Result<Self> {
        Self::new(SWING, model_path.as_ref(), labels, 0)
    }

    fn classify_tensor(&self, build: impl FnOnce() -> Result<Tensor<f32>> + Send + 'static)
        -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>>
    {
        let name = self.name;
        let model = self.model.clone();
        let labels = self.labels.clone();
        blocking(name, move || {
            let tensor = build().map_err(|e| RecognitionError::inference(name, e))?;
            let output = model.run(tensor).map_err(|e| RecognitionError::inference(name, e))?;
            decode_scores(output.view(), &labels).map_err(|e| RecognitionError::output(name, format!("{e:#}")))
        })
        .boxed()
    }
}

impl AngleModel for LabelClassifier {
    fn classify(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>> {
        let size = self.input_size;
        self.classify_tensor(move || Ok(Tensor::from_array(nchw_input(&frame, size)?)?))
    }
}

impl SwingModel for LabelClassifier {
    fn classify(&self, window: Vec<PoseKeypointSet>) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>> {
        self.classify_tensor(move || Ok(Tensor::from_array(swing_input(&window))?))
    }
}

/// Load all four backends. Every model path must be configured.
pub fn load_models(config: &ModelsConfig) -> Result<Models> {
    let required = |path: &Option<std::path::PathBuf>, name: &str| {
        path.clone()
            .with_context(|| format!("models.{name} is not configured"))
    };
    let pose = MoveNetPose::new(required(&config.pose, "pose")?)?;
    let objects = YoloObjects::new(
        required(&config.objects, "objects")?,
        &config.object_labels,
        config.object_input_size,
    )?;
    let angle = LabelClassifier::angle(
        required(&config.angle, "angle")?,
        &config.angle_labels,
        config.angle_input_size,
    )?;
    let swing = LabelClassifier::swing(required(&config.swing, "swing")?, &config.swing_labels)?;
    Ok(Models {
        pose: Arc::new(pose),
        swing: Arc::new(swing),
        objects: Arc::new(objects),
        angle: Arc::new(angle),
    })
}
