pub mod filter;

pub use filter::{FilteredDetections, ObjectFilter};

use serde::{Deserialize, Serialize};

use crate::geometry::NormRect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectLabel {
    Ball,
    Net,
    Racquet,
}

impl ObjectLabel {
    /// Model label string to class. Accepts the common spellings.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "ball" | "tennis_ball" | "tennis ball" => Some(Self::Ball),
            "net" => Some(Self::Net),
            "racquet" | "racket" => Some(Self::Racquet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectLabel::Ball => "ball",
            ObjectLabel::Net => "net",
            ObjectLabel::Racquet => "racquet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: ObjectLabel,
    pub confidence: f32,
    pub bbox: NormRect,
}

impl DetectedObject {
    pub fn new(label: ObjectLabel, confidence: f32, bbox: NormRect) -> Self {
        Self {
            label,
            confidence,
            bbox,
        }
    }
}
