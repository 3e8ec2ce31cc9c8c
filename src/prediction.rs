//! Decoding of inbound prediction messages.
//!
//! The inference service answers every frame with one UTF-8 JSON object:
//!
//! ```text
//! { "error": "No dog detected in the image." }
//! { "prediction": "happy",
//!   "probabilities": [0.1, 0.05, 0.8, 0.05],
//!   "class_indices": { "0": "sad", "1": "angry", "2": "happy", "3": "relaxed" } }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::StreamError;

/// A successful classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// Scores, index-aligned with `class_indices`.
    pub probabilities: Vec<f64>,
    pub class_indices: BTreeMap<u32, String>,
}

impl Prediction {
    pub fn class_name(&self, index: u32) -> Option<&str> {
        self.class_indices.get(&index).map(String::as_str)
    }

    pub fn probability(&self, index: u32) -> Option<f64> {
        self.probabilities.get(index as usize).copied()
    }

    /// `(index, class name, probability)` in index order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &str, f64)> + '_ {
        self.class_indices
            .iter()
            .filter_map(|(&idx, name)| Some((idx, name.as_str(), self.probability(idx)?)))
    }

    /// Highest-scoring class, if any class is listed.
    pub fn top(&self) -> Option<(&str, f64)> {
        self.entries()
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(_, name, p)| (name, p))
    }
}

/// One decoded server response: either a classification or the server's
/// reason for not producing one.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionResult {
    Classified(Prediction),
    Rejected { error: String },
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prediction: Option<String>,
    #[serde(default)]
    probabilities: Option<Vec<f64>>,
    #[serde(default)]
    class_indices: Option<ClassIndices>,
}

/// `class_indices` object. A repeated index is malformed rather than
/// last-one-wins.
struct ClassIndices(BTreeMap<u32, String>);

impl<'de> Deserialize<'de> for ClassIndices {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UniqueIndices;

        impl<'de> Visitor<'de> for UniqueIndices {
            type Value = ClassIndices;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping class index to class name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ClassIndices, A::Error> {
                let mut indices = BTreeMap::new();
                while let Some((index, name)) = access.next_entry::<u32, String>()? {
                    if indices.insert(index, name).is_some() {
                        return Err(de::Error::custom(format_args!(
                            "duplicate class index {index}"
                        )));
                    }
                }
                Ok(ClassIndices(indices))
            }
        }

        deserializer.deserialize_map(UniqueIndices)
    }
}

impl PredictionResult {
    /// Parse one inbound text frame.
    ///
    /// A non-empty `error` takes precedence over any prediction fields.
    pub fn decode(text: &str) -> Result<Self, StreamError> {
        let wire: WireResult = serde_json::from_str(text)?;

        if let Some(error) = wire.error.filter(|e| !e.is_empty()) {
            return Ok(PredictionResult::Rejected { error });
        }

        let label = wire.prediction.ok_or(StreamError::MissingField("prediction"))?;
        let probabilities = wire
            .probabilities
            .ok_or(StreamError::MissingField("probabilities"))?;
        let ClassIndices(class_indices) = wire
            .class_indices
            .ok_or(StreamError::MissingField("class_indices"))?;

        if let Some(&index) = class_indices
            .keys()
            .find(|&&idx| idx as usize >= probabilities.len())
        {
            return Err(StreamError::InconsistentIndices {
                index,
                len: probabilities.len(),
            });
        }

        Ok(PredictionResult::Classified(Prediction {
            label,
            probabilities,
            class_indices,
        }))
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            PredictionResult::Classified(p) => Some(p),
            PredictionResult::Rejected { .. } => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.prediction().map(|p| p.label.as_str())
    }

    pub fn probabilities(&self) -> Option<&[f64]> {
        self.prediction().map(|p| p.probabilities.as_slice())
    }

    pub fn class_indices(&self) -> Option<&BTreeMap<u32, String>> {
        self.prediction().map(|p| &p.class_indices)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            PredictionResult::Rejected { error } => Some(error),
            PredictionResult::Classified(_) => None,
        }
    }
}
