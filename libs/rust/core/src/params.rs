//! Participant identities and the opaque parameter payload moved between processes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FlError;

pub const AGGREGATOR_ID: &str = "aggregator";

/// Identity of a worker (`"1"`..`"N"`) or of the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn aggregator() -> Self { Self(AGGREGATOR_ID.into()) }
    pub fn worker(index: usize) -> Self { Self(index.to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_aggregator(&self) -> bool { self.0 == AGGREGATOR_ID }

    /// 1-based worker index, used as partition index.
    pub fn worker_index(&self) -> Result<usize, FlError> {
        match self.0.parse::<usize>() {
            Ok(i) if i >= 1 => Ok(i),
            _ => Err(FlError::InvalidIdentity(self.0.clone())),
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, FlError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(FlError::ShapeMismatch(format!("shape {shape:?} holds {expected} values, got {}", values.len())));
        }
        Ok(Self { shape, values })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, values: vec![0.0; n] }
    }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
}

/// Ordered, shape-tagged tensors. The control plane never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub tensors: Vec<Tensor>,
}

impl ModelParameters {
    pub fn new(tensors: Vec<Tensor>) -> Self { Self { tensors } }

    pub fn shapes(&self) -> Vec<&[usize]> { self.tensors.iter().map(|t| t.shape.as_slice()).collect() }

    pub fn same_layout(&self, other: &ModelParameters) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.tensors.iter().zip(&other.tensors).all(|(a, b)| a.shape == b.shape)
    }

    /// Every tensor holds exactly as many values as its shape describes.
    /// Deserialized payloads skip [`Tensor::new`], so wire input must pass this first.
    pub fn validate(&self) -> Result<(), FlError> {
        for (i, t) in self.tensors.iter().enumerate() {
            let expected: usize = t.shape.iter().product();
            if expected != t.values.len() {
                return Err(FlError::ShapeMismatch(format!("tensor {i}: shape {:?} holds {expected} values, got {}", t.shape, t.values.len())));
            }
        }
        Ok(())
    }

    /// Squared L2 distance, used by the proximal term.
    pub fn squared_distance(&self, other: &ModelParameters) -> Result<f64, FlError> {
        if !self.same_layout(other) {
            return Err(FlError::ShapeMismatch(format!("{:?} vs {:?}", self.shapes(), other.shapes())));
        }
        let mut acc = 0f64;
        for (a, b) in self.tensors.iter().zip(&other.tensors) {
            for (x, y) in a.values.iter().zip(&b.values) {
                let d = (*x - *y) as f64;
                acc += d * d;
            }
        }
        Ok(acc)
    }
}
