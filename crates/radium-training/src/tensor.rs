//! Dense `f32` tensors and the named parameter tree used for weights,
//! gradients and optimizer moments.
//!
//! Tensor payloads serialize as base64 of little-endian `f32` bytes so that a
//! checkpoint restores every bit pattern exactly (NaN and infinities included).

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    #[serde(with = "le_f32_base64")]
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> TrainingResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TrainingError::Model(format!(
                "tensor shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn sum_of_squares(&self) -> f64 {
        self.data.iter().map(|v| f64::from(*v) * f64::from(*v)).sum()
    }

    /// Bitwise equality, unlike `PartialEq` which treats NaN as unequal.
    #[must_use]
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.data.len() == other.data.len()
            && self.data.iter().zip(&other.data).all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Ordered mapping of `/`-separated parameter paths to tensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamTree(BTreeMap<String, Tensor>);

impl ParamTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(path.into(), tensor)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Tensor> {
        self.0.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.0.values().map(Tensor::numel).sum()
    }

    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self(self.0.iter().map(|(k, t)| (k.clone(), Tensor::zeros(t.shape.clone()))).collect())
    }

    /// L2 norm over every element of every tensor.
    #[must_use]
    pub fn global_norm(&self) -> f64 {
        self.0.values().map(Tensor::sum_of_squares).sum::<f64>().sqrt()
    }

    #[must_use]
    pub fn same_structure(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|((ka, a), (kb, b))| ka == kb && a.shape == b.shape)
    }

    pub fn scale(&mut self, factor: f32) {
        for tensor in self.0.values_mut() {
            tensor.data.iter_mut().for_each(|v| *v *= factor);
        }
    }

    pub fn add_assign(&mut self, other: &Self) -> TrainingResult<()> {
        self.check_structure(other)?;
        for (dst, src) in self.0.values_mut().zip(other.0.values()) {
            dst.data.iter_mut().zip(&src.data).for_each(|(d, s)| *d += *s);
        }
        Ok(())
    }

    /// Element-wise combination of two trees with identical structure.
    pub fn zip_map(&self, other: &Self, f: impl Fn(&str, f32, f32) -> f32) -> TrainingResult<Self> {
        self.check_structure(other)?;
        let mut out = BTreeMap::new();
        for ((path, a), b) in self.0.iter().zip(other.0.values()) {
            let data = a.data.iter().zip(&b.data).map(|(x, y)| f(path, *x, *y)).collect();
            out.insert(path.clone(), Tensor { shape: a.shape.clone(), data });
        }
        Ok(Self(out))
    }

    #[must_use]
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|((ka, a), (kb, b))| ka == kb && a.bit_eq(b))
    }

    fn check_structure(&self, other: &Self) -> TrainingResult<()> {
        if self.same_structure(other) {
            Ok(())
        } else {
            Err(TrainingError::Model("parameter trees differ in paths or shapes".to_string()))
        }
    }
}

impl FromIterator<(String, Tensor)> for ParamTree {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

mod le_f32_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(de::Error::custom(format!(
                "tensor payload of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
