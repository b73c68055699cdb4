//! AdamW with global-norm gradient clipping and a weight-decay mask.
//!
//! For each parameter `p` with (clipped) gradient `g`, at update count `t`:
//!
//! ```text
//! m = β₁·m + (1-β₁)·g
//! v = β₂·v + (1-β₂)·g²
//! u = -lr · ( (m / (1-β₁ᵗ)) / (√(v / (1-β₂ᵗ)) + ε) + wd·p )   # wd only for decayed params
//! ```
//!
//! Which parameters receive weight decay is decided once, when the optimizer
//! is built, by [`classify`].

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingHyperParams;
use crate::model::Optimizer;
use crate::tensor::{ParamTree, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayClass {
    Decayed,
    Excluded,
}

/// Matrices and higher-rank tensors are decayed; biases, norms and scalars are not.
#[must_use]
pub fn classify(_path: &str, shape: &[usize]) -> DecayClass {
    if shape.len() > 1 { DecayClass::Decayed } else { DecayClass::Excluded }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecayMask(BTreeMap<String, DecayClass>);

impl DecayMask {
    pub fn from_params(params: &ParamTree, rule: impl Fn(&str, &[usize]) -> DecayClass) -> Self {
        Self(params.iter().map(|(path, t)| (path.to_string(), rule(path, &t.shape))).collect())
    }

    pub fn class(&self, path: &str) -> TrainingResult<DecayClass> {
        self.0
            .get(path)
            .copied()
            .ok_or_else(|| TrainingError::Model(format!("parameter `{path}` has no weight-decay class")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl AdamWConfig {
    #[must_use]
    pub fn from_hyper_params(hp: &TrainingHyperParams) -> Self {
        Self {
            learning_rate: hp.learning_rate as f32,
            weight_decay: hp.weight_decay as f32,
            max_grad_norm: hp.max_grad_norm as f32,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    pub count: u64,
    pub mu: ParamTree,
    pub nu: ParamTree,
}

#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    mask: DecayMask,
}

impl AdamW {
    #[must_use]
    pub fn new(config: AdamWConfig, mask: DecayMask) -> Self {
        Self { config, mask }
    }
}

/// Scales `gradients` down so their global L2 norm is at most `max_norm`.
#[must_use]
pub fn clip_by_global_norm(gradients: &ParamTree, max_norm: f32) -> ParamTree {
    let norm = gradients.global_norm();
    let mut clipped = gradients.clone();
    if norm > f64::from(max_norm) {
        clipped.scale((f64::from(max_norm) / norm) as f32);
    }
    clipped
}

impl Optimizer for AdamW {
    type State = AdamWState;

    fn init(&self, params: &ParamTree) -> AdamWState {
        AdamWState { count: 0, mu: params.zeros_like(), nu: params.zeros_like() }
    }

    fn update(
        &self,
        gradients: &ParamTree,
        state: &AdamWState,
        params: &ParamTree,
    ) -> TrainingResult<(ParamTree, AdamWState)> {
        let c = &self.config;
        if !(gradients.same_structure(params)
            && state.mu.same_structure(params)
            && state.nu.same_structure(params))
        {
            return Err(TrainingError::Model("optimizer state does not match parameters".to_string()));
        }

        let g = clip_by_global_norm(gradients, c.max_grad_norm);
        let count = state.count + 1;
        let bias1 = 1.0 - c.beta1.powf(count as f32);
        let bias2 = 1.0 - c.beta2.powf(count as f32);

        let mu = state.mu.zip_map(&g, |_, m, g| c.beta1 * m + (1.0 - c.beta1) * g)?;
        let nu = state.nu.zip_map(&g, |_, v, g| c.beta2 * v + (1.0 - c.beta2) * g * g)?;

        let mut updates = ParamTree::new();
        for (path, p) in params.iter() {
            let decay = match self.mask.class(path)? {
                DecayClass::Decayed => c.weight_decay,
                DecayClass::Excluded => 0.0,
            };
            let (m, v) = match (mu.get(path), nu.get(path)) {
                (Some(m), Some(v)) => (m, v),
                _ => return Err(TrainingError::Model(format!("missing moments for `{path}`"))),
            };
            let data = p
                .data
                .iter()
                .zip(m.data.iter().zip(&v.data))
                .map(|(p, (m, v))| {
                    let step = (m / bias1) / ((v / bias2).sqrt() + c.epsilon);
                    -c.learning_rate * (step + decay * p)
                })
                .collect();
            updates.insert(path, Tensor { shape: p.shape.clone(), data });
        }

        Ok((updates, AdamWState { count, mu, nu }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParamTree {
        let mut t = ParamTree::new();
        t.insert("layer/weight", Tensor::new(vec![2, 2], vec![1.0, -1.0, 0.5, 2.0]).unwrap());
        t.insert("layer/bias", Tensor::new(vec![2], vec![1.0, 1.0]).unwrap());
        t
    }

    fn optimizer(weight_decay: f32) -> AdamW {
        let base = AdamWConfig::from_hyper_params(&TrainingHyperParams::default());
        let config = AdamWConfig { learning_rate: 0.1, weight_decay, max_grad_norm: 1.0e6, ..base };
        AdamW::new(config, DecayMask::from_params(&params(), classify))
    }

    #[test]
    fn test_classify_by_rank() {
        assert_eq!(classify("layer/weight", &[4, 4]), DecayClass::Decayed);
        assert_eq!(classify("layer/bias", &[4]), DecayClass::Excluded);
        assert_eq!(classify("scale", &[]), DecayClass::Excluded);
    }

    #[test]
    fn test_weight_decay_only_touches_decayed_params() {
        let opt = optimizer(0.5);
        let p = params();
        let zero = p.zeros_like();
        let (updates, state) = opt.update(&zero, &opt.init(&p), &p).unwrap();

        assert_eq!(state.count, 1);
        assert_eq!(updates.get("layer/bias").unwrap().data, vec![0.0, 0.0]);
        let w = &updates.get("layer/weight").unwrap().data;
        assert!((w[0] + 0.05).abs() < 1e-7);
        assert!((w[3] + 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_first_step_moves_against_gradient_by_lr() {
        let opt = optimizer(0.0);
        let p = params();
        let mut g = p.zeros_like();
        g.insert("layer/bias", Tensor::new(vec![2], vec![0.3, -0.2]).unwrap());
        let (updates, _) = opt.update(&g, &opt.init(&p), &p).unwrap();
        let new = opt.apply(&p, &updates).unwrap();

        let b = &new.get("layer/bias").unwrap().data;
        assert!((b[0] - 0.9).abs() < 1e-5);
        assert!((b[1] - 1.1).abs() < 1e-5);
    }

    #[test]
    fn test_clip_by_global_norm() {
        let mut g = ParamTree::new();
        g.insert("x", Tensor::new(vec![2], vec![3.0, 4.0]).unwrap());
        let clipped = clip_by_global_norm(&g, 1.0);
        assert!((clipped.global_norm() - 1.0).abs() < 1e-6);
        assert_eq!(clip_by_global_norm(&g, 10.0), g);
    }

    #[test]
    fn test_unclassified_param_is_error() {
        let opt = optimizer(0.1);
        let mut p = params();
        p.insert("extra", Tensor::zeros(vec![1]));
        let state = opt.init(&p);
        assert!(opt.update(&p.zeros_like(), &state, &p).is_err());
    }
}
