//! Adam with paged, optionally 8-bit moment buffers

use std::sync::Arc;

use nibble_quant::validation::QuantValidator;
use nibble_quant::QuantError;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use crate::config::{AdamParams, OptimizerConfig};
use crate::paging::tier::SlowTier;
use crate::paging::{PageId, PagingManager};
use crate::state::{StateBuffer, StateRecord};
use crate::{OptimError, Result};

/// Applies one Adam(W) step to a block of elements.
///
/// `m` and `v` are updated in place and `delta` receives the parameter
/// update; `params` is read only for decoupled weight decay. `step` is the
/// 1-based step number used for bias correction. Quantized and full-precision
/// state run through this same function, so their arithmetic is identical.
pub fn adam_update_block(
    m: &mut [f32],
    v: &mut [f32],
    grad: &[f32],
    params: &[f32],
    delta: &mut [f32],
    hyper: &AdamParams,
    step: u64,
) {
    let exponent = i32::try_from(step).unwrap_or(i32::MAX);
    let bias1 = 1.0 - hyper.beta1.powi(exponent);
    let bias2 = 1.0 - hyper.beta2.powi(exponent);

    for i in 0..grad.len() {
        let g = grad[i];
        m[i] = hyper.beta1 * m[i] + (1.0 - hyper.beta1) * g;
        v[i] = hyper.beta2 * v[i] + (1.0 - hyper.beta2) * g * g;

        let m_hat = m[i] / bias1;
        let v_hat = v[i] / bias2;
        delta[i] = -hyper.learning_rate * (m_hat / (v_hat.sqrt() + hyper.epsilon) + hyper.weight_decay * params[i]);
    }
}

/// Rejects a block whose updated moments or delta overflowed
fn ensure_finite(block: usize, m: &[f32], v: &[f32], delta: &[f32]) -> Result<()> {
    for (what, values) in [("first moment", m), ("second moment", v), ("update", delta)] {
        if let Some(i) = values.iter().position(|x| !x.is_finite()) {
            return Err(QuantError::numeric_overflow(
                block,
                values[i],
                format!("{} at offset {} of block {}", what, i, block),
            )
            .into());
        }
    }
    Ok(())
}

/// Handle to one parameter's registered optimizer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHandle {
    id: PageId,
    numel: usize,
}

impl StateHandle {
    /// Page holding the state
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Number of parameter elements
    pub fn numel(&self) -> usize {
        self.numel
    }
}

/// Decoded copy of a parameter's state
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Completed steps
    pub step: u64,
    /// First moment
    pub moment1: Vec<f32>,
    /// Second moment
    pub moment2: Vec<f32>,
}

/// Adam optimizer whose state lives in a [`PagingManager`]
pub struct PagedAdam {
    config: OptimizerConfig,
    pager: PagingManager<StateRecord>,
}

impl PagedAdam {
    /// Creates an optimizer backed by an in-memory slow tier
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        let pager = PagingManager::with_host_tier(&config.paging);
        info!(
            "Created paged Adam: lr={}, state mode {:?}, block size {}",
            config.adam.learning_rate, config.state.mode, config.state.block_size
        );
        Ok(Self { config, pager })
    }

    /// Creates an optimizer backed by the given slow tier
    pub fn with_tier(config: OptimizerConfig, tier: Arc<dyn SlowTier>) -> Result<Self> {
        config.validate()?;
        let pager = PagingManager::new(&config.paging, tier, config.paging.policy.build());
        Ok(Self { config, pager })
    }

    /// Registers zeroed state for a parameter of `numel` elements
    pub fn register_parameter(&self, numel: usize) -> Result<StateHandle> {
        let record = StateRecord::new(numel, &self.config.state)?;
        let mode = record.moment1.mode();
        let id = self.pager.register(record)?;
        debug!("Registered {:?} state for {} elements as page {}", mode, numel, id);
        Ok(StateHandle { id, numel })
    }

    /// Runs one step and returns the update delta for `params`.
    ///
    /// The state is restored to the fast tier first if it was migrated out,
    /// and stays locked until every block has been re-encoded. A step that
    /// fails, including one whose moments overflow, leaves the state and the
    /// step counter as they were.
    pub fn step(&self, handle: StateHandle, params: &[f32], grad: &[f32]) -> Result<Vec<f32>> {
        QuantValidator::validate_same_length(handle.numel, grad.len(), "optimizer step gradient")?;
        QuantValidator::validate_same_length(handle.numel, params.len(), "optimizer step parameters")?;
        let block_size = self.config.state.block_size;
        if let Some(i) = grad.iter().position(|g| !g.is_finite()) {
            return Err(QuantError::numeric_overflow(
                i / block_size,
                grad[i],
                format!("gradient at offset {}", i),
            )
            .into());
        }

        let guard = self.pager.acquire(handle.id)?;
        let mut record = guard.write()?;
        if record.numel() != handle.numel {
            return Err(OptimError::state_corruption(
                "STATE_LENGTH_MISMATCH",
                format!("state holds {} elements, handle expects {}", record.numel(), handle.numel),
                format!("step on page {}", handle.id),
            ));
        }

        // Updates land in scratch copies and are committed only once every
        // block has been updated and re-encoded
        let step = record.step + 1;
        let hyper = self.config.adam;
        let verify = self.config.state.verify_roundtrip;
        let mut moment1 = record.moment1.clone();
        let mut moment2 = record.moment2.clone();
        let mut delta = vec![0.0f32; handle.numel];

        match (&mut moment1, &mut moment2) {
            (StateBuffer::Full(m), StateBuffer::Full(v)) => {
                m.par_chunks_mut(block_size)
                    .zip(v.par_chunks_mut(block_size))
                    .zip(grad.par_chunks(block_size))
                    .zip(params.par_chunks(block_size))
                    .zip(delta.par_chunks_mut(block_size))
                    .enumerate()
                    .try_for_each(|(b, ((((m, v), g), p), d))| -> Result<()> {
                        adam_update_block(m, v, g, p, d, &hyper, step);
                        ensure_finite(b, m, v, d)
                    })?;
            }
            (StateBuffer::Quantized(m), StateBuffer::Quantized(v)) => {
                let block_size = m.block_size();
                if v.block_size() != block_size {
                    return Err(OptimError::state_corruption(
                        "STATE_BLOCK_MISMATCH",
                        format!("moment block sizes differ: {} vs {}", block_size, v.block_size()),
                        format!("step on page {}", handle.id),
                    ));
                }
                m.blocks_mut()
                    .into_par_iter()
                    .zip(v.blocks_mut())
                    .zip(grad.par_chunks(block_size))
                    .zip(params.par_chunks(block_size))
                    .zip(delta.par_chunks_mut(block_size))
                    .try_for_each(|((((mut m_block, mut v_block), g), p), d)| -> Result<()> {
                        let mut m_vals = vec![0.0f32; g.len()];
                        let mut v_vals = vec![0.0f32; g.len()];
                        m_block.decode_into(&mut m_vals);
                        v_block.decode_into(&mut v_vals);
                        adam_update_block(&mut m_vals, &mut v_vals, g, p, d, &hyper, step);
                        ensure_finite(m_block.index(), &m_vals, &v_vals, d)?;
                        m_block.encode_from(&m_vals, verify)?;
                        v_block.encode_from(&v_vals, verify)
                    })?;
            }
            _ => {
                return Err(OptimError::state_corruption(
                    "STATE_MODE_MISMATCH",
                    "moment buffers use different representations",
                    format!("step on page {}", handle.id),
                ));
            }
        }

        record.moment1 = moment1;
        record.moment2 = moment2;
        record.step = step;

        trace!("Step {} on page {} ({} elements)", step, handle.id, handle.numel);
        Ok(delta)
    }

    /// Runs one step and adds the delta to `params`
    pub fn apply(&self, handle: StateHandle, params: &mut [f32], grad: &[f32]) -> Result<()> {
        let delta = self.step(handle, params, grad)?;
        params.iter_mut().zip(&delta).for_each(|(p, d)| *p += d);
        Ok(())
    }

    /// Drops a parameter's state from both tiers
    pub fn release(&self, handle: StateHandle) -> Result<()> {
        self.pager.unregister(handle.id)
    }

    /// Decoded moments of a parameter, restoring its page if needed
    pub fn moments(&self, handle: StateHandle) -> Result<StateSnapshot> {
        let guard = self.pager.acquire(handle.id)?;
        let record = guard.write()?;
        Ok(StateSnapshot {
            step: record.step,
            moment1: record.moment1.to_vec(),
            moment2: record.moment2.to_vec(),
        })
    }

    /// The paging manager holding every state record
    pub fn pager(&self) -> &PagingManager<StateRecord> {
        &self.pager
    }

    /// Active configuration
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMode;
    use approx::assert_relative_eq;

    fn full_config() -> OptimizerConfig {
        let mut config = OptimizerConfig::default();
        config.state.mode = StateMode::Full32;
        config.state.block_size = 4;
        config
    }

    #[test]
    fn test_first_step_matches_closed_form() {
        // With zero state, the first bias-corrected step is -lr * sign(g)
        let hyper = AdamParams::default();
        let mut m = vec![0.0; 3];
        let mut v = vec![0.0; 3];
        let mut delta = vec![0.0; 3];
        adam_update_block(&mut m, &mut v, &[0.5, -2.0, 0.0], &[1.0; 3], &mut delta, &hyper, 1);

        assert_relative_eq!(delta[0], -1e-3, epsilon = 1e-6);
        assert_relative_eq!(delta[1], 1e-3, epsilon = 1e-6);
        assert_eq!(delta[2], 0.0);
        assert_relative_eq!(m[1], -0.2, epsilon = 1e-6);
        assert_relative_eq!(v[1], 0.004, epsilon = 1e-6);
    }

    #[test]
    fn test_weight_decay_is_decoupled() {
        let hyper = AdamParams { weight_decay: 0.1, ..AdamParams::default() };
        let mut m = vec![0.0];
        let mut v = vec![0.0];
        let mut delta = vec![0.0];
        adam_update_block(&mut m, &mut v, &[0.0], &[2.0], &mut delta, &hyper, 1);
        assert_relative_eq!(delta[0], -1e-3 * 0.1 * 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_step_and_moments() {
        let adam = PagedAdam::new(full_config()).unwrap();
        let handle = adam.register_parameter(6).unwrap();
        let mut params = vec![1.0f32; 6];
        let grad = vec![0.1f32, -0.1, 0.2, -0.2, 0.3, 0.0];

        adam.apply(handle, &mut params, &grad).unwrap();
        adam.apply(handle, &mut params, &grad).unwrap();

        let snapshot = adam.moments(handle).unwrap();
        assert_eq!(snapshot.step, 2);
        // m after two equal gradients: (1 - 0.9^2) * g
        assert_relative_eq!(snapshot.moment1[2], 0.19 * 0.2, epsilon = 1e-6);
        assert!(params[0] < 1.0 && params[1] > 1.0);
        assert_eq!(params[5], 1.0);
    }

    #[test]
    fn test_length_mismatch_and_non_finite_gradient() {
        let adam = PagedAdam::new(full_config()).unwrap();
        let handle = adam.register_parameter(4).unwrap();

        let err = adam.step(handle, &[0.0; 4], &[0.0; 3]).unwrap_err();
        assert_eq!(err.code(), "LENGTH_MISMATCH");

        let err = adam.step(handle, &[0.0; 4], &[0.0, 0.0, 0.0, f32::INFINITY]).unwrap_err();
        assert!(matches!(err, OptimError::Quant(QuantError::NumericOverflow { .. })));
        assert_eq!(adam.moments(handle).unwrap().step, 0);
    }

    #[test]
    fn test_overflowing_quantized_step_leaves_state_untouched() {
        let mut config = full_config();
        config.state.mode = StateMode::Blockwise8;
        config.state.outliers = 0;
        config.state.min_quantized_numel = 0;
        let adam = PagedAdam::new(config).unwrap();
        let handle = adam.register_parameter(8).unwrap();
        let params = vec![0.0f32; 8];

        adam.step(handle, &params, &[0.5; 8]).unwrap();
        let before = adam.moments(handle).unwrap();

        // Finite, but g * g overflows the second moment
        let mut grad = vec![0.5f32; 8];
        grad[7] = 1e22;
        let err = adam.step(handle, &params, &grad).unwrap_err();
        assert!(matches!(err, OptimError::Quant(QuantError::NumericOverflow { block_index: 1, .. })));
        assert_eq!(adam.moments(handle).unwrap(), before);
        assert_eq!(before.step, 1);
    }

    #[test]
    fn test_overflowing_full_step_is_rejected() {
        let adam = PagedAdam::new(full_config()).unwrap();
        let handle = adam.register_parameter(4).unwrap();
        let params = vec![0.0f32; 4];
        let before = adam.moments(handle).unwrap();

        let err = adam.step(handle, &params, &[1e22, 0.1, 0.1, 0.1]).unwrap_err();
        assert_eq!(err.code(), "QUANT_NON_FINITE_SCALE");
        assert_eq!(adam.moments(handle).unwrap(), before);

        // The buffer keeps training normally afterwards
        let delta = adam.step(handle, &params, &[0.1; 4]).unwrap();
        assert!(delta.iter().all(|d| d.is_finite() && *d < 0.0));
        assert_eq!(adam.moments(handle).unwrap().step, 1);
    }

    #[test]
    fn test_release() {
        let adam = PagedAdam::new(full_config()).unwrap();
        let handle = adam.register_parameter(4).unwrap();
        adam.release(handle).unwrap();
        assert!(matches!(adam.moments(handle), Err(OptimError::UnknownPage { .. })));
        assert!(adam.pager().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = OptimizerConfig::default();
        config.adam.learning_rate = -1.0;
        assert!(matches!(PagedAdam::new(config), Err(OptimError::InvalidParameter { .. })));
    }

    #[test]
    fn test_quantized_state_tracks_full_state() {
        let mut quant_config = full_config();
        quant_config.state.mode = StateMode::Blockwise8;
        quant_config.state.block_size = 16;
        quant_config.state.min_quantized_numel = 0;
        quant_config.state.verify_roundtrip = true;

        let full = PagedAdam::new(full_config()).unwrap();
        let quant = PagedAdam::new(quant_config).unwrap();
        let numel = 64;
        let f = full.register_parameter(numel).unwrap();
        let q = quant.register_parameter(numel).unwrap();

        let params = vec![0.5f32; numel];
        for s in 0..5 {
            let grad: Vec<f32> = (0..numel).map(|i| (((i * 7 + s * 3) % 11) as f32 - 5.0) * 0.01).collect();
            let d_full = full.step(f, &params, &grad).unwrap();
            let d_quant = quant.step(q, &params, &grad).unwrap();
            for (a, b) in d_full.iter().zip(&d_quant) {
                assert!((a - b).abs() < 2e-4, "full {} vs quantized {}", a, b);
            }
        }
    }
}
