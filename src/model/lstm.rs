//! Bidirectional single-layer LSTM.
//!
//! Gate layout follows PyTorch: the `4H` rows of `weight_ih`/`weight_hh` are
//! the input, forget, cell and output gates in that order.
//!
//! ```text
//! i = σ(W_ii x + b_ii + W_hi h + b_hi)
//! f = σ(W_if x + b_if + W_hf h + b_hf)
//! g = tanh(W_ig x + b_ig + W_hg h + b_hg)
//! o = σ(W_io x + b_io + W_ho h + b_ho)
//! c' = f ⊙ c + i ⊙ g
//! h' = o ⊙ tanh(c')
//! ```
//!
//! The forward direction walks `0..T`, the backward one `T..0`; outputs are
//! stored at their original time index and concatenated on the feature axis.

use candle_core::{D, Result, Tensor};
use candle_nn::VarBuilder;

use super::mask::PaddingMask;

/// Hidden and cell state of one direction, each `[B, H]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
struct LstmDirection {
    /// [In, 4H]
    w_ih_t: Tensor,
    /// [H, 4H]
    w_hh_t: Tensor,
    /// b_ih + b_hh, [4H]
    bias: Tensor,
    direction: Direction,
}

impl LstmDirection {
    fn load(input_size: usize, hidden: usize, direction: Direction, vb: &VarBuilder) -> Result<Self> {
        let suffix = match direction {
            Direction::Forward => "l0",
            Direction::Backward => "l0_reverse",
        };
        let bound = 1.0 / (hidden as f64).sqrt();
        let init = candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let w_ih = vb.get_with_hints((4 * hidden, input_size), &format!("weight_ih_{suffix}"), init)?;
        let w_hh = vb.get_with_hints((4 * hidden, hidden), &format!("weight_hh_{suffix}"), init)?;
        let b_ih = vb.get_with_hints(4 * hidden, &format!("bias_ih_{suffix}"), init)?;
        let b_hh = vb.get_with_hints(4 * hidden, &format!("bias_hh_{suffix}"), init)?;
        Ok(Self {
            w_ih_t: w_ih.t()?.contiguous()?,
            w_hh_t: w_hh.t()?.contiguous()?,
            bias: (b_ih + b_hh)?,
            direction,
        })
    }

    /// Run over `xs: [B, T, In]`, returning `[B, T, H]` and the final state.
    fn run(&self, xs: &Tensor, init: Option<&LstmState>) -> Result<(Tensor, LstmState)> {
        let (b, t, _) = xs.dims3()?;
        let hidden = self.w_hh_t.dim(0)?;
        // Input projection for every step at once: [B, T, 4H]
        let x_proj = xs.broadcast_matmul(&self.w_ih_t)?.broadcast_add(&self.bias)?;

        let (mut h, mut c) = match init {
            Some(state) => (state.h.clone(), state.c.clone()),
            None => {
                let zeros = Tensor::zeros((b, hidden), xs.dtype(), xs.device())?;
                (zeros.clone(), zeros)
            }
        };

        let mut outputs: Vec<Option<Tensor>> = vec![None; t];
        for step in 0..t {
            let index = match self.direction {
                Direction::Forward => step,
                Direction::Backward => t - 1 - step,
            };
            let gates = (x_proj.narrow(1, index, 1)?.squeeze(1)? + h.matmul(&self.w_hh_t)?)?;
            let chunks = gates.chunk(4, D::Minus1)?;
            let input_gate = candle_nn::ops::sigmoid(&chunks[0])?;
            let forget_gate = candle_nn::ops::sigmoid(&chunks[1])?;
            let candidate = chunks[2].tanh()?;
            let output_gate = candle_nn::ops::sigmoid(&chunks[3])?;

            c = ((forget_gate * &c)? + (input_gate * candidate)?)?;
            h = (output_gate * c.tanh()?)?;
            outputs[index] = Some(h.unsqueeze(1)?);
        }

        let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();
        let ys = if outputs.is_empty() {
            Tensor::zeros((b, 0, hidden), xs.dtype(), xs.device())?
        } else {
            Tensor::cat(&outputs, 1)?
        };
        Ok((ys, LstmState { h, c }))
    }
}

/// Bidirectional LSTM: `[B, T, In]` (or unbatched `[T, In]`) → `[.., T, 2H]`.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LstmDirection,
    backward: LstmDirection,
    input_size: usize,
    hidden_size: usize,
}

impl BiLstm {
    /// Load from `{prefix}.weight_ih_l0`, `..._reverse` etc.
    ///
    /// A stored weight whose shape disagrees with `input_size`/`hidden_size`
    /// fails here rather than on the first call.
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let forward = LstmDirection::load(input_size, hidden_size, Direction::Forward, &vb)?;
        let backward = LstmDirection::load(input_size, hidden_size, Direction::Backward, &vb)?;
        Ok(Self {
            forward,
            backward,
            input_size,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_state(xs, None)?.0)
    }

    /// Run over the valid prefix of `xs: [B, T, In]` only and zero-pad the
    /// output back to `T`, so trailing padding never reaches the backward
    /// direction of a valid step.
    pub fn forward_masked(&self, xs: &Tensor, mask: &PaddingMask) -> Result<Tensor> {
        let t = xs.dim(1)?;
        if mask.len() != t {
            candle_core::bail!("lstm input has {t} steps, mask covers {}", mask.len());
        }
        let valid = mask.valid_len();
        let ys = self.forward(&xs.narrow(1, 0, valid)?.contiguous()?)?;
        ys.pad_with_zeros(1, 0, t - valid)
    }

    /// Run both directions, optionally from explicit `(forward, backward)`
    /// initial states. Returns the output and the final states.
    pub fn forward_with_state(
        &self,
        xs: &Tensor,
        init: Option<(&LstmState, &LstmState)>,
    ) -> Result<(Tensor, (LstmState, LstmState))> {
        let unbatched = xs.rank() == 2;
        let xs = if unbatched { xs.unsqueeze(0)? } else { xs.clone() };
        let features = xs.dim(D::Minus1)?;
        if features != self.input_size {
            candle_core::bail!(
                "lstm expects {} input features, got {features}",
                self.input_size
            );
        }

        let (fwd_init, bwd_init) = match init {
            Some((f, b)) => (Some(f), Some(b)),
            None => (None, None),
        };
        let (fwd, fwd_state) = self.forward.run(&xs, fwd_init)?;
        let (bwd, bwd_state) = self.backward.run(&xs, bwd_init)?;
        let ys = Tensor::cat(&[fwd, bwd], D::Minus1)?;
        let ys = if unbatched { ys.squeeze(0)? } else { ys };
        Ok((ys, (fwd_state, bwd_state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn make_lstm(input: usize, hidden: usize, dev: &Device) -> BiLstm {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        BiLstm::new(input, hidden, vb.pp("lstm")).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_output_shape() {
        let dev = Device::Cpu;
        let lstm = make_lstm(6, 4, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 9, 6), &dev).unwrap();
        let ys = lstm.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 9, 8]);
    }

    #[test]
    fn test_unbatched_input() {
        let dev = Device::Cpu;
        let lstm = make_lstm(6, 4, &dev);
        let xs = Tensor::randn(0f32, 1.0, (5, 6), &dev).unwrap();
        let ys = lstm.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[5, 8]);
        let batched = lstm.forward(&xs.unsqueeze(0).unwrap()).unwrap();
        assert_eq!(max_abs_diff(&ys, &batched.squeeze(0).unwrap()), 0.0);
    }

    #[test]
    fn test_deterministic() {
        let dev = Device::Cpu;
        let lstm = make_lstm(3, 5, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 7, 3), &dev).unwrap();
        let a = lstm.forward(&xs).unwrap();
        let b = lstm.forward(&xs).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn test_direction_causality() {
        // Forward half at t=0 only sees x[0]; backward half at t=T-1 only sees x[T-1].
        let dev = Device::Cpu;
        let lstm = make_lstm(3, 4, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 6, 3), &dev).unwrap();
        let full = lstm.forward(&xs).unwrap();

        let first = lstm.forward(&xs.i((.., 0..1, ..)).unwrap()).unwrap();
        let last = lstm.forward(&xs.i((.., 5..6, ..)).unwrap()).unwrap();

        let fwd_t0 = full.i((.., 0..1, 0..4)).unwrap();
        let bwd_tn = full.i((.., 5..6, 4..8)).unwrap();
        assert!(max_abs_diff(&fwd_t0, &first.i((.., .., 0..4)).unwrap()) < 1e-6);
        assert!(max_abs_diff(&bwd_tn, &last.i((.., .., 4..8)).unwrap()) < 1e-6);
    }

    #[test]
    fn test_single_step_matches_gate_equations() {
        let dev = Device::Cpu;
        let lstm = make_lstm(2, 3, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 1, 2), &dev).unwrap();
        let ys = lstm.forward(&xs).unwrap();

        // With zero initial state: c = i*g, h = o*tanh(c).
        let cell = &lstm.forward;
        let gates = xs
            .squeeze(0)
            .unwrap()
            .matmul(&cell.w_ih_t)
            .unwrap()
            .broadcast_add(&cell.bias)
            .unwrap();
        let chunks = gates.chunk(4, D::Minus1).unwrap();
        let i = candle_nn::ops::sigmoid(&chunks[0]).unwrap();
        let g = chunks[2].tanh().unwrap();
        let o = candle_nn::ops::sigmoid(&chunks[3]).unwrap();
        let c = (i * g).unwrap();
        let h = (o * c.tanh().unwrap()).unwrap();
        assert!(max_abs_diff(&ys.i((0, .., 0..3)).unwrap(), &h) < 1e-6);
    }

    #[test]
    fn test_initial_state_is_used() {
        let dev = Device::Cpu;
        let lstm = make_lstm(2, 3, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 4, 2), &dev).unwrap();
        let (zero_run, (fwd_state, bwd_state)) = lstm.forward_with_state(&xs, None).unwrap();
        let (warm_run, _) = lstm
            .forward_with_state(&xs, Some((&fwd_state, &bwd_state)))
            .unwrap();
        assert_eq!(fwd_state.h.dims(), &[1, 3]);
        assert!(max_abs_diff(&zero_run, &warm_run) > 0.0);
    }

    #[test]
    fn test_masked_run_ignores_trailing_padding() {
        let dev = Device::Cpu;
        let lstm = make_lstm(3, 4, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 5, 3), &dev).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 4, 3), &dev).unwrap();
        let padded = Tensor::cat(&[&xs, &noise], 1).unwrap();

        let plain = lstm.forward(&xs).unwrap();
        let masked = lstm
            .forward_masked(&padded, &PaddingMask::with_valid_prefix(9, 5))
            .unwrap();
        assert_eq!(masked.dims(), &[1, 9, 8]);
        assert!(max_abs_diff(&masked.i((.., 0..5, ..)).unwrap(), &plain) < 1e-6);
        let tail: Vec<f32> = masked.i((.., 5.., ..)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(tail.iter().all(|&v| v == 0.0));

        let short_mask = PaddingMask::all_valid(8);
        assert!(lstm.forward_masked(&padded, &short_mask).is_err());
    }

    #[test]
    fn test_wrong_input_width_rejected() {
        let dev = Device::Cpu;
        let lstm = make_lstm(4, 2, &dev);
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 5), &dev).unwrap();
        assert!(lstm.forward(&xs).is_err());
    }
}
