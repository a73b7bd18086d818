//! Accumulator epilogue: bias, activation, narrowing store
//!
//! Blocked variants accumulate in f32. Intermediate reduction passes leave
//! their partial sums in scratch untouched; only the last pass runs the
//! accumulator through [`Postprocess`], which adds the bias, applies the
//! fused activation and narrows to the destination type. Stores cover
//! exactly the valid lanes, so a partial tile at the end of the channel or
//! position range never writes past it.

use super::activation::Activation;
use super::alg::MAX_MICRO_D;
use crate::dtype::Element;

/// What a reduction pass does with its accumulator
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Term {
    /// Partial sums stay in f32 for the next pass
    Interim,
    /// Final pass: bias, activation, store
    Last,
}

impl Term {
    /// Term of the pass starting at reduction offset `k_start`
    #[inline]
    pub fn of_pass(k_start: usize, k_len: usize, buf_k: usize) -> Self {
        if k_start + k_len >= buf_k { Self::Last } else { Self::Interim }
    }
}

/// Bias and activation of one convolution
#[derive(Copy, Clone, Debug)]
pub(crate) struct Postprocess<'a> {
    bias: &'a [f32],
    activation: &'a Activation,
}

impl<'a> Postprocess<'a> {
    /// `bias` holds one value per output channel
    pub fn new(bias: &'a [f32], activation: &'a Activation) -> Self {
        Self { bias, activation }
    }

    /// Finish one value of channel `ch`
    #[inline]
    pub fn apply(&self, acc: f32, ch: usize) -> f32 {
        self.activation.apply(acc + self.bias[ch], ch)
    }

    /// Store a run of channels `ch0..ch0 + out.len()` of one position
    ///
    /// Used where the channel axis is the accumulator column (NHWC).
    #[inline]
    pub fn store_channels<D: Element>(&self, acc: &[f32], ch0: usize, out: &mut [D]) {
        let n = out.len();
        for start in (0..n).step_by(MAX_MICRO_D) {
            let len = (n - start).min(MAX_MICRO_D);
            let mut buf = [0.0f32; MAX_MICRO_D];
            let ch = ch0 + start;
            for (i, v) in buf[..len].iter_mut().enumerate() {
                *v = acc[start + i] + self.bias[ch + i];
            }
            self.activation.apply_run(&mut buf[..len], ch);
            for (d, &v) in out[start..start + len].iter_mut().zip(&buf[..len]) {
                *d = D::from_f32(v);
            }
        }
    }

    /// Store a run of positions of channel `ch`
    ///
    /// Used where the channel axis is the accumulator row (NCHW).
    #[inline]
    pub fn store_positions<D: Element>(&self, acc: &[f32], ch: usize, out: &mut [D]) {
        for (d, &v) in out.iter_mut().zip(acc) {
            *d = D::from_f32(self.apply(v, ch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::activation::ActivationKind;
    use half::bf16;

    #[test]
    fn test_store_channels_bias_activation() {
        let act = Activation::resolve(ActivationKind::Relu, None, 3).unwrap();
        let bias = [1.0, -5.0, 0.5];
        let post = Postprocess::new(&bias, &act);
        let mut out = [0.0f32; 2];
        post.store_channels(&[1.0, 2.0, 99.0], 1, &mut out);
        assert_eq!(out, [0.0, 2.5]);
    }

    #[test]
    fn test_store_positions_narrows() {
        let act = Activation::resolve(ActivationKind::Identity, None, 2).unwrap();
        let bias = [0.0, 0.25];
        let post = Postprocess::new(&bias, &act);
        let mut out = [bf16::ZERO; 3];
        post.store_positions(&[1.0, 3.14159, -2.0], 1, &mut out);
        assert_eq!(out[0].to_f32(), 1.25);
        assert_eq!(out[1].to_f32(), 3.390625);
        assert_eq!(out[2].to_f32(), -1.75);
    }

    #[test]
    fn test_term_of_pass() {
        assert_eq!(Term::of_pass(0, 64, 128), Term::Interim);
        assert_eq!(Term::of_pass(64, 64, 128), Term::Last);
    }
}
