use serde::{Deserialize, Serialize};

/// Scalar activation used by every neuron in a compiled network.
///
/// Implementations must be bounded, differentiable, and map into (0, 1).
/// Networks own a boxed instance for their lifetime; the choice is made at
/// construction time (and, for the binary, in `Settings`).
#[typetag::serde]
pub trait Squasher: Send + Sync {
    fn squash(&self, input: f32) -> f32;
    fn derivative(&self, input: f32) -> f32;

    fn clone_box(&self) -> Box<dyn Squasher>;
}

impl Clone for Box<dyn Squasher> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// `x / (2(1 + |x|)) + 0.5`: a cheap sigmoid-shaped squash into (0, 1).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct FastSigmoid;

#[typetag::serde]
impl Squasher for FastSigmoid {
    fn squash(&self, input: f32) -> f32 {
        input / (2.0 * (1.0 + input.abs())) + 0.5
    }

    fn derivative(&self, input: f32) -> f32 {
        let t = 1.0 + input.abs();
        0.5 / (t * t)
    }

    fn clone_box(&self) -> Box<dyn Squasher> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_sigmoid_is_bounded() {
        let s = FastSigmoid;
        for x in [-1.0e6, -42.0, -1.0, 0.0, 1.0, 42.0, 1.0e6] {
            let y = s.squash(x);
            assert!(y > 0.0 && y < 1.0, "squash({x}) = {y} out of (0, 1)");
        }
        assert_eq!(s.squash(0.0), 0.5);
    }

    #[test]
    fn fast_sigmoid_derivative_matches_finite_difference() {
        let s = FastSigmoid;
        let h = 1.0e-3;
        for x in [-5.0f32, -0.7, 0.3, 2.0, 10.0] {
            let numeric = (s.squash(x + h) - s.squash(x - h)) / (2.0 * h);
            let analytic = s.derivative(x);
            assert!(
                (numeric - analytic).abs() < 1.0e-3,
                "at {x}: numeric {numeric} vs analytic {analytic}"
            );
        }
    }
}
