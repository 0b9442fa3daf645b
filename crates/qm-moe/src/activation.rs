/// Element-wise activation applied to the gate projection of each expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// `x * sigmoid(x)`.
    #[default]
    Silu,
    /// GELU, tanh approximation.
    Gelu,
    Tanh,
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

impl Activation {
    pub fn eval(self, x: f32) -> f32 {
        match self {
            Activation::Silu => x / (1.0 + (-x).exp()),
            Activation::Gelu => {
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)).tanh())
            }
            Activation::Tanh => x.tanh(),
        }
    }

    /// Apply in place to every element of `values`.
    pub fn apply(self, values: &mut [f32]) {
        for v in values {
            *v = self.eval(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_silu() {
        assert_abs_diff_eq!(Activation::Silu.eval(0.0), 0.0);
        // silu(1) = 1 / (1 + exp(-1))
        assert_abs_diff_eq!(Activation::Silu.eval(1.0), 0.731_058_6, epsilon = 1e-6);
        assert_abs_diff_eq!(Activation::Silu.eval(-20.0), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gelu() {
        assert_abs_diff_eq!(Activation::Gelu.eval(0.0), 0.0);
        assert_abs_diff_eq!(Activation::Gelu.eval(1.0), 0.841_192, epsilon = 1e-5);
        assert_abs_diff_eq!(Activation::Gelu.eval(-1.0), -0.158_808, epsilon = 1e-5);
    }

    #[test]
    fn test_tanh_and_apply() {
        let mut v = [0.0f32, 0.5, -0.5];
        Activation::Tanh.apply(&mut v);
        assert_abs_diff_eq!(v[1], 0.5f32.tanh());
        assert_abs_diff_eq!(v[2], -v[1]);
        assert_eq!(Activation::default(), Activation::Silu);
    }
}
