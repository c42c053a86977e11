use crate::traits::Scalar;
use num_traits::{FromPrimitive, One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Dual number for forward-mode sensitivities.
/// val: real part
/// eps: tangent along one independent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// Applies a unary function with known derivative `d` at `val`.
    fn chain(self, val: f64, d: f64) -> Self {
        Self::new(val, d * self.eps)
    }
}

// Ordering only looks at the real part, so comparisons in piecewise
// expressions select the same branch as the plain evaluation.
impl PartialOrd for Dual {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.val.partial_cmp(&other.val)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::new(n as f64, 0.0))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::new(n as f64, 0.0))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::new(n, 0.0))
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Scalar for Dual {
    fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    fn value(self) -> f64 {
        self.val
    }

    fn powf(self, n: Self) -> Self {
        let val_pow = self.val.powf(n.val);
        // d(x^y) = y x^(y-1) dx + x^y ln(x) dy; the ln term only matters
        // when the exponent carries a tangent.
        let mut eps = if self.eps == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0) * self.eps
        };
        if n.eps != 0.0 {
            eps += val_pow * self.val.ln() * n.eps;
        }
        Self::new(val_pow, eps)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }

    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn abs(self) -> Self {
        self.chain(self.val.abs(), if self.val >= 0.0 { 1.0 } else { -1.0 })
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }

    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }

    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }

    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }

    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }

    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }

    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }

    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }

    fn floor(self) -> Self {
        Self::new(self.val.floor(), 0.0)
    }

    fn ceil(self) -> Self {
        Self::new(self.val.ceil(), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Dual;
    use crate::traits::Scalar;

    fn derivative(f: impl Fn(Dual) -> Dual, x: f64) -> f64 {
        f(Dual::new(x, 1.0)).eps
    }

    #[test]
    fn product_and_quotient_rules() {
        let d = derivative(|x| x * x / (x + Dual::constant(1.0)), 2.0);
        // d/dx x^2/(x+1) = (x^2 + 2x)/(x+1)^2
        assert!((d - 8.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn transcendental_derivatives_match_closed_forms() {
        let x = 0.3;
        assert!((derivative(Scalar::exp, x) - x.exp()).abs() < 1e-12);
        assert!((derivative(Scalar::ln, x) - 1.0 / x).abs() < 1e-12);
        assert!((derivative(Scalar::tanh, x) - (1.0 - x.tanh().powi(2))).abs() < 1e-12);
        assert!((derivative(Scalar::atan, x) - 1.0 / (1.0 + x * x)).abs() < 1e-12);
        assert!((derivative(Scalar::log10, x) - 1.0 / (x * 10f64.ln())).abs() < 1e-12);
    }

    #[test]
    fn powf_with_constant_exponent_handles_zero_base() {
        let y = Dual::new(0.0, 0.0).powf(Dual::constant(3.0));
        assert_eq!(y.val, 0.0);
        assert_eq!(y.eps, 0.0);
        let d = derivative(|x| x.powf(Dual::constant(3.0)), 2.0);
        assert!((d - 12.0).abs() < 1e-12);
    }

    #[test]
    fn comparisons_ignore_tangent() {
        assert!(Dual::new(1.0, 5.0) < Dual::new(2.0, -5.0));
        assert!(Dual::new(1.0, 5.0) <= Dual::new(1.0, -5.0));
    }
}
