use crate::traits::DynamicalSystem;

/// Mixed absolute/relative error tolerance over the first `dims` components
/// of the state. Components past `dims` (sensitivities) are integrated but
/// not error controlled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
    pub dims: usize,
}

impl Tolerance {
    /// Weighted RMS norm of `v`, scaled by `abs + rel * max(|a|, |b|)`.
    pub fn norm(&self, v: &[f64], a: &[f64], b: &[f64]) -> f64 {
        if self.dims == 0 {
            return 0.0;
        }
        let sum: f64 = (0..self.dims)
            .map(|i| {
                let scale = self.abs + self.rel * a[i].abs().max(b[i].abs());
                let r = v[i] / scale;
                r * r
            })
            .sum();
        (sum / self.dims as f64).sqrt()
    }
}

/// Dormand-Prince 5(4) embedded Runge-Kutta pair.
///
/// Only single attempts are made here; accepting, rejecting and choosing the
/// next step size is up to the caller, which also owns event handling.
pub struct DormandPrince {
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    tmp: Vec<f64>,
    err: Vec<f64>,
}

impl DormandPrince {
    pub const ORDER: i32 = 5;

    const C2: f64 = 1.0 / 5.0;
    const C3: f64 = 3.0 / 10.0;
    const C4: f64 = 4.0 / 5.0;
    const C5: f64 = 8.0 / 9.0;

    const A21: f64 = 1.0 / 5.0;
    const A31: f64 = 3.0 / 40.0;
    const A32: f64 = 9.0 / 40.0;
    const A41: f64 = 44.0 / 45.0;
    const A42: f64 = -56.0 / 15.0;
    const A43: f64 = 32.0 / 9.0;
    const A51: f64 = 19372.0 / 6561.0;
    const A52: f64 = -25360.0 / 2187.0;
    const A53: f64 = 64448.0 / 6561.0;
    const A54: f64 = -212.0 / 729.0;
    const A61: f64 = 9017.0 / 3168.0;
    const A62: f64 = -355.0 / 33.0;
    const A63: f64 = 46732.0 / 5247.0;
    const A64: f64 = 49.0 / 176.0;
    const A65: f64 = -5103.0 / 18656.0;

    // 5th order weights; the last stage is evaluated at the new point.
    const B1: f64 = 35.0 / 384.0;
    const B3: f64 = 500.0 / 1113.0;
    const B4: f64 = 125.0 / 192.0;
    const B5: f64 = -2187.0 / 6784.0;
    const B6: f64 = 11.0 / 84.0;

    // Difference between the 5th and embedded 4th order weights.
    const E1: f64 = 71.0 / 57600.0;
    const E3: f64 = -71.0 / 16695.0;
    const E4: f64 = 71.0 / 1920.0;
    const E5: f64 = -17253.0 / 339200.0;
    const E6: f64 = 22.0 / 525.0;
    const E7: f64 = -1.0 / 40.0;

    pub fn new(dim: usize) -> Self {
        Self {
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            tmp: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    /// Attempts a step of size `h` from `(t, y)`, where `k1 = f(t, y)`.
    ///
    /// Writes the 5th order solution to `y_new` and `f(t + h, y_new)` to
    /// `f_new`, and returns the scaled error norm (accept if `<= 1`). A
    /// non-finite candidate gives an infinite error.
    #[allow(clippy::too_many_arguments)]
    pub fn attempt(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: f64,
        y: &[f64],
        k1: &[f64],
        h: f64,
        tol: &Tolerance,
        y_new: &mut [f64],
        f_new: &mut [f64],
    ) -> f64 {
        let n = y.len();

        for i in 0..n {
            self.tmp[i] = y[i] + h * Self::A21 * k1[i];
        }
        system.apply(t + Self::C2 * h, &self.tmp, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = y[i] + h * (Self::A31 * k1[i] + Self::A32 * self.k2[i]);
        }
        system.apply(t + Self::C3 * h, &self.tmp, &mut self.k3);

        for i in 0..n {
            self.tmp[i] =
                y[i] + h * (Self::A41 * k1[i] + Self::A42 * self.k2[i] + Self::A43 * self.k3[i]);
        }
        system.apply(t + Self::C4 * h, &self.tmp, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = y[i]
                + h * (Self::A51 * k1[i]
                    + Self::A52 * self.k2[i]
                    + Self::A53 * self.k3[i]
                    + Self::A54 * self.k4[i]);
        }
        system.apply(t + Self::C5 * h, &self.tmp, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = y[i]
                + h * (Self::A61 * k1[i]
                    + Self::A62 * self.k2[i]
                    + Self::A63 * self.k3[i]
                    + Self::A64 * self.k4[i]
                    + Self::A65 * self.k5[i]);
        }
        system.apply(t + h, &self.tmp, &mut self.k6);

        for i in 0..n {
            y_new[i] = y[i]
                + h * (Self::B1 * k1[i]
                    + Self::B3 * self.k3[i]
                    + Self::B4 * self.k4[i]
                    + Self::B5 * self.k5[i]
                    + Self::B6 * self.k6[i]);
        }
        system.apply(t + h, y_new, f_new);

        if y_new.iter().chain(f_new.iter()).any(|v| !v.is_finite()) {
            return f64::INFINITY;
        }

        for i in 0..n {
            self.err[i] = h
                * (Self::E1 * k1[i]
                    + Self::E3 * self.k3[i]
                    + Self::E4 * self.k4[i]
                    + Self::E5 * self.k5[i]
                    + Self::E6 * self.k6[i]
                    + Self::E7 * f_new[i]);
        }
        let norm = tol.norm(&self.err, y, y_new);
        if norm.is_finite() {
            norm
        } else {
            f64::INFINITY
        }
    }
}

/// Initial step size estimate (Hairer, Norsett & Wanner, II.4).
/// Costs one extra evaluation of `system`.
pub fn initial_step(
    system: &mut impl DynamicalSystem,
    t: f64,
    y: &[f64],
    f0: &[f64],
    tol: &Tolerance,
    order: i32,
) -> f64 {
    let zeros = vec![0.0; y.len()];
    let d0 = tol.norm(y, y, &zeros);
    let d1 = tol.norm(f0, y, &zeros);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };

    let y1: Vec<f64> = y.iter().zip(f0).map(|(yi, fi)| yi + h0 * fi).collect();
    let mut f1 = vec![0.0; y.len()];
    system.apply(t + h0, &y1, &mut f1);
    let diff: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| a - b).collect();
    let d2 = tol.norm(&diff, y, &zeros) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / f64::from(order))
    };
    let h = (100.0 * h0).min(h1);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        h0
    }
}

/// Cubic Hermite interpolation between two points of a step of size `h`,
/// using the derivatives at both ends. `theta` is in `[0, 1]`.
pub fn hermite(theta: f64, h: f64, y0: &[f64], y1: &[f64], f0: &[f64], f1: &[f64], out: &mut [f64]) {
    let (w00, w10, w01, w11) = hermite_weights(theta);
    for i in 0..out.len() {
        out[i] = w00 * y0[i] + w10 * h * f0[i] + w01 * y1[i] + w11 * h * f1[i];
    }
}

/// Single-component variant of [`hermite`].
pub fn hermite_component(theta: f64, h: f64, y0: f64, y1: f64, f0: f64, f1: f64) -> f64 {
    let (w00, w10, w01, w11) = hermite_weights(theta);
    w00 * y0 + w10 * h * f0 + w01 * y1 + w11 * h * f1
}

fn hermite_weights(theta: f64) -> (f64, f64, f64, f64) {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    (
        2.0 * t3 - 3.0 * t2 + 1.0,
        t3 - 2.0 * t2 + theta,
        -2.0 * t3 + 3.0 * t2,
        t3 - t2,
    )
}
