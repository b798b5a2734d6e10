/// Dense matrix storage and slice math for the chain objective.
///
/// Matrices are flat f32 buffers in row-major layout with explicit dimensions.
/// Reductions that feed an objective value accumulate in f64; everything the
/// caller sees (network output, derivatives) stays f32.

/// Flat row-major f32 matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Wrap an existing buffer. Panics if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "buffer of {} elements cannot hold a {rows}x{cols} matrix",
            data.len()
        );
        Matrix { data, rows, cols }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn same_shape(&self, other: &Matrix) -> bool {
        self.shape() == other.shape()
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    /// `self[r, c] += v`.
    #[inline]
    pub fn add_at(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] += v;
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn set_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Overwrite with the contents of a same-shaped matrix.
    pub fn copy_from(&mut self, src: &Matrix) {
        assert!(self.same_shape(src), "copy_from: shape {:?} != {:?}", self.shape(), src.shape());
        self.data.copy_from_slice(&src.data);
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, alpha: f32, other: &Matrix) {
        assert!(self.same_shape(other), "add_scaled: shape {:?} != {:?}", self.shape(), other.shape());
        axpy_f32(alpha, &other.data, &mut self.data);
    }

    /// True iff no element is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Sum of squares of all elements, accumulated in f64.
    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }
}

// ── Free-function math on flat slices ────────────────────────────────

/// `y[i] += alpha * x[i]`.
pub fn axpy_f32(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// log(exp(a) + exp(b)) without overflow. Either side may be -inf.
#[inline]
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// log(sum(exp(x))). Returns -inf for an empty slice.
pub fn log_sum_exp(x: &[f64]) -> f64 {
    let max_val = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max_val.is_finite() {
        return max_val;
    }
    let sum: f64 = x.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Column sums of a row-major [rows, cols] buffer, accumulated in f64.
pub fn col_sums_f64(a: &[f32], rows: usize, cols: usize) -> Vec<f64> {
    debug_assert_eq!(a.len(), rows * cols);
    let mut out = vec![0.0f64; cols];
    for r in 0..rows {
        for (o, &v) in out.iter_mut().zip(&a[r * cols..(r + 1) * cols]) {
            *o += v as f64;
        }
    }
    out
}

/// Frobenius dot product: sum_ij A[i,j] * B[i,j], accumulated in f64.
pub fn frobenius_dot_f32(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// L1 norm of an f64 vector.
pub fn l1_norm_f64(a: &[f64]) -> f64 {
    a.iter().map(|v| v.abs()).sum()
}

/// Simple xorshift64 PRNG for deterministic test and benchmark inputs. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Uniform integer in [0, n).
    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
