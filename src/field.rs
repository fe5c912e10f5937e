//! Arithmetic in a prime field `GF(p)` with `p < 2^63`.

use serde::{Deserialize, Serialize};

/// Errors raised by the field arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// The order is not a prime of the supported size.
    #[error("field order {0} is not a prime in 3..2^63")]
    InvalidOrder(u64),
    /// Zero has no multiplicative inverse.
    #[error("zero is not invertible")]
    NotInvertible,
    /// Interpolation points must be pairwise distinct.
    #[error("duplicate interpolation point {0}")]
    DuplicatePoint(u64),
}

/// The Mersenne prime `2^61 - 1`, the default field order.
pub const MERSENNE_61: u64 = (1 << 61) - 1;

/// A prime field, elements are represented as `u64` values in `0..order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Field {
    order: u64,
}

impl Default for Field {
    fn default() -> Self {
        Self { order: MERSENNE_61 }
    }
}

impl TryFrom<u64> for Field {
    type Error = FieldError;

    fn try_from(order: u64) -> Result<Self, Self::Error> {
        Self::new(order)
    }
}

impl From<Field> for u64 {
    fn from(field: Field) -> Self {
        field.order
    }
}

impl Field {
    /// Creates the field of the given prime order.
    pub fn new(order: u64) -> Result<Self, FieldError> {
        if order < 3 || order >= 1 << 63 || !is_prime(order) {
            return Err(FieldError::InvalidOrder(order));
        }
        Ok(Self { order })
    }

    /// The number of elements in the field.
    pub fn order(self) -> u64 {
        self.order
    }

    /// Maps an arbitrary integer into the field.
    pub fn reduce(self, v: u64) -> u64 {
        v % self.order
    }

    /// Computes `a + b`.
    pub fn add(self, a: u64, b: u64) -> u64 {
        (a + b) % self.order
    }

    /// Computes `a - b`.
    pub fn sub(self, a: u64, b: u64) -> u64 {
        (a + self.order - b) % self.order
    }

    /// Computes `-a`.
    pub fn neg(self, a: u64) -> u64 {
        self.sub(0, a)
    }

    /// Computes `a * b`.
    pub fn mul(self, a: u64, b: u64) -> u64 {
        mul_mod(a, b, self.order)
    }

    /// Computes `base^exp` by square-and-multiply.
    pub fn pow(self, base: u64, exp: u64) -> u64 {
        pow_mod(base, exp, self.order)
    }

    /// The multiplicative inverse, by Fermat's little theorem.
    pub fn inv(self, a: u64) -> Result<u64, FieldError> {
        if a % self.order == 0 {
            return Err(FieldError::NotInvertible);
        }
        Ok(self.pow(a, self.order - 2))
    }

    /// Sums all values.
    pub fn sum(self, values: impl IntoIterator<Item = u64>) -> u64 {
        values.into_iter().fold(0, |acc, v| self.add(acc, v))
    }

    /// The inner product `Σ a_i * b_i`.
    pub fn dot(self, a: &[u64], b: &[u64]) -> u64 {
        a.iter()
            .zip(b)
            .fold(0, |acc, (&a, &b)| self.add(acc, self.mul(a, b)))
    }

    /// Evaluates the polynomial with the given coefficients (constant term first) at `x`.
    pub fn eval(self, coefficients: &[u64], x: u64) -> u64 {
        coefficients
            .iter()
            .rev()
            .fold(0, |acc, &c| self.add(self.mul(acc, x), c))
    }

    /// The Lagrange coefficients `λ_i` such that `f(0) = Σ λ_i * f(points[i])` for every
    /// polynomial `f` of degree below `points.len()`.
    pub fn lagrange_at_zero(self, points: &[u64]) -> Result<Vec<u64>, FieldError> {
        let points: Vec<u64> = points.iter().map(|&p| self.reduce(p)).collect();
        points
            .iter()
            .enumerate()
            .map(|(i, &x_i)| {
                let (num, den) = points.iter().enumerate().filter(|&(j, _)| j != i).try_fold(
                    (1, 1),
                    |(num, den), (_, &x_j)| {
                        if x_j == x_i {
                            return Err(FieldError::DuplicatePoint(x_j));
                        }
                        Ok((self.mul(num, x_j), self.mul(den, self.sub(x_j, x_i))))
                    },
                )?;
                Ok(self.mul(num, self.inv(den)?))
            })
            .collect()
    }

    /// The coefficients (constant term first) of the unique polynomial `f` of degree at
    /// most `values.len() - 1` with `f(x) = values[x]` for `x` in `0..values.len()`.
    pub fn interpolate(self, values: &[u64]) -> Result<Vec<u64>, FieldError> {
        let m = values.len();
        if m as u64 > self.order {
            return Err(FieldError::DuplicatePoint(self.reduce(m as u64)));
        }
        // full = Π (x - k) for k in 0..m
        let mut full = vec![1u64];
        for k in 0..m as u64 {
            let mut next = vec![0u64; full.len() + 1];
            for (d, &c) in full.iter().enumerate() {
                next[d + 1] = self.add(next[d + 1], c);
                next[d] = self.sub(next[d], self.mul(c, k));
            }
            full = next;
        }
        let mut coefficients = vec![0u64; m];
        for (j, &y) in values.iter().enumerate() {
            let y = self.reduce(y);
            if y == 0 {
                continue;
            }
            let x_j = j as u64;
            // basis = full / (x - x_j), by synthetic division
            let mut basis = vec![0u64; m];
            let mut carry = 0;
            for d in (1..=m).rev() {
                carry = self.add(full[d], self.mul(carry, x_j));
                basis[d - 1] = carry;
            }
            let den = (0..m as u64)
                .filter(|&k| k != x_j)
                .fold(1, |den, k| self.mul(den, self.sub(x_j, k)));
            let scale = self.mul(y, self.inv(den)?);
            for (c, b) in coefficients.iter_mut().zip(basis) {
                *c = self.add(*c, self.mul(scale, b));
            }
        }
        Ok(coefficients)
    }
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut acc = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    acc
}

/// Deterministic Miller-Rabin for 64-bit integers.
fn is_prime(n: u64) -> bool {
    const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    if n < 2 {
        return false;
    }
    for p in WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let s = (n - 1).trailing_zeros();
    let d = (n - 1) >> s;
    'witness: for a in WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
