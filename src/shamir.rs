//! Shamir secret sharing: evaluation point of the share with index `i` is `i + 1`.

use rand::Rng;

use crate::field::{Field, FieldError};

/// The default polynomial degree for `n` share holders, the largest `t` with `2t < n`.
pub fn default_degree(n: usize) -> usize {
    n.saturating_sub(1) / 2
}

/// Splits `secret` into `n` shares of a random polynomial of the given degree.
pub fn share(field: Field, secret: u64, degree: usize, n: usize, rng: &mut impl Rng) -> Vec<u64> {
    debug_assert!(degree < n);
    let coefficients: Vec<u64> = std::iter::once(field.reduce(secret))
        .chain((0..degree).map(|_| rng.random_range(0..field.order())))
        .collect();
    (0..n)
        .map(|index| field.eval(&coefficients, index as u64 + 1))
        .collect()
}

/// Shares every secret, returning one share vector per holder: `shares[holder][item]`.
pub fn share_all(
    field: Field,
    secrets: &[u64],
    degree: usize,
    n: usize,
    rng: &mut impl Rng,
) -> Vec<Vec<u64>> {
    let mut shares = vec![Vec::with_capacity(secrets.len()); n];
    for &secret in secrets {
        for (holder, s) in share(field, secret, degree, n, rng).into_iter().enumerate() {
            shares[holder].push(s);
        }
    }
    shares
}

/// Recovers the secret from `(index, share)` pairs by Lagrange interpolation at zero.
///
/// At least `degree + 1` shares must be given.
pub fn reconstruct(field: Field, shares: &[(usize, u64)]) -> Result<u64, FieldError> {
    let points: Vec<u64> = shares.iter().map(|&(index, _)| index as u64 + 1).collect();
    let lambdas = field.lagrange_at_zero(&points)?;
    let values: Vec<u64> = shares.iter().map(|&(_, s)| s).collect();
    Ok(field.dot(&lambdas, &values))
}
