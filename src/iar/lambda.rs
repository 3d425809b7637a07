//! Integer least squares search over the float ambiguity estimate
//! (decorrelation + shrinking search, the "LAMBDA" method).

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::prelude::Error;

/// Iteration cap on the shrinking search.
const LOOP_MAX: usize = 10_000;

fn round(x: f64) -> f64 {
    (x + 0.5).floor()
}

fn sign(x: f64) -> f64 {
    if x <= 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// LᵗDL factorization of the symmetric positive definite `q`:
/// `q = Lᵗ·diag(d)·L`, L unit lower triangular.
fn ltdl_factorization(q: &DMatrix<f64>) -> Result<(DMatrix<f64>, DVector<f64>), Error> {
    let n = q.nrows();
    let mut a = q.clone();
    let mut l = DMatrix::<f64>::zeros(n, n);
    let mut d = DVector::<f64>::zeros(n);

    for i in (0..n).rev() {
        d[i] = a[(i, i)];
        if d[i] <= 0.0 {
            return Err(Error::AmbiguityFactorization);
        }

        let sq = d[i].sqrt();
        for j in 0..=i {
            l[(i, j)] = a[(i, j)] / sq;
        }
        for j in 0..i {
            for k in 0..=j {
                a[(j, k)] -= l[(i, k)] * l[(i, j)];
            }
        }
        for j in 0..=i {
            l[(i, j)] /= l[(i, i)];
        }
    }

    Ok((l, d))
}

/// Integer Gauss transformation on column `j` against column `i`.
fn gauss_transform(n: usize, l: &mut DMatrix<f64>, z: &mut DMatrix<f64>, i: usize, j: usize) {
    let mu = round(l[(i, j)]);
    if mu != 0.0 {
        for k in i..n {
            l[(k, j)] -= mu * l[(k, i)];
        }
        for k in 0..n {
            z[(k, j)] -= mu * z[(k, i)];
        }
    }
}

/// Symmetric permutation of entries `j` and `j+1`.
fn permute(
    n: usize,
    l: &mut DMatrix<f64>,
    d: &mut DVector<f64>,
    j: usize,
    del: f64,
    z: &mut DMatrix<f64>,
) {
    let eta = d[j] / del;
    let lam = d[j + 1] * l[(j + 1, j)] / del;

    d[j] = eta * d[j + 1];
    d[j + 1] = del;

    for k in 0..j {
        let a0 = l[(j, k)];
        let a1 = l[(j + 1, k)];
        l[(j, k)] = -l[(j + 1, j)] * a0 + a1;
        l[(j + 1, k)] = eta * a0 + lam * a1;
    }
    l[(j + 1, j)] = lam;

    for k in j + 2..n {
        l.swap((k, j), (k, j + 1));
    }
    for k in 0..n {
        z.swap((k, j), (k, j + 1));
    }
}

/// Lattice reduction: decorrelates the ambiguities through integer
/// Gauss transformations and permutations, accumulating the
/// unimodular map in `z`.
fn decorrelate(n: usize, l: &mut DMatrix<f64>, d: &mut DVector<f64>, z: &mut DMatrix<f64>) {
    let mut j = n as isize - 2;
    let mut k = n as isize - 2;

    while j >= 0 {
        let ju = j as usize;

        if j <= k {
            for i in ju + 1..n {
                gauss_transform(n, l, z, i, ju);
            }
        }

        let del = d[ju] + l[(ju + 1, ju)] * l[(ju + 1, ju)] * d[ju + 1];
        if del + 1.0E-6 < d[ju + 1] {
            permute(n, l, d, ju, del, z);
            k = j;
            j = n as isize - 2;
        } else {
            j -= 1;
        }
    }
}

/// Shrinking search: enumerates the `m` nearest integer vectors to
/// `zs` under the conditional variances `d`, nearest first.
fn search_nearest(
    n: usize,
    m: usize,
    l: &DMatrix<f64>,
    d: &DVector<f64>,
    zs: &DVector<f64>,
) -> (Vec<DVector<f64>>, Vec<f64>) {
    let mut max_dist = 1.0E99;

    let mut s_mat = DMatrix::<f64>::zeros(n, n);
    let mut dist = vec![0.0; n];
    let mut zb = vec![0.0; n];
    let mut z = vec![0.0; n];
    let mut step = vec![0.0; n];

    let mut candidates: Vec<DVector<f64>> = Vec::with_capacity(m);
    let mut dists: Vec<f64> = Vec::with_capacity(m);
    let mut imax = 0_usize;

    let mut k = n - 1;
    dist[k] = 0.0;
    zb[k] = zs[k];
    z[k] = round(zb[k]);
    let mut y = zb[k] - z[k];
    step[k] = sign(y);

    let mut c = 0;
    while c < LOOP_MAX {
        let newdist = dist[k] + y * y / d[k];
        if newdist < max_dist {
            if k != 0 {
                // move down
                k -= 1;
                dist[k] = newdist;
                for i in 0..=k {
                    s_mat[(k, i)] = s_mat[(k + 1, i)] + (z[k + 1] - zb[k + 1]) * l[(k + 1, i)];
                }
                zb[k] = zs[k] + s_mat[(k, k)];
                z[k] = round(zb[k]);
                y = zb[k] - z[k];
                step[k] = sign(y);
            } else {
                // leaf: store the candidate, shrink once the pool is full
                if candidates.len() < m {
                    if candidates.is_empty() || newdist > dists[imax] {
                        imax = candidates.len();
                    }
                    candidates.push(DVector::from_row_slice(&z));
                    dists.push(newdist);
                } else {
                    if newdist < dists[imax] {
                        candidates[imax] = DVector::from_row_slice(&z);
                        dists[imax] = newdist;
                        imax = 0;
                        for i in 0..dists.len() {
                            if dists[imax] < dists[i] {
                                imax = i;
                            }
                        }
                    }
                    max_dist = dists[imax];
                }
                z[0] += step[0];
                y = zb[0] - z[0];
                step[0] = -step[0] - sign(step[0]);
            }
        } else {
            // exit or move up
            if k == n - 1 {
                break;
            }
            k += 1;
            z[k] += step[k];
            y = zb[k] - z[k];
            step[k] = -step[k] - sign(step[k]);
        }
        c += 1;
    }

    if c >= LOOP_MAX {
        warn!("ambiguity search loop overflow (ndf={})", n);
    }

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| dists[*a].partial_cmp(&dists[*b]).unwrap());

    (
        order.iter().map(|i| candidates[*i].clone()).collect(),
        order.iter().map(|i| dists[*i]).collect(),
    )
}

/// Enumerates up to `m` integer vectors closest (in the Mahalanobis
/// sense) to the float estimate `mean` under covariance `cov`.
/// Returns (candidate, squared distance) pairs, nearest first.
pub(crate) fn search(
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    m: usize,
) -> Result<Vec<(DVector<i64>, f64)>, Error> {
    let n = mean.len();
    if n == 0 || m == 0 {
        return Ok(Vec::new());
    }

    let (mut l, mut d) = ltdl_factorization(cov)?;

    let mut z_mat = DMatrix::<f64>::identity(n, n);
    decorrelate(n, &mut l, &mut d, &mut z_mat);

    let zs = z_mat.transpose() * mean;
    let (cands, dists) = search_nearest(n, m, &l, &d, &zs);

    // back to the original basis: zᵗ is unimodular, its inverse maps
    // integers onto integers
    let zt_inv = z_mat
        .transpose()
        .try_inverse()
        .ok_or(Error::AmbiguityInverse)?;

    let mut out = Vec::with_capacity(cands.len());
    for (cand, dist) in cands.iter().zip(dists.iter()) {
        let f = &zt_inv * cand;
        let ambs = DVector::from_iterator(n, f.iter().map(|v| round(*v) as i64));
        out.push((ambs, *dist));
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::{ltdl_factorization, search};
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn ltdl_roundtrip() {
        let q = DMatrix::<f64>::from_row_slice(
            3,
            3,
            &[6.29, 5.978, 0.544, 5.978, 6.292, 2.34, 0.544, 2.34, 6.288],
        );

        let (l, d) = ltdl_factorization(&q).unwrap();
        let rebuilt = l.transpose() * DMatrix::from_diagonal(&d) * &l;

        assert!(
            (&rebuilt - &q).amax() < 1.0E-9,
            "LtDL does not rebuild Q: {}",
            rebuilt
        );
    }

    #[test]
    fn not_positive_definite() {
        let q = DMatrix::<f64>::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(ltdl_factorization(&q).is_err());
    }

    #[test]
    fn identity_covariance_search() {
        let mean = DVector::from_row_slice(&[1.2, -3.8, 0.1]);
        let cov = DMatrix::<f64>::identity(3, 3);

        let cands = search(&mean, &cov, 2).unwrap();
        assert_eq!(cands.len(), 2);

        // nearest is plain rounding under an identity covariance
        assert_eq!(cands[0].0.as_slice(), &[1, -4, 0]);
        assert!(cands[0].1 <= cands[1].1, "candidates must come nearest first");

        let expected = 0.2_f64.powi(2) + 0.2_f64.powi(2) + 0.1_f64.powi(2);
        assert!((cands[0].1 - expected).abs() < 1.0E-9);
    }

    #[test]
    fn mlambda_search() {
        // canonical 6 ambiguity regression case
        let mean = DVector::from_row_slice(&[
            1585184.171,
            -6716599.430,
            3915742.905,
            7627233.455,
            9565990.879,
            989457273.200,
        ]);

        let cov = DMatrix::<f64>::from_row_slice(
            6,
            6,
            &[
                0.227134, 0.112202, 0.112202, 0.112202, 0.112202, 0.103473, //
                0.112202, 0.227134, 0.112202, 0.112202, 0.112202, 0.103473, //
                0.112202, 0.112202, 0.227134, 0.112202, 0.112202, 0.103473, //
                0.112202, 0.112202, 0.112202, 0.227134, 0.112202, 0.103473, //
                0.112202, 0.112202, 0.112202, 0.112202, 0.227134, 0.103473, //
                0.103473, 0.103473, 0.103473, 0.103473, 0.103473, 0.434339,
            ],
        );

        let cands = search(&mean, &cov, 2).unwrap();
        assert_eq!(cands.len(), 2);

        let best: Vec<i64> = cands[0].0.iter().copied().collect();
        let second: Vec<i64> = cands[1].0.iter().copied().collect();

        assert_eq!(
            best,
            vec![1585184, -6716599, 3915743, 7627234, 9565991, 989457273]
        );
        assert_eq!(
            second,
            vec![1585184, -6716600, 3915743, 7627233, 9565991, 989457273]
        );

        assert!((cands[0].1 - 3.507984).abs() < 1.0E-4);
        assert!((cands[1].1 - 3.708456).abs() < 1.0E-4);
    }
}
