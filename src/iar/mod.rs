use itertools::Itertools;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::{
    cfg::Config,
    prelude::Error,
    sats::SatelliteSet,
};

mod lambda;

/// Resolution state machine. [ResolutionState::Resolved] is terminal
/// until the next rebase or reset.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub enum ResolutionState {
    /// Pool freshly enumerated, no evidence accumulated yet.
    #[default]
    Seeded,
    /// Pool being pruned across epochs.
    Searching,
    /// Pool collapsed onto one winning candidate.
    Resolved,
}

/// One candidate integer ambiguity vector and its accumulated
/// log likelihood.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Candidate double differenced integer ambiguities, in the
    /// current set's state order.
    pub ambs: DVector<i64>,

    /// Accumulated log likelihood. Only differences between pool
    /// members are meaningful.
    pub log_likelihood: f64,
}

/// [IarEngine] turns the float ambiguity estimate into a fixed
/// integer vector: it enumerates candidates around the float mean,
/// scores them as epochs come in, and declares resolution once the
/// best candidate dominates the runner up by the configured ratio.
#[derive(Debug, Clone)]
pub struct IarEngine {
    sats: SatelliteSet,
    pool: Vec<Hypothesis>,
    state: ResolutionState,
}

impl IarEngine {
    /// Seeds the hypothesis pool from the float estimate: integer
    /// least squares enumeration, bounded by the configured
    /// confidence ellipsoid and pool cap. Falls back to the rounded
    /// float mean when the covariance cannot be factorized.
    pub(crate) fn seed(
        cfg: &Config,
        sats: &SatelliteSet,
        mean: &DVector<f64>,
        cov: &DMatrix<f64>,
    ) -> Self {
        let q = (cov + cov.transpose()) * 0.5;

        let mut pool = Vec::new();

        match lambda::search(mean, &q, cfg.max_hypotheses) {
            Ok(candidates) => {
                for (i, (ambs, dist)) in candidates.into_iter().enumerate() {
                    // the best candidate survives the ellipsoid bound
                    if i == 0 || dist <= cfg.amb_search_chi2 {
                        pool.push(Hypothesis {
                            ambs,
                            log_likelihood: -0.5 * dist,
                        });
                    }
                }
            },
            Err(e) => {
                warn!("iar: enumeration failed ({}), single rounded candidate", e);
            },
        }

        if pool.is_empty() {
            let rounded =
                DVector::from_iterator(mean.len(), mean.iter().map(|v| v.round() as i64));
            pool.push(Hypothesis {
                ambs: rounded,
                log_likelihood: 0.0,
            });
        }

        debug!("iar: {} hypotheses seeded over {}", pool.len(), sats);

        Self {
            sats: sats.clone(),
            pool,
            state: ResolutionState::Seeded,
        }
    }

    /// Seeds a singleton pool from an externally known integer
    /// vector (known baseline bootstrap).
    pub(crate) fn seed_known(sats: &SatelliteSet, ambs: DVector<i64>) -> Self {
        Self {
            sats: sats.clone(),
            pool: vec![Hypothesis {
                ambs,
                log_likelihood: 0.0,
            }],
            state: ResolutionState::Seeded,
        }
    }

    /// Re-expresses every hypothesis against a new pivot, same
    /// membership. The accumulated evidence does not carry over a
    /// basis change: scores reset and searching restarts.
    pub(crate) fn rebase_reference(&mut self, new_sats: &SatelliteSet) -> Result<(), Error> {
        if new_sats.num_dd() != self.sats.num_dd() {
            return Err(Error::InvalidRebase);
        }

        let (mapping, fresh) = self.sats.dd_transform(new_sats);
        if !fresh.is_empty() {
            return Err(Error::InvalidRebase);
        }

        let n = new_sats.num_dd();
        for hyp in self.pool.iter_mut() {
            let mut ambs = DVector::<i64>::zeros(n);
            for i in 0..n {
                for j in 0..n {
                    ambs[i] += (mapping[(i, j)] as i64) * hyp.ambs[j];
                }
            }
            hyp.ambs = ambs;
            hyp.log_likelihood = 0.0;
        }

        info!(
            "iar: pool re-referenced {} -> {}",
            self.sats.reference(),
            new_sats.reference()
        );

        self.sats = new_sats.clone();
        self.state = ResolutionState::Seeded;
        Ok(())
    }

    /// One epoch of hypothesis testing against the updated float
    /// estimate: accumulate log likelihoods, prune the stragglers,
    /// declare resolution on a strict ratio win.
    pub(crate) fn test(
        &mut self,
        cfg: &Config,
        mean: &DVector<f64>,
        cov: &DMatrix<f64>,
    ) -> Result<(), Error> {
        if mean.len() != self.sats.num_dd() {
            return Err(Error::InvalidRebase);
        }

        if self.state == ResolutionState::Resolved {
            return Ok(());
        }

        let q = (cov + cov.transpose()) * 0.5;
        let q_inv = q.try_inverse().ok_or(Error::MatrixInversion)?;

        for hyp in self.pool.iter_mut() {
            let r = DVector::from_iterator(
                mean.len(),
                hyp.ambs.iter().zip(mean.iter()).map(|(a, m)| m - *a as f64),
            );
            hyp.log_likelihood -= 0.5 * r.dot(&(&q_inv * &r));
        }

        let best = self
            .pool
            .iter()
            .map(|hyp| hyp.log_likelihood)
            .fold(f64::NEG_INFINITY, f64::max);

        let cutoff = best - cfg.hypothesis_cutoff;
        let before = self.pool.len();
        self.pool.retain(|hyp| hyp.log_likelihood >= cutoff);

        if self.pool.len() < before {
            debug!(
                "iar: pruned {} hypotheses ({} remain)",
                before - self.pool.len(),
                self.pool.len()
            );
        }

        self.state = ResolutionState::Searching;

        if self.pool.len() == 1 {
            info!("iar: resolved (pool collapsed) {:?}", self.pool[0].ambs.as_slice());
            self.state = ResolutionState::Resolved;
        } else {
            let two_best: Vec<f64> = self
                .pool
                .iter()
                .map(|hyp| hyp.log_likelihood)
                .sorted_by(|a, b| b.partial_cmp(a).unwrap())
                .take(2)
                .collect();

            // strict: an exact tie never resolves
            if two_best[0] - two_best[1] > cfg.amb_acceptance_ratio.ln() {
                info!(
                    "iar: resolved (ratio test) {:?}",
                    self.best_hypothesis().ambs.as_slice()
                );
                self.state = ResolutionState::Resolved;
            }
        }

        Ok(())
    }

    fn best_hypothesis(&self) -> &Hypothesis {
        self.pool
            .iter()
            .max_by(|a, b| a.log_likelihood.partial_cmp(&b.log_likelihood).unwrap())
            .unwrap_or_else(|| panic!("internal error: empty hypothesis pool"))
    }

    /// True once one candidate statistically dominates.
    pub fn is_resolved(&self) -> bool {
        self.state == ResolutionState::Resolved
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    /// Current pool size.
    pub fn num_hypotheses(&self) -> usize {
        self.pool.len()
    }

    /// Number of satellites the hypotheses span (pivot included).
    pub fn num_satellites(&self) -> usize {
        self.sats.len()
    }

    /// The [SatelliteSet] the pool is expressed against.
    pub fn sats(&self) -> &SatelliteSet {
        &self.sats
    }

    /// The resolved integer vector. Only available once resolved, or
    /// trivially when a single candidate remains.
    pub fn get_single_hypothesis(&self) -> Result<DVector<i64>, Error> {
        if self.is_resolved() || self.pool.len() == 1 {
            Ok(self.best_hypothesis().ambs.clone())
        } else {
            Err(Error::NotResolved)
        }
    }

    /// Best scoring candidate so far, resolved or not.
    pub fn maximum_likelihood_estimate(&self) -> Option<DVector<i64>> {
        if self.pool.is_empty() {
            None
        } else {
            Some(self.best_hypothesis().ambs.clone())
        }
    }

    /// Membership test, for diagnostics.
    pub fn pool_contains(&self, candidate: &[i64]) -> bool {
        self.pool.iter().any(|hyp| hyp.ambs.as_slice() == candidate)
    }
}

#[cfg(test)]
mod test {
    use super::{IarEngine, ResolutionState};
    use crate::prelude::{Config, Error, SatelliteSet, SingleDifference, Vector3, SV};
    use gnss_rs::prelude::Constellation;
    use nalgebra::{DMatrix, DVector};

    fn test_set(prns: &[u8]) -> SatelliteSet {
        let sdiffs: Vec<SingleDifference> = prns
            .iter()
            .map(|prn| {
                SingleDifference::new(
                    SV::new(Constellation::GPS, *prn),
                    0.0,
                    0.0,
                    Vector3::new(0.0, 0.0, 1.0),
                )
            })
            .collect();
        SatelliteSet::select(None, &sdiffs).unwrap()
    }

    #[test]
    fn seeding_and_contains() {
        let cfg = Config::default();
        let sats = test_set(&[1, 2, 3]);

        let mean = DVector::from_row_slice(&[2.1, -0.9]);
        let cov = DMatrix::<f64>::identity(2, 2) * 0.01;

        let iar = IarEngine::seed(&cfg, &sats, &mean, &cov);

        assert_eq!(iar.state(), ResolutionState::Seeded);
        assert_eq!(iar.num_satellites(), 3);
        assert!(iar.num_hypotheses() >= 1);
        assert!(iar.pool_contains(&[2, -1]), "rounded mean must be seeded");

        assert_eq!(
            iar.maximum_likelihood_estimate().unwrap().as_slice(),
            &[2, -1]
        );
    }

    #[test]
    fn not_resolved_until_dominant() {
        let mut cfg = Config::default();
        cfg.amb_acceptance_ratio = 8.0;

        let sats = test_set(&[1, 2, 3]);

        // wide float estimate: many candidates, no winner
        let mean = DVector::from_row_slice(&[0.5, 0.5]);
        let cov = DMatrix::<f64>::identity(2, 2) * 100.0;

        let mut iar = IarEngine::seed(&cfg, &sats, &mean, &cov);
        assert!(iar.num_hypotheses() > 1);

        match iar.get_single_hypothesis() {
            Err(Error::NotResolved) => {},
            other => panic!("expected NotResolved, got {:?}", other),
        }

        iar.test(&cfg, &mean, &cov).unwrap();
        assert_eq!(iar.state(), ResolutionState::Searching);
        assert!(!iar.is_resolved(), "symmetric evidence must not resolve");
    }

    #[test]
    fn sharp_evidence_resolves() {
        let cfg = Config::default();
        let sats = test_set(&[1, 2, 3]);

        let mean = DVector::from_row_slice(&[3.02, -4.98]);
        let wide = DMatrix::<f64>::identity(2, 2) * 4.0;

        let mut iar = IarEngine::seed(&cfg, &sats, &mean, &wide);
        let seeded = iar.num_hypotheses();
        assert!(seeded > 1);

        // consistent, tightening float estimates
        let sharp = DMatrix::<f64>::identity(2, 2) * 1.0E-4;
        for _ in 0..10 {
            iar.test(&cfg, &mean, &sharp).unwrap();
            assert!(iar.num_hypotheses() <= seeded, "pool must never grow");
            if iar.is_resolved() {
                break;
            }
        }

        assert!(iar.is_resolved());
        assert_eq!(iar.get_single_hypothesis().unwrap().as_slice(), &[3, -5]);
    }

    #[test]
    fn singleton_pool_is_trivially_available() {
        let sats = test_set(&[1, 2]);
        let iar = IarEngine::seed_known(&sats, DVector::from_row_slice(&[7]));

        assert!(!iar.is_resolved());
        assert_eq!(iar.get_single_hypothesis().unwrap().as_slice(), &[7]);
    }

    #[test]
    fn pivot_change_rebases_pool() {
        let cfg = Config::default();

        // ref=3 after election (highest by PRN tie break on equal
        // elevations: explicit elevations force it)
        let sdiffs: Vec<SingleDifference> = [(1, 30.0), (2, 40.0), (3, 80.0)]
            .iter()
            .map(|(prn, elev)| {
                SingleDifference::new(
                    SV::new(Constellation::GPS, *prn),
                    0.0,
                    0.0,
                    Vector3::new(0.0, 0.0, 1.0),
                )
                .with_elevation_deg(*elev)
            })
            .collect();
        let sats = SatelliteSet::select(None, &sdiffs).unwrap();
        assert_eq!(sats.reference().prn, 3);

        let mean = DVector::from_row_slice(&[7.1, -2.9]);
        let cov = DMatrix::<f64>::identity(2, 2) * 0.01;
        let mut iar = IarEngine::seed(&cfg, &sats, &mean, &cov);
        assert!(iar.pool_contains(&[7, -3]));

        // pivot moves to 1: N'(2) = N(2) - N(1), N'(3) = -N(1)
        let sdiffs_b: Vec<SingleDifference> = [(1, 85.0), (2, 40.0), (3, 10.0)]
            .iter()
            .map(|(prn, elev)| {
                SingleDifference::new(
                    SV::new(Constellation::GPS, *prn),
                    0.0,
                    0.0,
                    Vector3::new(0.0, 0.0, 1.0),
                )
                .with_elevation_deg(*elev)
            })
            .collect();
        let new_sats = SatelliteSet::select(None, &sdiffs_b).unwrap();
        assert_eq!(new_sats.reference().prn, 1);

        iar.rebase_reference(&new_sats).unwrap();

        assert_eq!(iar.state(), ResolutionState::Seeded);
        assert!(iar.pool_contains(&[-10, -7]));
    }

    #[test]
    fn inconsistent_rebase_is_fatal() {
        let cfg = Config::default();
        let sats = test_set(&[1, 2, 3]);

        let mean = DVector::from_row_slice(&[1.0, 2.0]);
        let cov = DMatrix::<f64>::identity(2, 2);
        let mut iar = IarEngine::seed(&cfg, &sats, &mean, &cov);

        let smaller = test_set(&[1, 2]);
        match iar.rebase_reference(&smaller) {
            Err(Error::InvalidRebase) => {},
            other => panic!("expected InvalidRebase, got {:?}", other),
        }
    }
}
