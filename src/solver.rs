use hifitime::Duration;
use log::debug;
use nalgebra::{DMatrix, DVector, Vector3};

use crate::{
    cfg::Config,
    constants::L1_WAVELENGTH_M,
    filter::{dd_least_squares, FloatKalmanFilter},
    iar::IarEngine,
    observation::{DoubleDifferences, SingleDifference},
    prelude::{Error, SV},
    sats::SatelliteSet,
};

/// One stored double difference row of the latest accepted epoch,
/// kept for the baseline queries.
#[derive(Debug, Clone)]
struct GeometryRow {
    sv: SV,
    /// `e_i - e_pivot`
    line_of_sight: Vector3<f64>,
    /// Phase double difference (cycles)
    dd_phase: f64,
    /// Measurement variance (cycles²)
    variance: f64,
}

/// [Solver] is the per epoch entry point of the DGNSS estimation:
/// it keeps the satellite set bookkeeping, the float Kalman filter
/// and the integer resolution engine consistent with one another,
/// and answers the baseline queries.
///
/// Submit one [SingleDifference] per satellite in sight through
/// [Solver::update], every epoch. An epoch either commits fully or
/// leaves the previous state untouched.
pub struct Solver {
    /// Solver parametrization.
    cfg: Config,
    sats: Option<SatelliteSet>,
    filter: Option<FloatKalmanFilter>,
    iar: Option<IarEngine>,
    geometry: Vec<GeometryRow>,
    receiver_ecef_m: Option<Vector3<f64>>,
}

impl Solver {
    /// Builds a new [Solver] with this [Config]. The first call to
    /// [Solver::update] initializes the estimation.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            sats: None,
            filter: None,
            iar: None,
            geometry: Vec::new(),
            receiver_ecef_m: None,
        }
    }

    /// Current [Config].
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Explicit reconfiguration. Applies from the next epoch on.
    pub fn set_config(&mut self, cfg: Config) {
        self.cfg = cfg;
    }

    /// Processes one epoch: satellite set bookkeeping, possible
    /// rebase of filter and hypothesis pool, prediction, measurement
    /// update, hypothesis testing. `dt` is the time elapsed since the
    /// previous epoch, `receiver_ecef_m` the approximate rover
    /// position the line of sights were resolved against.
    ///
    /// On any error the pre epoch state is fully retained and the
    /// previous outputs remain queryable.
    pub fn update(
        &mut self,
        sdiffs: &[SingleDifference],
        receiver_ecef_m: Vector3<f64>,
        dt: Duration,
    ) -> Result<(), Error> {
        let new_sats = SatelliteSet::select(self.sats.as_ref(), sdiffs)?;
        let aligned = Self::align(sdiffs, &new_sats);

        let (filter, iar) = match (&self.filter, &self.iar, &self.sats) {
            (Some(filter), Some(iar), Some(prev)) => {
                // work on owned copies: commit only on full success
                let mut filter = filter.clone();
                let mut iar = iar.clone();

                let diff = prev.diff(&new_sats);
                if !diff.is_noop() {
                    filter.rebase(&self.cfg, &diff, &new_sats, &aligned)?;

                    if diff.membership_changed() {
                        iar = IarEngine::seed(
                            &self.cfg,
                            &new_sats,
                            &filter.ambiguity_mean(),
                            &filter.ambiguity_covariance(),
                        );
                    } else {
                        iar.rebase_reference(&new_sats)?;
                    }
                }

                filter.predict(&self.cfg, dt);
                filter.update(&self.cfg, &aligned, dt)?;

                iar.test(
                    &self.cfg,
                    &filter.ambiguity_mean(),
                    &filter.ambiguity_covariance(),
                )?;

                (filter, iar)
            },
            _ => {
                let filter = FloatKalmanFilter::new(&self.cfg, &new_sats, &aligned)?;
                let iar = IarEngine::seed(
                    &self.cfg,
                    &new_sats,
                    &filter.ambiguity_mean(),
                    &filter.ambiguity_covariance(),
                );

                debug!("initialized over {}", new_sats);
                (filter, iar)
            },
        };

        self.commit(filter, iar, new_sats, &aligned, receiver_ecef_m);
        Ok(())
    }

    /// Bypasses the estimation: seeds filter and hypothesis pool
    /// directly from an externally known baseline (m, ECEF).
    /// Bootstrapping and testing aid.
    pub fn init_known_baseline(
        &mut self,
        sdiffs: &[SingleDifference],
        receiver_ecef_m: Vector3<f64>,
        baseline: Vector3<f64>,
    ) -> Result<(), Error> {
        let sats = SatelliteSet::select(None, sdiffs)?;
        let aligned = Self::align(sdiffs, &sats);

        let mut filter = FloatKalmanFilter::new(&self.cfg, &sats, &aligned)?;
        filter.set_known_baseline(&self.cfg, baseline, &aligned);

        let ambs = filter.ambiguity_mean();
        let rounded = DVector::from_iterator(ambs.len(), ambs.iter().map(|v| v.round() as i64));
        let iar = IarEngine::seed_known(&sats, rounded);

        self.commit(filter, iar, sats, &aligned, receiver_ecef_m);
        Ok(())
    }

    /// Drops the accumulated resolution evidence and reseeds the
    /// hypothesis pool from the current float estimate.
    pub fn reset_ambiguity_resolution(&mut self) -> Result<(), Error> {
        let filter = self.filter.as_ref().ok_or(Error::UninitializedFilter)?;
        let sats = self.sats.as_ref().ok_or(Error::UninitializedFilter)?;

        self.iar = Some(IarEngine::seed(
            &self.cfg,
            sats,
            &filter.ambiguity_mean(),
            &filter.ambiguity_covariance(),
        ));
        Ok(())
    }

    fn commit(
        &mut self,
        filter: FloatKalmanFilter,
        iar: IarEngine,
        sats: SatelliteSet,
        aligned: &[SingleDifference],
        receiver_ecef_m: Vector3<f64>,
    ) {
        let dd = DoubleDifferences::new(aligned);
        self.geometry = sats
            .dd_sats()
            .enumerate()
            .map(|(i, sv)| GeometryRow {
                sv,
                line_of_sight: dd.geometry[i],
                dd_phase: dd.phase[i],
                variance: self.cfg.phase_var_test * dd.factors[i],
            })
            .collect();

        self.filter = Some(filter);
        self.iar = Some(iar);
        self.sats = Some(sats);
        self.receiver_ecef_m = Some(receiver_ecef_m);
    }

    fn align(sdiffs: &[SingleDifference], sats: &SatelliteSet) -> Vec<SingleDifference> {
        sats.iter()
            .filter_map(|sv| sdiffs.iter().find(|sd| sd.sv == sv).cloned())
            .collect()
    }

    /// Float baseline (m, ECEF) and the number of satellites it was
    /// estimated from. Available from the first epoch on, with wide
    /// uncertainty until the filter converges.
    pub fn float_baseline(&self) -> Result<(Vector3<f64>, usize), Error> {
        let filter = self.filter.as_ref().ok_or(Error::UninitializedFilter)?;
        Ok((filter.baseline(), filter.sats().len()))
    }

    /// Fixed baseline (m, ECEF) and the number of satellites it was
    /// computed from: the deterministic solution obtained by holding
    /// the ambiguities at the resolved integer vector. Requires
    /// resolution and at least 4 satellites in the stored geometry.
    pub fn fixed_baseline(&self) -> Result<(Vector3<f64>, usize), Error> {
        let iar = self.iar.as_ref().ok_or(Error::UninitializedFilter)?;
        let hyp = iar.get_single_hypothesis()?;

        // the pool and the stored geometry must describe the same
        // satellites, in the same order
        if iar
            .sats()
            .dd_sats()
            .zip(self.geometry.iter())
            .any(|(sv, row)| sv != row.sv)
        {
            return Err(Error::InvalidRebase);
        }

        let ambs: Vec<f64> = hyp.iter().map(|v| *v as f64).collect();
        self.baseline_with_ambiguities(&ambs)
    }

    /// Least squares baseline (m, ECEF) for an externally supplied
    /// ambiguity vector, over the latest accepted epoch's geometry.
    pub fn baseline_with_ambiguities(&self, ambs: &[f64]) -> Result<(Vector3<f64>, usize), Error> {
        if self.geometry.is_empty() {
            return Err(Error::UninitializedFilter);
        }
        if self.geometry.len() != ambs.len() {
            return Err(Error::InvalidRebase);
        }

        let n = self.geometry.len();
        if n < 3 {
            return Err(Error::InsufficientSatellites {
                required: 4,
                found: n + 1,
            });
        }

        let geometry: Vec<Vector3<f64>> =
            self.geometry.iter().map(|row| row.line_of_sight).collect();

        let rhs = DVector::from_iterator(
            n,
            self.geometry
                .iter()
                .zip(ambs.iter())
                .map(|(row, amb)| L1_WAVELENGTH_M * (row.dd_phase - amb)),
        );

        let variances: Vec<f64> = self.geometry.iter().map(|row| row.variance).collect();

        let baseline = dd_least_squares(&geometry, &rhs, &variances)?;
        Ok((baseline, n + 1))
    }

    /// The [SatelliteSet] the estimation currently runs on.
    pub fn tracked_satellites(&self) -> Result<&SatelliteSet, Error> {
        self.sats.as_ref().ok_or(Error::UninitializedFilter)
    }

    /// The [SatelliteSet] the hypothesis pool is expressed against.
    /// Trails [Solver::tracked_satellites] only mid rebase.
    pub fn resolution_satellites(&self) -> Result<&SatelliteSet, Error> {
        self.iar
            .as_ref()
            .map(|iar| iar.sats())
            .ok_or(Error::UninitializedFilter)
    }

    /// Float ambiguity mean, in the set's state order.
    pub fn ambiguity_mean(&self) -> Result<DVector<f64>, Error> {
        self.filter
            .as_ref()
            .map(|filter| filter.ambiguity_mean())
            .ok_or(Error::UninitializedFilter)
    }

    /// Float ambiguity covariance block.
    pub fn ambiguity_covariance(&self) -> Result<DMatrix<f64>, Error> {
        self.filter
            .as_ref()
            .map(|filter| filter.ambiguity_covariance())
            .ok_or(Error::UninitializedFilter)
    }

    /// Best scoring integer candidate so far, resolved or not.
    pub fn maximum_likelihood_ambiguities(&self) -> Result<DVector<i64>, Error> {
        self.iar
            .as_ref()
            .and_then(|iar| iar.maximum_likelihood_estimate())
            .ok_or(Error::UninitializedFilter)
    }

    /// True once the integer ambiguities are resolved.
    pub fn is_resolved(&self) -> bool {
        self.iar.as_ref().map(|iar| iar.is_resolved()).unwrap_or(false)
    }

    /// Current hypothesis pool size (0 before the first epoch).
    pub fn num_hypotheses(&self) -> usize {
        self.iar.as_ref().map(|iar| iar.num_hypotheses()).unwrap_or(0)
    }

    /// Resolution engine access, for diagnostics.
    pub fn iar(&self) -> Option<&IarEngine> {
        self.iar.as_ref()
    }

    /// Float filter access, for diagnostics.
    pub fn filter(&self) -> Option<&FloatKalmanFilter> {
        self.filter.as_ref()
    }

    /// Rover position (m, ECEF) the latest geometry was resolved
    /// against.
    pub fn receiver_position(&self) -> Option<Vector3<f64>> {
        self.receiver_ecef_m
    }
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.sats {
            Some(sats) => write!(
                f,
                "Solver({}, {} hypotheses, resolved={})",
                sats,
                self.num_hypotheses(),
                self.is_resolved()
            ),
            None => write!(f, "Solver(uninitialized)"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Solver;
    use crate::{
        prelude::{Config, Duration, Error, Vector3},
        tests::{receiver_ecef_m, sdiffs_for, TestSat},
    };

    #[test]
    fn single_satellite_epoch_leaves_state_unmodified() {
        let cfg = Config::default();
        let mut solver = Solver::new(cfg);

        let baseline = Vector3::new(0.0, 1.0, 0.0);
        let sats_def = vec![
            TestSat::new(1, 40.0, 30.0, 7.0),
            TestSat::new(2, 55.0, 120.0, 4.0),
            TestSat::new(3, 80.0, 200.0, 5.0),
            TestSat::new(4, 35.0, 260.0, 9.0),
            TestSat::new(5, 45.0, 330.0, 5.0),
        ];
        let sdiffs = sdiffs_for(&sats_def, baseline);
        let dt = Duration::from_seconds(1.0);

        solver.update(&sdiffs, receiver_ecef_m(), dt).unwrap();
        solver.update(&sdiffs, receiver_ecef_m(), dt).unwrap();

        let (float_before, used_before) = solver.float_baseline().unwrap();
        let hyps_before = solver.num_hypotheses();

        // one satellite left in sight: no double difference possible
        match solver.update(&sdiffs[..1], receiver_ecef_m(), dt) {
            Err(Error::InsufficientSatellites { required: 2, found: 1 }) => {},
            other => panic!("expected insufficient satellites, got {:?}", other),
        }

        let (float_after, used_after) = solver.float_baseline().unwrap();
        assert_eq!(float_before, float_after);
        assert_eq!(used_before, used_after);
        assert_eq!(hyps_before, solver.num_hypotheses());
    }

    #[test]
    fn queries_before_first_epoch() {
        let solver = Solver::new(Config::default());

        match solver.float_baseline() {
            Err(Error::UninitializedFilter) => {},
            other => panic!("expected uninitialized, got {:?}", other),
        }
        match solver.fixed_baseline() {
            Err(Error::UninitializedFilter) => {},
            other => panic!("expected uninitialized, got {:?}", other),
        }
        assert!(!solver.is_resolved());
        assert_eq!(solver.num_hypotheses(), 0);
    }

    #[test]
    fn fixed_baseline_needs_redundant_geometry() {
        let cfg = Config::default();
        let mut solver = Solver::new(cfg);

        let baseline = Vector3::new(0.0, 1.0, 0.0);
        let sats_def = vec![
            TestSat::new(1, 40.0, 30.0, 7.0),
            TestSat::new(2, 55.0, 120.0, 4.0),
            TestSat::new(3, 80.0, 200.0, 5.0),
        ];
        let sdiffs = sdiffs_for(&sats_def, baseline);

        solver
            .init_known_baseline(&sdiffs, receiver_ecef_m(), baseline)
            .unwrap();

        // singleton pool: the hypothesis is available, the geometry
        // is not redundant enough for a 3D fix
        match solver.fixed_baseline() {
            Err(Error::InsufficientSatellites { required: 4, found: 3 }) => {},
            other => panic!("expected insufficient satellites, got {:?}", other),
        }
    }

    #[test]
    fn known_baseline_bootstrap() {
        let cfg = Config::default();
        let mut solver = Solver::new(cfg);

        let baseline = Vector3::new(0.0, 1.0, 0.0);
        let sats_def = vec![
            TestSat::new(1, 40.0, 30.0, 7.0),
            TestSat::new(2, 55.0, 120.0, 4.0),
            TestSat::new(3, 80.0, 200.0, 5.0),
            TestSat::new(4, 35.0, 260.0, 9.0),
            TestSat::new(5, 45.0, 330.0, 5.0),
        ];
        let sdiffs = sdiffs_for(&sats_def, baseline);

        solver
            .init_known_baseline(&sdiffs, receiver_ecef_m(), baseline)
            .unwrap();

        let (fixed, used) = solver.fixed_baseline().unwrap();
        assert_eq!(used, 5);
        assert!(
            (fixed - baseline).norm() < 1.0E-6,
            "bootstrapped baseline off: {:?}",
            fixed
        );
    }

    #[test]
    fn degenerate_geometry_is_reported() {
        let cfg = Config::default();
        let mut solver = Solver::new(cfg);

        let baseline = Vector3::new(0.0, 1.0, 0.0);

        // four satellites on one great circle: line of sight
        // differences stay coplanar, the 3D baseline is unobservable
        let sats_def = vec![
            TestSat::new(1, 10.0, 90.0, 7.0),
            TestSat::new(2, 40.0, 90.0, 4.0),
            TestSat::new(3, 70.0, 90.0, 5.0),
            TestSat::new(4, 85.0, 90.0, 9.0),
            TestSat::new(5, 30.0, 90.0, 2.0),
        ];
        let sdiffs = sdiffs_for(&sats_def, baseline);

        solver
            .init_known_baseline(&sdiffs, receiver_ecef_m(), baseline)
            .unwrap();

        match solver.fixed_baseline() {
            Err(Error::DegenerateGeometry) => {},
            other => panic!("expected degenerate geometry, got {:?}", other),
        }
    }
}
