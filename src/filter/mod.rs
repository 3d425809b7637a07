use hifitime::Duration;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::{
    cfg::Config,
    constants::{GEOMETRY_RANK_TOLERANCE, L1_WAVELENGTH_M, PSD_TOLERANCE},
    observation::{DoubleDifferences, SingleDifference},
    prelude::Error,
    sats::{SatelliteSet, SetDiff},
};

/// Baseline variance (m²) assigned when the baseline is supplied
/// by the caller instead of estimated.
const KNOWN_BASELINE_VAR: f64 = 1.0E-4;

/// Sub state offsets inside the estimation vector.
const POS: usize = 0;
const VEL: usize = 3;
const AMB: usize = 6;

/// Weighted least squares baseline from double difference geometry:
/// solves `de_i · b = rhs_i` for the 3D baseline, `variances` carrying
/// one measurement variance per row. Fails on rank deficient geometry
/// (nearly collinear satellites).
pub(crate) fn dd_least_squares(
    geometry: &[Vector3<f64>],
    rhs: &DVector<f64>,
    variances: &[f64],
) -> Result<Vector3<f64>, Error> {
    let n = geometry.len();
    if n < 3 {
        return Err(Error::InsufficientSatellites {
            required: 4,
            found: n + 1,
        });
    }

    let mut de = DMatrix::<f64>::zeros(n, 3);
    let mut w = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for k in 0..3 {
            de[(i, k)] = geometry[i][k];
        }
        w[(i, i)] = 1.0 / variances[i];
    }

    let singular = de.clone().singular_values();
    if singular.min() < GEOMETRY_RANK_TOLERANCE {
        return Err(Error::DegenerateGeometry);
    }

    let det = de.transpose() * &w * &de;
    let det_inv = det.try_inverse().ok_or(Error::MatrixInversion)?;
    let b = det_inv * de.transpose() * w * rhs;

    Ok(Vector3::new(b[0], b[1], b[2]))
}

/// [FloatKalmanFilter] maintains the joint Gaussian estimate over
/// baseline (m), velocity (m/s) and the double differenced carrier
/// ambiguities (cycles) of the current [SatelliteSet]. The mean and
/// covariance only make sense against that set's ordering: rebase
/// before reading them whenever the set changes.
#[derive(Debug, Clone)]
pub struct FloatKalmanFilter {
    sats: SatelliteSet,
    x: DVector<f64>,
    p: DMatrix<f64>,
}

impl FloatKalmanFilter {
    /// Builds the initial state from one epoch of observations:
    /// ambiguities from code minus phase, baseline from a single epoch
    /// pseudo range solution when the geometry allows one.
    /// `sdiffs` ordered like `sats` (pivot first).
    pub(crate) fn new(
        cfg: &Config,
        sats: &SatelliteSet,
        sdiffs: &[SingleDifference],
    ) -> Result<Self, Error> {
        if sdiffs.len() < 2 {
            return Err(Error::InsufficientSatellites {
                required: 2,
                found: sdiffs.len(),
            });
        }

        let dd = DoubleDifferences::new(sdiffs);
        let n = dd.len();
        let ns = AMB + n;

        let mut x = DVector::<f64>::zeros(ns);
        let mut p = DMatrix::<f64>::zeros(ns, ns);

        let variances: Vec<f64> = dd.factors.iter().map(|f| cfg.code_var_test * f).collect();

        match dd_least_squares(&dd.geometry, &dd.code, &variances) {
            Ok(b0) => {
                for k in 0..3 {
                    x[POS + k] = b0[k];
                }
            },
            Err(Error::DegenerateGeometry) => {
                warn!("init: degenerate pseudo range geometry, zero baseline prior");
            },
            Err(_) => {
                // under 4 satellites: the baseline prior absorbs it
            },
        }

        for i in 0..n {
            x[AMB + i] = dd.phase[i] - dd.code[i] / L1_WAVELENGTH_M;
        }

        for k in 0..3 {
            p[(POS + k, POS + k)] = cfg.pos_init_var;
            p[(VEL + k, VEL + k)] = cfg.vel_init_var;
        }
        for i in 0..n {
            p[(AMB + i, AMB + i)] = cfg.amb_init_var;
        }

        debug!("filter initialized over {}", sats);

        Ok(Self {
            sats: sats.clone(),
            x,
            p,
        })
    }

    /// Overrides the estimated baseline with a known truth vector and
    /// re-derives the ambiguities from it. Bootstrapping/testing aid.
    pub(crate) fn set_known_baseline(
        &mut self,
        cfg: &Config,
        baseline: Vector3<f64>,
        sdiffs: &[SingleDifference],
    ) {
        let dd = DoubleDifferences::new(sdiffs);

        for k in 0..3 {
            self.x[POS + k] = baseline[k];
            self.x[VEL + k] = 0.0;
            self.p[(POS + k, POS + k)] = KNOWN_BASELINE_VAR;
        }

        for i in 0..dd.len() {
            self.x[AMB + i] = dd.phase[i] - dd.geometry[i].dot(&baseline) / L1_WAVELENGTH_M;
            self.p[(AMB + i, AMB + i)] = cfg.phase_var_test;
        }
    }

    /// Propagates mean and covariance forward: constant velocity on
    /// the baseline, diagonal process noise everywhere.
    pub(crate) fn predict(&mut self, cfg: &Config, dt: Duration) {
        let dt_s = dt.to_seconds();
        if dt_s <= 0.0 {
            return;
        }

        let ns = self.x.len();

        let mut f = DMatrix::<f64>::identity(ns, ns);
        for k in 0..3 {
            f[(POS + k, VEL + k)] = dt_s;
        }

        self.x = &f * &self.x;
        let mut p = &f * &self.p * f.transpose();

        for k in 0..3 {
            p[(POS + k, POS + k)] += cfg.pos_trans_var * dt_s * dt_s;
            p[(VEL + k, VEL + k)] += cfg.vel_trans_var * dt_s;
        }
        for i in AMB..ns {
            p[(i, i)] += cfg.int_trans_var * dt_s;
        }

        // prediction only adds PSD terms, no clamp needed
        self.p = Self::symmetrized(p);
    }

    /// Measurement update from one epoch of double differenced phase
    /// (cycles) and code (m). `sdiffs` ordered like the current set.
    /// Nothing is committed unless the whole update succeeds.
    pub(crate) fn update(
        &mut self,
        cfg: &Config,
        sdiffs: &[SingleDifference],
        dt: Duration,
    ) -> Result<(), Error> {
        let dd = DoubleDifferences::new(sdiffs);
        let n = dd.len();
        let ns = self.x.len();

        if n != self.sats.num_dd() {
            return Err(Error::InvalidRebase);
        }

        // absorb slow float ambiguity drift before measuring
        let dt_s = dt.to_seconds().max(0.0);
        let mut p = self.p.clone();
        for i in AMB..ns {
            p[(i, i)] += cfg.amb_drift_var * dt_s;
        }

        let mut h = DMatrix::<f64>::zeros(2 * n, ns);
        let mut y = DVector::<f64>::zeros(2 * n);
        let mut r = DMatrix::<f64>::zeros(2 * n, 2 * n);

        for i in 0..n {
            let de = dd.geometry[i];
            for k in 0..3 {
                h[(i, POS + k)] = de[k] / L1_WAVELENGTH_M;
                h[(n + i, POS + k)] = de[k];
            }
            h[(i, AMB + i)] = 1.0;

            y[i] = dd.phase[i];
            y[n + i] = dd.code[i];

            r[(i, i)] = cfg.phase_var_kf * dd.factors[i];
            r[(n + i, n + i)] = cfg.code_var_kf * dd.factors[i];
        }

        let innovation = &y - &h * &self.x;

        let ph_t = &p * h.transpose();
        let s = &h * &ph_t + r;
        let s_inv = s.try_inverse().ok_or(Error::MatrixInversion)?;
        let gain = ph_t * s_inv;

        let x = &self.x + &gain * innovation;
        let p = Self::into_psd((DMatrix::identity(ns, ns) - gain * h) * p)?;

        self.x = x;
        self.p = p;
        Ok(())
    }

    /// Re-expresses the state against a new [SatelliteSet]: retained
    /// ambiguities through the row difference operator, dropped ones
    /// marginalized out, fresh ones seeded from this epoch's code
    /// minus phase with `new_amb_var` and zero cross correlation.
    /// Baseline and velocity carry over untouched.
    pub(crate) fn rebase(
        &mut self,
        cfg: &Config,
        diff: &SetDiff,
        new_sats: &SatelliteSet,
        sdiffs: &[SingleDifference],
    ) -> Result<(), Error> {
        if diff.old_reference != self.sats.reference() {
            return Err(Error::InvalidRebase);
        }
        if diff.kept.len() + diff.dropped.len() != self.sats.num_dd() {
            return Err(Error::InvalidRebase);
        }
        if sdiffs.len() != new_sats.len() {
            return Err(Error::InvalidRebase);
        }

        let (mapping, fresh) = self.sats.dd_transform(new_sats);

        let n_old = self.sats.num_dd();
        let n_new = new_sats.num_dd();
        let ns_new = AMB + n_new;

        let mut m = DMatrix::<f64>::zeros(ns_new, self.x.len());
        for i in 0..AMB {
            m[(i, i)] = 1.0;
        }
        for i in 0..n_new {
            for j in 0..n_old {
                m[(AMB + i, AMB + j)] = mapping[(i, j)];
            }
        }

        let mut x = &m * &self.x;
        let mut p = &m * &self.p * m.transpose();

        if !fresh.is_empty() {
            let dd = DoubleDifferences::new(sdiffs);
            for k in &fresh {
                x[AMB + k] = dd.phase[*k] - dd.code[*k] / L1_WAVELENGTH_M;
                p[(AMB + k, AMB + k)] = cfg.new_amb_var;
            }
            debug!("rebase: {} fresh ambiguities", fresh.len());
        }

        let p = Self::into_psd(p)?;

        self.x = x;
        self.p = p;
        self.sats = new_sats.clone();
        Ok(())
    }

    fn symmetrized(p: DMatrix<f64>) -> DMatrix<f64> {
        (&p + p.transpose()) * 0.5
    }

    /// Symmetrization and positive semi definite clamp. Negative
    /// diagonals within tolerance are floored at zero, anything past
    /// that discards the epoch.
    fn into_psd(p: DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
        let mut p = Self::symmetrized(p);

        let scale = p.diagonal().amax().max(1.0);
        for i in 0..p.nrows() {
            let d = p[(i, i)];
            if d < -PSD_TOLERANCE * scale {
                return Err(Error::DegenerateGeometry);
            }
            if d < 0.0 {
                p[(i, i)] = 0.0;
            }
        }
        Ok(p)
    }

    /// The [SatelliteSet] the state is ordered against.
    pub fn sats(&self) -> &SatelliteSet {
        &self.sats
    }

    /// Raw (mean, covariance) pair, ordered `[baseline | velocity |
    /// ambiguities]`.
    pub fn state(&self) -> (&DVector<f64>, &DMatrix<f64>) {
        (&self.x, &self.p)
    }

    /// Current baseline estimate (m, ECEF).
    pub fn baseline(&self) -> Vector3<f64> {
        Vector3::new(self.x[POS], self.x[POS + 1], self.x[POS + 2])
    }

    /// Current velocity estimate (m/s, ECEF).
    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.x[VEL], self.x[VEL + 1], self.x[VEL + 2])
    }

    pub fn num_ambiguities(&self) -> usize {
        self.sats.num_dd()
    }

    /// Float ambiguity mean, in the set's state order.
    pub fn ambiguity_mean(&self) -> DVector<f64> {
        self.x.rows(AMB, self.num_ambiguities()).into_owned()
    }

    /// Float ambiguity covariance block.
    pub fn ambiguity_covariance(&self) -> DMatrix<f64> {
        let n = self.num_ambiguities();
        self.p.view((AMB, AMB), (n, n)).into_owned()
    }
}
