use nalgebra::{DVector, Vector3};

use crate::{
    constants::MIN_ELEVATION_DEG,
    prelude::SV,
};

/// [SingleDifference] is one satellite's rover minus base observation
/// pair, with the geometry the host application resolved for it.
/// Submit one per satellite in sight, every epoch. Sign convention:
/// both differences are rover minus base, and the predicted double
/// difference against pivot `j` is `(e_i - e_j)·b` (meters), where `b`
/// is the base to rover baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleDifference {
    /// [SV] this observation refers to.
    pub sv: SV,

    /// Carrier phase single difference, in L1 cycles.
    pub carrier_phase: f64,

    /// Pseudo range single difference, in meters.
    pub pseudo_range: f64,

    /// Unit line of sight vector, rover to satellite, ECEF.
    pub line_of_sight: Vector3<f64>,

    /// Elevation angle in degrees, when known. Improves the
    /// measurement weighting.
    pub elevation_deg: Option<f64>,

    /// Signal strength (dB.Hz), when known.
    pub snr_dbhz: Option<f64>,
}

impl SingleDifference {
    /// Builds a new [SingleDifference] from the mandatory fields.
    pub fn new(sv: SV, carrier_phase: f64, pseudo_range: f64, line_of_sight: Vector3<f64>) -> Self {
        Self {
            sv,
            carrier_phase,
            pseudo_range,
            line_of_sight,
            elevation_deg: None,
            snr_dbhz: None,
        }
    }

    /// Copies and returns [SingleDifference] with elevation angle (°).
    pub fn with_elevation_deg(mut self, elevation_deg: f64) -> Self {
        self.elevation_deg = Some(elevation_deg);
        self
    }

    /// Copies and returns [SingleDifference] with signal strength (dB.Hz).
    pub fn with_snr_dbhz(mut self, snr_dbhz: f64) -> Self {
        self.snr_dbhz = Some(snr_dbhz);
        self
    }

    /// Variance inflation factor for this observation: 1/sin²(elev),
    /// saturating below [MIN_ELEVATION_DEG]. Unit weight when the
    /// elevation is unknown.
    pub(crate) fn variance_factor(&self) -> f64 {
        match self.elevation_deg {
            Some(elev_deg) => {
                let sin_elev = elev_deg.max(MIN_ELEVATION_DEG).to_radians().sin();
                1.0 / (sin_elev * sin_elev)
            },
            None => 1.0,
        }
    }
}

impl std::fmt::Display for SingleDifference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} sd_cp={:.3} sd_pr={:.3}",
            self.sv, self.carrier_phase, self.pseudo_range
        )
    }
}

/// Double differences of one epoch, formed against the pivot.
/// Built from a slice ordered like the current
/// [SatelliteSet](crate::prelude::SatelliteSet): pivot first, then the
/// non reference members in state order.
pub(crate) struct DoubleDifferences {
    /// Carrier phase double differences (cycles), in state order.
    pub phase: DVector<f64>,

    /// Pseudo range double differences (m), in state order.
    pub code: DVector<f64>,

    /// Line of sight difference `e_i - e_pivot` per double difference.
    pub geometry: Vec<Vector3<f64>>,

    /// Variance inflation factor per double difference. Both
    /// contributing observations add up.
    pub factors: Vec<f64>,
}

impl DoubleDifferences {
    pub fn new(sdiffs: &[SingleDifference]) -> Self {
        let pivot = &sdiffs[0];
        let n = sdiffs.len() - 1;

        let mut phase = DVector::<f64>::zeros(n);
        let mut code = DVector::<f64>::zeros(n);
        let mut geometry = Vec::with_capacity(n);
        let mut factors = Vec::with_capacity(n);

        for (i, sd) in sdiffs.iter().skip(1).enumerate() {
            phase[i] = sd.carrier_phase - pivot.carrier_phase;
            code[i] = sd.pseudo_range - pivot.pseudo_range;
            geometry.push(sd.line_of_sight - pivot.line_of_sight);
            factors.push(sd.variance_factor() + pivot.variance_factor());
        }

        Self {
            phase,
            code,
            geometry,
            factors,
        }
    }

    pub fn len(&self) -> usize {
        self.geometry.len()
    }
}
