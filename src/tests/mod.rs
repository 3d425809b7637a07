
use log::LevelFilter;
use std::sync::Once;

use crate::{
    constants::L1_WAVELENGTH_M,
    prelude::{Constellation, SatelliteSet, SingleDifference, Vector3, SV},
};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Debug)
            .init();
    });
}

/// Receiver sitting on the equator at the prime meridian. Local East
/// is +Y (ECEF), North +Z, Up +X: a 1 m East baseline is (0, 1, 0).
pub fn receiver_ecef_m() -> Vector3<f64> {
    Vector3::new(6_378_137.0, 0.0, 0.0)
}

/// Synthetic satellite definition: geometry from elevation/azimuth in
/// the local frame of [receiver_ecef_m], plus the single difference
/// carrier ambiguity (cycles) its observations carry.
#[derive(Debug, Clone)]
pub struct TestSat {
    pub prn: u8,
    pub elev_deg: f64,
    pub az_deg: f64,
    pub amb: f64,
}

impl TestSat {
    pub fn new(prn: u8, elev_deg: f64, az_deg: f64, amb: f64) -> Self {
        Self {
            prn,
            elev_deg,
            az_deg,
            amb,
        }
    }
}

/// Unit line of sight for this elevation/azimuth, in ECEF, seen from
/// [receiver_ecef_m].
pub fn line_of_sight(elev_deg: f64, az_deg: f64) -> Vector3<f64> {
    let (elev, az) = (elev_deg.to_radians(), az_deg.to_radians());
    let east = elev.cos() * az.sin();
    let north = elev.cos() * az.cos();
    let up = elev.sin();
    Vector3::new(up, east, north)
}

/// Noise free single differences for this baseline (m, ECEF).
/// Common receiver clock terms are included on purpose: they must
/// cancel in the double differences.
pub fn sdiffs_for(sats: &[TestSat], baseline: Vector3<f64>) -> Vec<SingleDifference> {
    const CODE_CLOCK_M: f64 = 131.5;
    const PHASE_CLOCK_CYC: f64 = -47.25;

    sats.iter()
        .map(|sat| {
            let los = line_of_sight(sat.elev_deg, sat.az_deg);
            let range = los.dot(&baseline);
            SingleDifference::new(
                SV::new(Constellation::GPS, sat.prn),
                range / L1_WAVELENGTH_M + sat.amb + PHASE_CLOCK_CYC,
                range + CODE_CLOCK_M,
                los,
            )
            .with_elevation_deg(sat.elev_deg)
        })
        .collect()
}

/// Reorders `sdiffs` against the set (pivot first, then state order).
pub fn align_to(sats: &SatelliteSet, sdiffs: &[SingleDifference]) -> Vec<SingleDifference> {
    sats.iter()
        .map(|sv| sdiffs.iter().find(|sd| sd.sv == sv).unwrap().clone())
        .collect()
}
