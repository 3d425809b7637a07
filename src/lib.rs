#![doc = include_str!("../README.md")]
#![cfg_attr(docrs, feature(doc_cfg))]

extern crate gnss_rs as gnss;

// private modules
mod cfg;
mod constants;
mod error;
mod filter;
mod iar;
mod observation;
mod sats;
mod solver;

#[cfg(test)]
mod tests;

// prelude
pub mod prelude {
    pub use crate::cfg::Config;
    pub use crate::error::Error;
    pub use crate::filter::FloatKalmanFilter;
    pub use crate::iar::{Hypothesis, IarEngine, ResolutionState};
    pub use crate::observation::SingleDifference;
    pub use crate::sats::{SatelliteSet, SetDiff};
    pub use crate::solver::Solver;
    // re-export
    pub use gnss::prelude::{Constellation, SV};
    pub use hifitime::{Duration, Epoch};
    pub use nalgebra::{DMatrix, DVector, Vector3};
}

// pub export
pub use error::Error;
