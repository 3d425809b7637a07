#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

fn default_phase_var_test() -> f64 {
    9.0E-4 * 16.0
}

fn default_code_var_test() -> f64 {
    100.0 * 400.0
}

fn default_phase_var_kf() -> f64 {
    9.0E-4 * 16.0
}

fn default_code_var_kf() -> f64 {
    100.0 * 400.0
}

fn default_pos_trans_var() -> f64 {
    1.0E-1
}

fn default_vel_trans_var() -> f64 {
    1.0E-5
}

fn default_int_trans_var() -> f64 {
    1.0E-8
}

fn default_amb_drift_var() -> f64 {
    1.0E-8
}

fn default_pos_init_var() -> f64 {
    1.0E2
}

fn default_vel_init_var() -> f64 {
    4.0E2
}

fn default_amb_init_var() -> f64 {
    1.0E8
}

fn default_new_amb_var() -> f64 {
    1.0E10
}

fn default_amb_acceptance_ratio() -> f64 {
    8.0
}

fn default_amb_search_chi2() -> f64 {
    25.0
}

fn default_max_hypotheses() -> usize {
    1_000
}

fn default_hypothesis_cutoff() -> f64 {
    30.0
}

/// Solver parametrization: measurement and process noise variances,
/// initial uncertainties and the ambiguity resolution tunings.
/// Defined once at deployment; replace it later through
/// [Solver::set_config](crate::prelude::Solver::set_config) only.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Carrier phase variance (cycles²) used when weighting the
    /// baseline queries and hypothesis testing.
    #[cfg_attr(feature = "serde", serde(default = "default_phase_var_test"))]
    pub phase_var_test: f64,

    /// Pseudo range variance (m²) used when weighting the
    /// baseline queries and hypothesis testing.
    #[cfg_attr(feature = "serde", serde(default = "default_code_var_test"))]
    pub code_var_test: f64,

    /// Carrier phase measurement variance (cycles²) in the filter update.
    #[cfg_attr(feature = "serde", serde(default = "default_phase_var_kf"))]
    pub phase_var_kf: f64,

    /// Pseudo range measurement variance (m²) in the filter update.
    #[cfg_attr(feature = "serde", serde(default = "default_code_var_kf"))]
    pub code_var_kf: f64,

    /// Baseline process noise (m².s⁻²: scaled by dt² on prediction).
    #[cfg_attr(feature = "serde", serde(default = "default_pos_trans_var"))]
    pub pos_trans_var: f64,

    /// Velocity process noise (m².s⁻³: scaled by dt on prediction).
    #[cfg_attr(feature = "serde", serde(default = "default_vel_trans_var"))]
    pub vel_trans_var: f64,

    /// Ambiguity transition noise (cycles².s⁻¹) on prediction.
    #[cfg_attr(feature = "serde", serde(default = "default_int_trans_var"))]
    pub int_trans_var: f64,

    /// Slow float ambiguity drift (cycles².s⁻¹) tolerated by the
    /// hypothesis testing between epochs.
    #[cfg_attr(feature = "serde", serde(default = "default_amb_drift_var"))]
    pub amb_drift_var: f64,

    /// Initial baseline variance (m²).
    #[cfg_attr(feature = "serde", serde(default = "default_pos_init_var"))]
    pub pos_init_var: f64,

    /// Initial velocity variance (m².s⁻²).
    #[cfg_attr(feature = "serde", serde(default = "default_vel_init_var"))]
    pub vel_init_var: f64,

    /// Initial ambiguity variance (cycles²).
    #[cfg_attr(feature = "serde", serde(default = "default_amb_init_var"))]
    pub amb_init_var: f64,

    /// Variance (cycles²) assigned to ambiguities of satellites that
    /// rise mid run. Fresh ambiguities start uncorrelated from the
    /// rest of the state and only correlate through later updates.
    #[cfg_attr(feature = "serde", serde(default = "default_new_amb_var"))]
    pub new_amb_var: f64,

    /// Likelihood ratio between the two best integer candidates
    /// required to declare resolution. Strict: an exact tie never
    /// resolves.
    #[cfg_attr(feature = "serde", serde(default = "default_amb_acceptance_ratio"))]
    pub amb_acceptance_ratio: f64,

    /// Squared Mahalanobis radius of the confidence ellipsoid the
    /// hypothesis pool is seeded from.
    #[cfg_attr(feature = "serde", serde(default = "default_amb_search_chi2"))]
    pub amb_search_chi2: f64,

    /// Hard cap on the hypothesis pool size. The enumeration keeps
    /// the closest candidates when the ellipsoid holds more.
    #[cfg_attr(feature = "serde", serde(default = "default_max_hypotheses"))]
    pub max_hypotheses: usize,

    /// Hypotheses whose accumulated log likelihood falls this far
    /// below the pool's best are discarded.
    #[cfg_attr(feature = "serde", serde(default = "default_hypothesis_cutoff"))]
    pub hypothesis_cutoff: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            phase_var_test: default_phase_var_test(),
            code_var_test: default_code_var_test(),
            phase_var_kf: default_phase_var_kf(),
            code_var_kf: default_code_var_kf(),
            pos_trans_var: default_pos_trans_var(),
            vel_trans_var: default_vel_trans_var(),
            int_trans_var: default_int_trans_var(),
            amb_drift_var: default_amb_drift_var(),
            pos_init_var: default_pos_init_var(),
            vel_init_var: default_vel_init_var(),
            amb_init_var: default_amb_init_var(),
            new_amb_var: default_new_amb_var(),
            amb_acceptance_ratio: default_amb_acceptance_ratio(),
            amb_search_chi2: default_amb_search_chi2(),
            max_hypotheses: default_max_hypotheses(),
            hypothesis_cutoff: default_hypothesis_cutoff(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn default_config() {
        let cfg = Config::default();
        assert!(cfg.phase_var_kf > 0.0);
        assert!(cfg.code_var_kf > cfg.phase_var_kf, "code is noisier than phase");
        assert!(cfg.new_amb_var >= cfg.amb_init_var);
        assert!(cfg.amb_acceptance_ratio > 1.0);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn partial_deserialization() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "code_var_kf": 1.0,
                "amb_acceptance_ratio": 3.0
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.code_var_kf, 1.0);
        assert_eq!(cfg.amb_acceptance_ratio, 3.0);
        assert_eq!(cfg.phase_var_kf, super::default_phase_var_kf());
    }
}
