/// Speed of light in m.s⁻¹
pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// GPS L1 carrier frequency (Hz)
pub const L1_FREQUENCY_HZ: f64 = 1_575.42E6;

/// GPS L1 carrier wavelength (m)
pub const L1_WAVELENGTH_M: f64 = SPEED_OF_LIGHT_M_S / L1_FREQUENCY_HZ;

/// Elevation angle (°) below which the elevation dependent
/// weighting saturates.
pub const MIN_ELEVATION_DEG: f64 = 5.0;

/// Relative tolerance when clamping the state covariance back
/// to positive semi definite. Deviations past this are fatal
/// for the ongoing epoch.
pub const PSD_TOLERANCE: f64 = 1.0E-6;

/// Smallest acceptable singular value of the double difference
/// geometry matrix. Anything below means the satellites are
/// close to collinear and the baseline is unobservable.
pub const GEOMETRY_RANK_TOLERANCE: f64 = 1.0E-3;
