//! Application constants for the reanalysis processor
//!
//! This module contains default values, physical constants and naming
//! tokens used throughout the pipeline.

// =============================================================================
// Physical Constants
// =============================================================================

/// Seconds per day; daily accumulations are divided by this to get rates
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Standard gravity in m s-2, converts geopotential to geopotential height
pub const STANDARD_GRAVITY: f64 = 9.806_65;

/// Fraction to percent
pub const PERCENT: f64 = 100.0;

/// Fill value assigned to derived fields
pub const DERIVED_FILL_VALUE: f64 = 1.0e20;

// =============================================================================
// Chunking Defaults
// =============================================================================

/// Default chunk length along time
pub const DEFAULT_TIME_CHUNK: usize = 1;

/// Default chunk length along latitude
pub const DEFAULT_LAT_CHUNK: usize = 46;

/// Default chunk length along longitude
pub const DEFAULT_LON_CHUNK: usize = 22;

// =============================================================================
// Execution Defaults
// =============================================================================

/// Default timeout for a single external tool invocation (6 hours)
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Locks older than this are considered abandoned by a crashed runner
pub const DEFAULT_STALE_LOCK_SECS: u64 = 24 * 60 * 60;

/// Default remote host the DKRZ pool is reached through
pub const DEFAULT_RSYNC_HOST: &str = "levante";

/// Default root of the ERA5 pool on the remote host
pub const DEFAULT_POOL_ORIGIN: &str = "/pool/data/ERA5/E5";

/// Directory name under the platform config dir holding the default config
pub const APP_DIR_NAME: &str = "reanalysis-processor";

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Name of the checkpoint directory inside the work root
pub const CHECKPOINT_DIR_NAME: &str = "checkpoints";

// =============================================================================
// Canonical Axis Names
// =============================================================================

pub const TIME_AXIS: &str = "time";
pub const LAT_AXIS: &str = "lat";
pub const LON_AXIS: &str = "lon";
pub const LEVEL_AXIS: &str = "level";

/// Alternative axis names found in source files, mapped to canonical names
pub const AXIS_ALIASES: &[(&str, &str)] = &[
    ("valid_time", TIME_AXIS),
    ("latitude", LAT_AXIS),
    ("longitude", LON_AXIS),
    ("pressure_level", LEVEL_AXIS),
    ("plev", LEVEL_AXIS),
];
