//! Application-wide constants.

/// Directory name used under XDG base directories.
pub const APP_NAME: &str = "kiln";

/// Overrides the data root (receipts, build sandboxes, default prefix).
pub const ROOT_ENV: &str = "KILN_ROOT";

/// Overrides the install prefix.
pub const PREFIX_ENV: &str = "KILN_PREFIX";

/// Overrides the recipe directory.
pub const RECIPES_ENV: &str = "KILN_RECIPES";

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Config file name inside the config directory.
pub const CONFIG_FILENAME: &str = "kiln.toml";

/// Length of a lowercase hex SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Extension of the per-target lock files under the locks directory.
pub const LOCK_EXTENSION: &str = "lock";

/// January 1, 1980 00:00:00 UTC (ZIP epoch), exported to builds for reproducible timestamps.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Worker count exported to build steps.
pub const JOBS_ENV: &str = "KILN_JOBS";

/// Default per-step build timeout in seconds.
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 3600;
