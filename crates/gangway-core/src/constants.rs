//! Configuration defaults for the gangway toolkit.

// =============================================================================
// Server Defaults
// =============================================================================

/// Default bind address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Default bind port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default worker pool capacity.
pub const DEFAULT_WORKERS: usize = 16;

/// Default connection timeout as a duration string.
pub const DEFAULT_TIMEOUT: &str = "5s";

// =============================================================================
// Logger Defaults
// =============================================================================

/// Default logger target prefix.
pub const DEFAULT_LOG_PREFIX: &str = "gangway";

/// Default verbosity level (2 = info).
pub const DEFAULT_VERBOSITY: u8 = 2;
