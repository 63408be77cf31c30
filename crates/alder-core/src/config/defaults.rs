//! Default values for Alder configuration.
//!
//! All hardcoded defaults are centralized here for easy maintenance.

// ============================================================================
// Sync Defaults
// ============================================================================

/// Base polling interval between synchronisation cycles (1 second).
pub const DEFAULT_BASE_POLL_INTERVAL_MS: u64 = 1000;

/// Upper bound the polling interval backs off to while nothing changes
/// (512 seconds).
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 512_000;

/// Timeout for fetching a single file from a repository adapter.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Storage Defaults
// ============================================================================

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = ".alder";

/// Subdirectory of the data directory holding fetched file copies.
pub const DEFAULT_IMPORTS_DIR: &str = "imports";

// ============================================================================
// Repository Defaults
// ============================================================================

/// Default repository adapter kind.
pub const DEFAULT_REPOSITORY_KIND: &str = "local";

/// Default file name suffixes tracked in a repository.
pub const DEFAULT_MODEL_EXTENSIONS: &[&str] = &[".model.json"];
