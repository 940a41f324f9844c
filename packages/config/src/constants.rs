// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by envforge

// Template Discovery
pub const ENVFORGE_TEMPLATE_DIR: &str = "ENVFORGE_TEMPLATE_DIR";

// Networking
pub const ENVFORGE_EXTERNAL_ADDRESS: &str = "ENVFORGE_EXTERNAL_ADDRESS";
pub const ENVFORGE_PORT_RANGE_MIN: &str = "ENVFORGE_PORT_RANGE_MIN";
pub const ENVFORGE_PORT_RANGE_MAX: &str = "ENVFORGE_PORT_RANGE_MAX";

// Environment Lifecycle
pub const ENVFORGE_BUILD_TIMEOUT_SECS: &str = "ENVFORGE_BUILD_TIMEOUT_SECS";
pub const ENVFORGE_DEFAULT_KEEP_ALIVE_SECS: &str = "ENVFORGE_DEFAULT_KEEP_ALIVE_SECS";

// Template Sandbox Limits
pub const ENVFORGE_MAX_IMPORT_DEPTH: &str = "ENVFORGE_MAX_IMPORT_DEPTH";
pub const ENVFORGE_SCRIPT_MAX_OPERATIONS: &str = "ENVFORGE_SCRIPT_MAX_OPERATIONS";

// Container Runtime
pub const ENVFORGE_PULL_TIMEOUT_SECS: &str = "ENVFORGE_PULL_TIMEOUT_SECS";
pub const ENVFORGE_PROBE_TIMEOUT_SECS: &str = "ENVFORGE_PROBE_TIMEOUT_SECS";
