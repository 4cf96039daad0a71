// ABOUTME: Environment variable names and platform defaults
// ABOUTME: Centralized definitions of every variable and endpoint constant Skiff reads

// Credentials
pub const E2B_API_KEY: &str = "E2B_API_KEY";

// Endpoint Configuration
pub const E2B_API_URL: &str = "E2B_API_URL";
pub const E2B_DOMAIN: &str = "E2B_DOMAIN";
pub const E2B_SANDBOX_DOMAIN: &str = "E2B_SANDBOX_DOMAIN"; // Takes precedence over E2B_DOMAIN
pub const E2B_SANDBOX_URL: &str = "E2B_SANDBOX_URL";

// Development Configuration
pub const E2B_DEBUG: &str = "E2B_DEBUG";

// Request Tuning
pub const SKIFF_REQUEST_TIMEOUT_SECS: &str = "SKIFF_REQUEST_TIMEOUT_SECS";
pub const SKIFF_MAX_RETRIES: &str = "SKIFF_MAX_RETRIES";

// Platform defaults
pub const DEFAULT_API_URL: &str = "https://api.e2b.app";
pub const DEFAULT_DOMAIN: &str = "e2b.app";
pub const DEBUG_API_URL: &str = "http://localhost:3000";

/// Port of the in-sandbox agent (process + filesystem RPC, file transfer)
pub const ENVD_PORT: u16 = 49_983;

/// Port of the code interpreter server inside interpreter templates
pub const INTERPRETER_PORT: u16 = 49_999;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 250;

/// Upper bound accepted for the retry budget
pub const MAX_RETRIES_LIMIT: u32 = 10;
