//! GitHub API endpoints used for token exchange

/// Default GitHub REST API base URL
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Copilot token exchange path (relative to the GitHub API base)
pub const COPILOT_TOKEN_PATH: &str = "/copilot_internal/v2/token";

/// Authenticated user lookup path
pub const USER_PATH: &str = "/user";

/// Refresh this many seconds before a Copilot token's declared expiry.
pub const REFRESH_MARGIN_SECS: u64 = 60;
