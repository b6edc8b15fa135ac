//! Remote endpoint and wire constants

/// Token description endpoint. The code is appended as the last path segment.
pub const DEFAULT_ENDPOINT: &str = "https://purchase.mp.microsoft.com/v7.0/tokenDescriptions";

/// Placeholder code sent when testing credentials. The endpoint answers 404
/// for it when the credential is accepted.
pub const CREDENTIAL_TEST_CODE: &str = "XXXXX-XXXXX-XXXXX-XXXXX-XXXXX";

/// Upper bounds on the timeouts of a credential test request.
pub const CREDENTIAL_TEST_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const CREDENTIAL_TEST_READ_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_MARKET: &str = "US";
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// Prefix of an already-wrapped credential.
pub const WLID_PREFIX: &str = "WLID1.0=";

/// Header values sent with every request, besides `user-agent` and `authorization`.
pub const BASE_HEADERS: [(&str, &str); 8] = [
    ("accept", "application/json, text/javascript, */*; q=0.01"),
    ("accept-language", "en-US,en;q=0.8"),
    ("origin", "https://www.microsoft.com"),
    ("referer", "https://www.microsoft.com/"),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-site"),
    ("sec-gpc", "1"),
];

/// Current Chrome builds on Windows.
pub const STABLE_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
];

/// Older build the endpoint has accepted for a long time.
pub const LEGACY_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36";

/// Share of sessions that pick a stable user agent over the legacy one.
pub const STABLE_USER_AGENT_SHARE: f64 = 0.7;

/// Chance per check of picking a new user agent.
pub const USER_AGENT_ROTATION_CHANCE: f64 = 0.01;
