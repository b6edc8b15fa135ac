//! Browser identity and request headers

use parking_lot::RwLock;
use rand::RngExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::constants::{
    BASE_HEADERS, LEGACY_USER_AGENT, STABLE_USER_AGENT_SHARE, STABLE_USER_AGENTS,
    USER_AGENT_ROTATION_CHANCE, WLID_PREFIX,
};

/// Pick a user agent: mostly a current Chrome build, sometimes the legacy one.
pub fn pick_user_agent() -> &'static str {
    let mut rng = rand::rng();
    if rng.random_bool(STABLE_USER_AGENT_SHARE) {
        STABLE_USER_AGENTS[rng.random_range(0..STABLE_USER_AGENTS.len())]
    } else {
        LEGACY_USER_AGENT
    }
}

/// Wrap a raw credential in the `WLID1.0="..."` form unless it already is.
pub fn wrap_credential(raw: &str) -> String {
    if raw.starts_with(WLID_PREFIX) {
        raw.to_string()
    } else {
        format!("{WLID_PREFIX}\"{raw}\"")
    }
}

/// User agent shared by every request of one client, occasionally rotated.
pub struct BrowserIdentity {
    user_agent: RwLock<&'static str>,
}

impl BrowserIdentity {
    pub fn new() -> Self {
        Self {
            user_agent: RwLock::new(pick_user_agent()),
        }
    }

    pub fn user_agent(&self) -> &'static str {
        *self.user_agent.read()
    }

    /// Rotate with a small fixed probability. Returns true if rotated.
    pub fn maybe_rotate(&self) -> bool {
        if !rand::rng().random_bool(USER_AGENT_ROTATION_CHANCE) {
            return false;
        }
        let next = pick_user_agent();
        *self.user_agent.write() = next;
        debug!(user_agent = next, "user agent rotated");
        true
    }

    /// Full header set for one request.
    pub fn headers(&self, credential: &str) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(BASE_HEADERS.len() + 2);
        for (name, value) in BASE_HEADERS {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        headers.insert(USER_AGENT, HeaderValue::from_static(self.user_agent()));
        // Tokens are opaque base64-ish strings; one with control characters
        // is sent without authorization and comes back as a 401.
        if let Ok(mut value) = HeaderValue::from_str(&wrap_credential(credential)) {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

impl Default for BrowserIdentity {
    fn default() -> Self {
        Self::new()
    }
}
