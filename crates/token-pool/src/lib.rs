//! Credential pool for redemption-code checks
//!
//! Holds the caller tokens and their per-token health. A token moves through:
//! 1. Added by the caller → `Available`
//! 2. Server answers 429 → `RateLimited` until its cooldown expires
//! 3. Cooldown expires → automatically `Available` again on the next read
//! 4. Three credential errors (401) → `Invalid` permanently
//! 5. The caller evicts invalid tokens with `remove_invalid`/`remove_by_index`
//!
//! The engine itself never removes tokens, so an in-flight check can always
//! report back against the id it was given.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{
    CredentialSnapshot, CredentialState, DEFAULT_RATE_LIMIT_COOLDOWN, ERROR_THRESHOLD,
    SelectedCredential, TokenPool,
};
