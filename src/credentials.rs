//! API-key pools.
//!
//! An API-key variable may hold a JSON array of keys instead of a single key,
//! e.g. `GEMINI_API_KEY='["key-a","key-b"]'`. At startup one non-empty key is
//! picked at random and written back to the variable, so the provider factory
//! only ever sees a plain key. A value that looks like an array but does not
//! parse is used literally.
//!
//! Keys are never logged; only the pool size is.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

/// Variables that may hold a key pool.
pub const KEY_VARIABLES: &[&str] = &[
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
];

/// What to do with a raw variable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolChoice {
    /// Not a pool; keep the value as it is.
    Literal,
    /// A pool; replace the value with this key.
    Picked { key: String, pool_size: usize },
    /// A pool with no usable key.
    Empty,
}

/// Decide how to treat `raw`, picking from a pool with `rng`.
pub fn choose_from_pool<R: Rng + ?Sized>(raw: &str, rng: &mut R) -> PoolChoice {
    let trimmed = raw.trim();
    if !trimmed.starts_with('[') {
        return PoolChoice::Literal;
    }
    let Ok(keys) = serde_json::from_str::<Vec<String>>(trimmed) else {
        return PoolChoice::Literal;
    };
    let usable: Vec<&str> = keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    match usable.choose(rng) {
        Some(key) => PoolChoice::Picked {
            key: (*key).to_string(),
            pool_size: usable.len(),
        },
        None => PoolChoice::Empty,
    }
}

/// Resolve every pooled key variable in the process environment.
///
/// `GOOGLE_API_KEY` is copied to `GEMINI_API_KEY` when only the former is
/// set, since the Gemini provider reads the latter.
///
/// Must run before any other thread is spawned (before the async runtime is
/// built), because it mutates the process environment.
pub fn apply_key_pools() {
    let mut rng = rand::thread_rng();
    for name in KEY_VARIABLES {
        let Ok(raw) = std::env::var(name) else {
            continue;
        };
        match choose_from_pool(&raw, &mut rng) {
            PoolChoice::Literal => {}
            PoolChoice::Picked { key, pool_size } => {
                debug!(variable = name, pool_size, "Picked API key from pool");
                std::env::set_var(name, &key);
            }
            PoolChoice::Empty => {
                warn!(variable = name, "API key pool holds no usable key; ignoring it");
                std::env::remove_var(name);
            }
        }
    }

    let gemini_missing = std::env::var("GEMINI_API_KEY").map_or(true, |v| v.is_empty());
    if gemini_missing {
        if let Ok(google) = std::env::var("GOOGLE_API_KEY") {
            if !google.is_empty() {
                std::env::set_var("GEMINI_API_KEY", &google);
            }
        }
    }
}
