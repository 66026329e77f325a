//! Tunable limits for the connection manager.
//!
//! These can all be overridden locally with an environment variable, the
//! same convention `common::knobs` uses elsewhere in this codebase. None of
//! them changes a correctness invariant — only policy and log volume.

use std::sync::LazyLock;

use cmd_util::env::env_config;

/// If disabled, `FORCE_NEW_CONNECTION` requests are downgraded to ordinary
/// reuse-seeking requests. An operational killswitch for a pool under
/// exhaustion.
pub static PCM_FORCE_NEW_CONNECTION_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("PCM_FORCE_NEW_CONNECTION_ENABLED", true));

/// Once a placement's distinct-secondary-connection count reaches this, log
/// a warning that the transaction is fanning out unusually wide. Purely
/// observational: does not affect `has_secondary_readers` or any decision
/// table outcome.
pub static PCM_SECONDARY_READER_WARN_THRESHOLD: LazyLock<u32> =
    LazyLock::new(|| env_config("PCM_SECONDARY_READER_WARN_THRESHOLD", 8));

/// Whether every decision-table branch taken while picking a connection is
/// logged at debug. Defaults off in release builds to keep the hot path
/// quiet.
pub static PCM_LOG_DECISIONS: LazyLock<bool> = LazyLock::new(|| {
    let default = cfg!(debug_assertions);
    env_config("PCM_LOG_DECISIONS", default)
});
