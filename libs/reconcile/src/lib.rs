//! Reconciliation loop primitives.
//!
//! This library provides helpers shared by every controller loop that
//! converges declared state (what the store says) with physical state (what
//! the node actually has). Key concepts:
//!
//! - **Pass**: one scan-and-converge cycle over every resource a loop owns.
//! - **Resource hash**: a digest of a resource with its own hash field
//!   blanked, used to suppress redundant writes.
//! - **Hash guard**: the hash observed at list time, compared against the
//!   hash after a transition.
//!
//! # Invariants
//!
//! - Transitions are idempotent; a converged resource hashes identically on
//!   every pass and is never rewritten.
//! - The digest is computed over canonical JSON, so field order never
//!   changes the hash.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info};

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(3);

/// Prefix carried by every resource hash.
pub const HASH_PREFIX: &str = "sha256:";

/// A content digest used to detect changes to a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHash(String);

impl ResourceHash {
    /// Compute a hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("{}{}", HASH_PREFIX, hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Compute the hash of a serializable value with the field at `pointer`
    /// (a JSON pointer such as `/meta/resource_hash`) blanked first.
    pub fn of<T: Serialize>(value: &T, pointer: &str) -> Result<Self, serde_json::Error> {
        let mut json = serde_json::to_value(value)?;
        if let Some(field) = json.pointer_mut(pointer) {
            *field = serde_json::Value::String(String::new());
        }
        Ok(Self::from_json(&json))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the hash, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ResourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Change detector for a single resource within a pass.
///
/// Captures the hash read at list time. After the transition has mutated an
/// in-memory copy, the recomputed hash is compared against it: equal means
/// the write (and any wake-up it would cause downstream) is skipped.
///
/// There is no compare-and-swap on the stored hash; two writers that both
/// observe a change are serialized by the store's per-key lock, and the last
/// one wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashGuard {
    observed: String,
}

impl HashGuard {
    /// Record the hash observed when the resource was listed.
    pub fn observe(hash: impl Into<String>) -> Self {
        Self {
            observed: hash.into(),
        }
    }

    /// The hash captured at list time.
    pub fn observed(&self) -> &str {
        &self.observed
    }

    /// Returns true if `current` differs from the observed hash.
    pub fn is_changed(&self, current: &ResourceHash) -> bool {
        self.observed != current.as_str()
    }
}

/// Counters for a single reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Resources listed.
    pub seen: u32,
    /// Resources owned by another node.
    pub skipped: u32,
    /// Resources whose hash did not change.
    pub unchanged: u32,
    /// Resources written back.
    pub written: u32,
    /// Resources removed from the store.
    pub removed: u32,
    /// Resources whose transition failed.
    pub failed: u32,
}

impl PassStats {
    /// Fold another pass's counters into this one.
    pub fn merge(&mut self, other: PassStats) {
        self.seen += other.seen;
        self.skipped += other.skipped;
        self.unchanged += other.unchanged;
        self.written += other.written;
        self.removed += other.removed;
        self.failed += other.failed;
    }

    /// Number of resources this pass actually dispatched to a transition.
    pub fn reconciled(&self) -> u32 {
        self.seen.saturating_sub(self.skipped)
    }
}

/// Run `pass` every `interval` until `shutdown` flips to true.
///
/// The pass future races the shutdown signal, so shutting down drops the
/// in-flight pass at its next await point. Whatever external mutation that
/// pass already applied stays applied; the next process start converges
/// from there.
pub async fn run_periodic<F, Fut>(
    name: &str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(
        loop_name = name,
        interval_ms = interval.as_millis() as u64,
        "Starting reconciliation loop"
    );

    if *shutdown.borrow() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!(loop_name = name, "Starting pass");
                tokio::select! {
                    _ = pass() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(loop_name = name, "Pass cancelled by shutdown");
                            break;
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(loop_name = name, "Reconciliation loop shutting down");
}
