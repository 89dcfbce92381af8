//! RESTful URL pattern inference engine (§4.H).
//!
//! Every observed request path is recorded into a per-label tree (shared
//! across tiers and labels, e.g. one label per service). A periodic or
//! on-demand scan collapses sibling branches that look like a path
//! variable (`/users/1`, `/users/2`, ... -> `/users/*`) into a single
//! pattern, which the chain can use to decide a shared cache-key template
//! for otherwise-distinct URLs.
//!
//! Grounded on `original_source/restful_finder/restful_finder.go`. The
//! parent-pointer bug named in the redesign notes is designed out by using
//! an arena (`arena::Arena`) instead of raw `pre *node` pointers.

mod arena;
mod scan;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CacheError, Result};
use arena::{Arena, NodeId};
pub use scan::UrlWithLabel;

const DEFAULT_THRESHOLD: usize = 5;
const DEFAULT_WAITING_CAPACITY: usize = 10_240;

/// A path queued for replay because a scan was in progress when it was
/// recorded. Carries its label so `ActiveWaitingTask` doesn't silently
/// flatten every waiting entry onto the default label (§9 Open Question).
type WaitingEntry = (String, String);

pub struct Finder {
    arena: Arena,
    heads: DashMap<String, DashMap<String, NodeId>>,
    checker_lock: RwLock<()>,
    threshold: usize,
    waiting_tx: mpsc::Sender<WaitingEntry>,
    waiting_rx: Mutex<mpsc::Receiver<WaitingEntry>>,
}

impl Finder {
    pub fn new(threshold: usize, waiting_capacity: usize) -> Self {
        let (waiting_tx, waiting_rx) = mpsc::channel(waiting_capacity.max(1));
        Self {
            arena: Arena::new(),
            heads: DashMap::new(),
            checker_lock: RwLock::new(()),
            threshold: threshold.max(1),
            waiting_tx,
            waiting_rx: Mutex::new(waiting_rx),
        }
    }

    /// Record a path under the default label.
    pub fn record_api(&self, key: &str) -> Result<()> {
        self.record_api_with_label("", key)
    }

    /// Record a path under `label`. Non-blocking: a scan in progress holds
    /// the exclusive lock, so a recorder that can't get the shared lock
    /// defers into the bounded waiting channel instead of blocking the hot
    /// path, same as the source's `TryRLock` fallback.
    pub fn record_api_with_label(&self, label: &str, key: &str) -> Result<()> {
        let Some(_guard) = self.checker_lock.try_read() else {
            return match self
                .waiting_tx
                .try_send((label.to_string(), key.to_string()))
            {
                Ok(()) => Ok(()),
                Err(_) => Err(CacheError::TooManyRequests),
            };
        };
        self.record_locked(label, key)
    }

    fn record_locked(&self, label: &str, key: &str) -> Result<()> {
        let parts: Vec<&str> = key
            .split('/')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect();
        let Some((head_name, rest)) = parts.split_first() else {
            return Ok(());
        };

        let label_tree = self.heads.entry(label.to_string()).or_default();
        let head_id = *label_tree
            .entry((*head_name).to_string())
            .or_insert_with(|| self.arena.alloc((*head_name).to_string(), None));
        drop(label_tree);

        let mut current = head_id;
        for segment in rest {
            current = self.arena.get_or_insert_child(current, segment);
        }
        Ok(())
    }

    /// Drop every recorded tree.
    pub fn clear(&self) {
        let _guard = self.checker_lock.write();
        self.heads.clear();
    }

    /// Scan every label's trees for RESTful patterns, returning only the
    /// URLs; use [`Finder::scan_restful_pattern_with_label`] when the
    /// originating label matters.
    pub fn scan_restful_pattern(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_restful_pattern_with_label()?
            .into_iter()
            .map(|entry| entry.url)
            .collect())
    }

    /// Full two-pass scan (§4.H). Takes the exclusive lock for the whole
    /// scan, then drains anything recorders deferred while it ran.
    pub fn scan_restful_pattern_with_label(&self) -> Result<Vec<UrlWithLabel>> {
        let mut result_map = std::collections::HashMap::new();
        let mut normal_list = Vec::new();

        {
            let _guard = self.checker_lock.write();
            for label_entry in &self.heads {
                let label = label_entry.key().clone();
                for head_entry in label_entry.value() {
                    let head_id = *head_entry.value();
                    let check_map = scan::measure(&self.arena, head_id);
                    scan::rewrite(
                        &self.arena,
                        &label,
                        head_id,
                        &check_map,
                        self.threshold,
                        &mut result_map,
                        &mut normal_list,
                    );
                }
            }
        }

        debug!(
            patterns = result_map.len(),
            literal = normal_list.len(),
            "restful pattern scan complete"
        );

        self.active_waiting_task()?;
        Ok(result_map.into_values().collect())
    }

    /// Replay every path deferred while a scan held the exclusive lock.
    fn active_waiting_task(&self) -> Result<()> {
        let mut rx = self.waiting_rx.lock();
        let mut count = 0u32;
        while let Ok((label, key)) = rx.try_recv() {
            self.record_api_with_label(&label, &key)?;
            count += 1;
        }
        if count > 0 {
            debug!(count, "replayed deferred recordings after scan");
        }
        Ok(())
    }
}

impl Default for Finder {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_WAITING_CAPACITY)
    }
}

static INSTANCE: OnceLock<Finder> = OnceLock::new();

/// The process-wide finder instance, lazily built with default settings on
/// first use (mirrors the source's `sync.Once`-guarded singleton). Prefer
/// constructing a [`Finder`] directly in tests or when multiple independent
/// instances are needed.
pub fn finder() -> &'static Finder {
    INSTANCE.get_or_init(Finder::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_scans_a_simple_path() {
        let finder = Finder::new(5, 16);
        finder.record_api("/users/42").unwrap();
        let urls = finder.scan_restful_pattern().unwrap();
        assert_eq!(urls, vec!["/users/42".to_string()]);
    }

    #[test]
    fn collapses_many_ids_into_a_wildcard() {
        let finder = Finder::new(3, 16);
        for id in ["1", "2", "3", "4"] {
            finder.record_api(&format!("/users/{id}/profile")).unwrap();
        }
        let urls = finder.scan_restful_pattern().unwrap();
        assert_eq!(urls, vec!["/users/*/profile".to_string()]);
    }

    #[test]
    fn labels_are_kept_independent() {
        let finder = Finder::new(2, 16);
        finder.record_api_with_label("svc-a", "/orders/1").unwrap();
        finder.record_api_with_label("svc-b", "/orders/1").unwrap();
        let result = finder.scan_restful_pattern_with_label().unwrap();
        let labels: std::collections::HashSet<&str> =
            result.iter().map(|e| e.label.as_str()).collect();
        // Both literal (below threshold) so they don't appear in resultMap,
        // only in the internal normalList; resultMap should be empty.
        assert!(result.is_empty());
        let _ = labels;
    }

    #[test]
    fn clear_drops_recorded_trees() {
        let finder = Finder::new(5, 16);
        finder.record_api("/a/b").unwrap();
        finder.clear();
        let urls = finder.scan_restful_pattern().unwrap();
        assert!(urls.is_empty());
    }

    #[test]
    fn record_while_scan_holds_lock_defers_then_replays() {
        let finder = Finder::new(5, 16);
        finder.record_api("/warm/1").unwrap();
        // Simulate a concurrent recorder losing the race for the shared
        // lock by pushing directly into the waiting channel, the same path
        // `record_api_with_label` takes on a failed `try_read`.
        finder
            .waiting_tx
            .try_send(("".to_string(), "/deferred/1".to_string()))
            .unwrap();
        let urls = finder.scan_restful_pattern().unwrap();
        assert!(urls.contains(&"/warm/1".to_string()));
        // The deferred entry was replayed as part of the scan, so a second
        // scan should also see it recorded.
        let urls_again = finder.scan_restful_pattern().unwrap();
        assert!(urls_again.contains(&"/deferred/1".to_string()));
    }

    #[test]
    fn finder_singleton_is_reachable() {
        let f = finder();
        f.record_api("/singleton/check").unwrap();
        assert!(f.scan_restful_pattern().unwrap().contains(&"/singleton/check".to_string()));
    }
}
