//! Process-wide registry of claimed capture devices.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

/// Tracks which device identifiers are currently held open.
///
/// A device key appears here iff some live [`crate::camera::CameraManager`]
/// holds it open. Check-and-claim and release run under one mutex, so two
/// managers racing for the same device cannot both win.
///
/// The registry is an explicit, injectable object: production code shares
/// [`DeviceRegistry::global`], tests build isolated instances.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    claimed: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared process-wide registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Claim `key` if it is free. Returns whether the claim succeeded.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut claimed = self.claimed.lock().unwrap();
        claimed.insert(key.to_string())
    }

    /// Atomically release `old` (if any) and claim `new`.
    ///
    /// Fails without side effects when `new` is held by someone else.
    /// Re-claiming the key this caller already holds succeeds.
    pub fn reclaim(&self, old: Option<&str>, new: &str) -> bool {
        let mut claimed = self.claimed.lock().unwrap();
        if claimed.contains(new) && old != Some(new) {
            return false;
        }
        if let Some(old) = old {
            claimed.remove(old);
        }
        claimed.insert(new.to_string());
        true
    }

    pub fn release(&self, key: &str) {
        self.claimed.lock().unwrap().remove(key);
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed.lock().unwrap().contains(key)
    }

    /// Currently-claimed keys, for diagnostics.
    pub fn snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.claimed.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let registry = DeviceRegistry::new();
        assert!(registry.try_claim("/dev/video0"));
        assert!(!registry.try_claim("/dev/video0"));
        assert!(registry.is_claimed("/dev/video0"));
    }

    #[test]
    fn release_makes_key_available_again() {
        let registry = DeviceRegistry::new();
        assert!(registry.try_claim("/dev/video0"));
        registry.release("/dev/video0");
        assert!(!registry.is_claimed("/dev/video0"));
        assert!(registry.try_claim("/dev/video0"));
    }

    #[test]
    fn reclaim_swaps_atomically() {
        let registry = DeviceRegistry::new();
        assert!(registry.try_claim("/dev/video0"));
        assert!(registry.reclaim(Some("/dev/video0"), "/dev/video1"));
        assert!(!registry.is_claimed("/dev/video0"));
        assert!(registry.is_claimed("/dev/video1"));
    }

    #[test]
    fn reclaim_refuses_foreign_claim() {
        let registry = DeviceRegistry::new();
        assert!(registry.try_claim("/dev/video1"));
        assert!(!registry.reclaim(Some("/dev/video0"), "/dev/video1"));
        // The old claim must be untouched on failure.
        assert!(!registry.is_claimed("/dev/video0"));
    }

    #[test]
    fn reclaim_same_key_is_a_no_op_success() {
        let registry = DeviceRegistry::new();
        assert!(registry.try_claim("/dev/video0"));
        assert!(registry.reclaim(Some("/dev/video0"), "/dev/video0"));
        assert!(registry.is_claimed("/dev/video0"));
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = DeviceRegistry::new();
        registry.try_claim("/dev/video2");
        registry.try_claim("/dev/video0");
        assert_eq!(registry.snapshot(), vec!["/dev/video0", "/dev/video2"]);
    }
}
