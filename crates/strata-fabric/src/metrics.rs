//! Per-channel fabric traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::channel::FabricChannel;

/// Point-in-time copy of per-channel cumulative byte counters.
///
/// Counters are append-only and never reset except at process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FabricRate {
    /// Bytes sent per channel, indexed by [`FabricChannel::index`].
    pub s_bytes: [u64; FabricChannel::COUNT],
    /// Bytes received per channel, indexed by [`FabricChannel::index`].
    pub r_bytes: [u64; FabricChannel::COUNT],
}

/// Thread-safe fabric traffic counters.
pub struct FabricMetrics {
    s_bytes: [AtomicU64; FabricChannel::COUNT],
    r_bytes: [AtomicU64; FabricChannel::COUNT],
}

impl FabricMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self {
            s_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
            r_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Adds sent bytes to a channel's counter.
    pub fn add_sent(&self, channel: FabricChannel, bytes: u64) {
        self.s_bytes[channel.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds received bytes to a channel's counter.
    pub fn add_received(&self, channel: FabricChannel, bytes: u64) {
        self.r_bytes[channel.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    pub fn capture(&self) -> FabricRate {
        FabricRate {
            s_bytes: std::array::from_fn(|i| self.s_bytes[i].load(Ordering::Relaxed)),
            r_bytes: std::array::from_fn(|i| self.r_bytes[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for FabricMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FabricMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricMetrics")
            .field("rate", &self.capture())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_is_zeroed() {
        let rate = FabricMetrics::new().capture();
        assert_eq!(rate, FabricRate::default());
    }

    #[test]
    fn test_counters_accumulate_per_channel() {
        let metrics = FabricMetrics::new();
        metrics.add_sent(FabricChannel::Rw, 100);
        metrics.add_sent(FabricChannel::Rw, 24);
        metrics.add_received(FabricChannel::Bulk, 4096);

        let rate = metrics.capture();
        assert_eq!(rate.s_bytes[FabricChannel::Rw.index()], 124);
        assert_eq!(rate.s_bytes[FabricChannel::Bulk.index()], 0);
        assert_eq!(rate.r_bytes[FabricChannel::Bulk.index()], 4096);
        assert_eq!(rate.r_bytes[FabricChannel::Rw.index()], 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = FabricMetrics::new();
        metrics.add_sent(FabricChannel::Meta, 8);
        let json = serde_json::to_string(&metrics.capture()).unwrap();
        assert!(json.contains("s_bytes"));
        assert!(json.contains("r_bytes"));
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let metrics = Arc::new(FabricMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    metrics.add_sent(FabricChannel::Ctrl, 3);
                    metrics.add_received(FabricChannel::Ctrl, 5);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let rate = metrics.capture();
        assert_eq!(rate.s_bytes[FabricChannel::Ctrl.index()], 8 * 1000 * 3);
        assert_eq!(rate.r_bytes[FabricChannel::Ctrl.index()], 8 * 1000 * 5);
    }
}
