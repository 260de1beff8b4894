//! Per-owner counters of child links by lifecycle bucket.
//!
//! Every owner keeps one [`ListStatistics`]. Links move between buckets as their state changes;
//! the totals are maintained alongside the buckets so that a snapshot can prove they agree.
//! Watermark crossings are *returned* to the caller rather than delivered from here, because the
//! statistics monitor must never be held while calling back into an item.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::error;

use crate::config::SpillLimits;

/// Mutually exclusive statistics bucket.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum Bucket {
    /// Add in flight.
    Adding,
    /// Committed and unlocked.
    Available,
    /// Locked in memory or persistently.
    Locked,
    /// Remove in flight.
    Removing,
    /// Update in flight.
    Updating,
    /// Locked for expiry.
    Expiring,
}

impl Bucket {
    fn index(self) -> usize {
        match self {
            Bucket::Adding => 0,
            Bucket::Available => 1,
            Bucket::Locked => 2,
            Bucket::Removing => 3,
            Bucket::Updating => 4,
            Bucket::Expiring => 5,
        }
    }
}

/// Thresholds whose crossing is reported to the owning stream's payload.
///
/// Each pair works with hysteresis: a high breach is reported when the total reaches `*_high`,
/// and a low breach once it falls back to `*_low` or below.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Count at or below which a low breach is reported.
    pub count_low: Option<u64>,
    /// Count at or above which a high breach is reported.
    pub count_high: Option<u64>,
    /// Bytes at or below which a low breach is reported.
    pub bytes_low: Option<u64>,
    /// Bytes at or above which a high breach is reported.
    pub bytes_high: Option<u64>,
}

/// A watermark crossing observed during a statistics update.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum WatermarkBreach {
    /// Item count rose to the high watermark.
    CountHigh(u64),
    /// Item count fell to the low watermark.
    CountLow(u64),
    /// Byte total rose to the high watermark.
    BytesHigh(u64),
    /// Byte total fell to the low watermark.
    BytesLow(u64),
}

/// Crossings produced by one update; at most one per dimension.
pub type Breaches = SmallVec<[WatermarkBreach; 2]>;

#[derive(Copy, Clone, Debug, Default)]
struct Counter {
    count: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: [Counter; 6],
    total_count: u64,
    total_bytes: u64,
    added: u64,
    removed: u64,
    watermarks: Watermarks,
    count_above_high: bool,
    bytes_above_high: bool,
    spill: SpillLimits,
    spilling: bool,
}

impl Inner {
    fn breaches(&mut self) -> Breaches {
        let mut out = Breaches::new();
        let marks = self.watermarks;
        if let Some(high) = marks.count_high {
            if !self.count_above_high && self.total_count >= high {
                self.count_above_high = true;
                out.push(WatermarkBreach::CountHigh(self.total_count));
            }
        }
        if self.count_above_high && self.total_count <= marks.count_low.unwrap_or(0) {
            self.count_above_high = false;
            out.push(WatermarkBreach::CountLow(self.total_count));
        }
        if let Some(high) = marks.bytes_high {
            if !self.bytes_above_high && self.total_bytes >= high {
                self.bytes_above_high = true;
                out.push(WatermarkBreach::BytesHigh(self.total_bytes));
            }
        }
        if self.bytes_above_high && self.total_bytes <= marks.bytes_low.unwrap_or(0) {
            self.bytes_above_high = false;
            out.push(WatermarkBreach::BytesLow(self.total_bytes));
        }
        out
    }
}

/// Point-in-time copy of a [`ListStatistics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Links with an add in flight.
    pub adding_count: u64,
    /// Bytes of links with an add in flight.
    pub adding_bytes: u64,
    /// Available links.
    pub available_count: u64,
    /// Bytes of available links.
    pub available_bytes: u64,
    /// Locked links.
    pub locked_count: u64,
    /// Bytes of locked links.
    pub locked_bytes: u64,
    /// Links with a remove in flight.
    pub removing_count: u64,
    /// Bytes of links with a remove in flight.
    pub removing_bytes: u64,
    /// Links with an update in flight.
    pub updating_count: u64,
    /// Bytes of links with an update in flight.
    pub updating_bytes: u64,
    /// Links locked for expiry.
    pub expiring_count: u64,
    /// Bytes of links locked for expiry.
    pub expiring_bytes: u64,
    /// Tracked total count.
    pub total_count: u64,
    /// Tracked total bytes.
    pub total_bytes: u64,
    /// Links that ever entered.
    pub added: u64,
    /// Links that ever left.
    pub removed: u64,
    /// Whether the owner is spilling.
    pub spilling: bool,
}

impl StatsSnapshot {
    /// Returns `true` when the tracked totals equal the sum of the buckets.
    pub fn is_consistent(&self) -> bool {
        let count = self.adding_count
            + self.available_count
            + self.locked_count
            + self.removing_count
            + self.updating_count
            + self.expiring_count;
        let bytes = self.adding_bytes
            + self.available_bytes
            + self.locked_bytes
            + self.removing_bytes
            + self.updating_bytes
            + self.expiring_bytes;
        count == self.total_count && bytes == self.total_bytes
    }
}

/// Counters for the children of one owner.
#[derive(Debug, Default)]
pub struct ListStatistics {
    inner: Mutex<Inner>,
}

impl ListStatistics {
    /// Creates empty statistics using `spill` to decide spilling.
    pub fn new(spill: SpillLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                spill,
                ..Inner::default()
            }),
        }
    }

    /// Counts a link entering `bucket`.
    pub fn enter(&self, bucket: Bucket, bytes: usize) -> Breaches {
        let mut inner = self.inner.lock();
        let slot = &mut inner.buckets[bucket.index()];
        slot.count += 1;
        slot.bytes += bytes as u64;
        inner.total_count += 1;
        inner.total_bytes += bytes as u64;
        inner.added += 1;
        inner.breaches()
    }

    /// Counts a link leaving `bucket`.
    pub fn leave(&self, bucket: Bucket, bytes: usize) -> Breaches {
        let mut inner = self.inner.lock();
        let slot = &mut inner.buckets[bucket.index()];
        if slot.count == 0 || slot.bytes < bytes as u64 {
            error!(?bucket, bytes, "statistics underflow");
        }
        slot.count = slot.count.saturating_sub(1);
        slot.bytes = slot.bytes.saturating_sub(bytes as u64);
        inner.total_count = inner.total_count.saturating_sub(1);
        inner.total_bytes = inner.total_bytes.saturating_sub(bytes as u64);
        inner.removed += 1;
        inner.breaches()
    }

    /// Moves one link between buckets; totals are unchanged.
    pub fn transfer(&self, from: Bucket, to: Bucket, bytes: usize) {
        if from == to {
            return;
        }
        let mut inner = self.inner.lock();
        let source = &mut inner.buckets[from.index()];
        if source.count == 0 {
            error!(?from, ?to, "statistics transfer from empty bucket");
        }
        source.count = source.count.saturating_sub(1);
        source.bytes = source.bytes.saturating_sub(bytes as u64);
        let target = &mut inner.buckets[to.index()];
        target.count += 1;
        target.bytes += bytes as u64;
    }

    /// Adjusts the byte total of a link that stays in `bucket`.
    pub fn resize(&self, bucket: Bucket, old: usize, new: usize) -> Breaches {
        let mut inner = self.inner.lock();
        let slot = &mut inner.buckets[bucket.index()];
        slot.bytes = slot.bytes.saturating_sub(old as u64) + new as u64;
        inner.total_bytes = inner.total_bytes.saturating_sub(old as u64) + new as u64;
        inner.breaches()
    }

    /// Replaces the watermarks; crossings are evaluated on the next update.
    pub fn set_watermarks(&self, watermarks: Watermarks) {
        let mut inner = self.inner.lock();
        inner.watermarks = watermarks;
        inner.count_above_high = false;
        inner.bytes_above_high = false;
    }

    /// Current watermarks.
    pub fn watermarks(&self) -> Watermarks {
        self.inner.lock().watermarks
    }

    /// Re-evaluates spilling against the limits and returns the new flag.
    pub fn check_spill_limits(&self) -> bool {
        let mut inner = self.inner.lock();
        let limits = inner.spill;
        if inner.spilling {
            if inner.total_count < limits.lower_count && inner.total_bytes < limits.lower_bytes {
                inner.spilling = false;
            }
        } else if inner.total_count >= limits.upper_count || inner.total_bytes >= limits.upper_bytes
        {
            inner.spilling = true;
        }
        inner.spilling
    }

    /// Whether the owner was spilling at the last check.
    pub fn is_spilling(&self) -> bool {
        self.inner.lock().spilling
    }

    /// Count in one bucket.
    pub fn count(&self, bucket: Bucket) -> u64 {
        self.inner.lock().buckets[bucket.index()].count
    }

    /// Bytes in one bucket.
    pub fn bytes(&self, bucket: Bucket) -> u64 {
        self.inner.lock().buckets[bucket.index()].bytes
    }

    /// Total count across buckets.
    pub fn total_count(&self) -> u64 {
        self.inner.lock().total_count
    }

    /// Total bytes across buckets.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Copies every counter under one lock acquisition.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        let b = |bucket: Bucket| inner.buckets[bucket.index()];
        StatsSnapshot {
            adding_count: b(Bucket::Adding).count,
            adding_bytes: b(Bucket::Adding).bytes,
            available_count: b(Bucket::Available).count,
            available_bytes: b(Bucket::Available).bytes,
            locked_count: b(Bucket::Locked).count,
            locked_bytes: b(Bucket::Locked).bytes,
            removing_count: b(Bucket::Removing).count,
            removing_bytes: b(Bucket::Removing).bytes,
            updating_count: b(Bucket::Updating).count,
            updating_bytes: b(Bucket::Updating).bytes,
            expiring_count: b(Bucket::Expiring).count,
            expiring_bytes: b(Bucket::Expiring).bytes,
            total_count: inner.total_count,
            total_bytes: inner.total_bytes,
            added: inner.added,
            removed: inner.removed,
            spilling: inner.spilling,
        }
    }
}
