//! Store options, cache sizing and spill limits, loadable from TOML.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::error::{Result, StoreError};

/// Byte budgets for the two discard caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Capacity of the cache holding payloads that have a persistent representation.
    pub stored_bytes: usize,
    /// Capacity of the cache holding STORE_NEVER payloads.
    pub unstored_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            stored_bytes: 64 * 1024 * 1024,
            unstored_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Thresholds that switch a stream in and out of spilling.
///
/// A stream starts spilling once either upper limit is reached and stops once both
/// totals fall below the lower limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillLimits {
    /// Item count at which spilling starts.
    pub upper_count: u64,
    /// Item count below which spilling stops.
    pub lower_count: u64,
    /// Byte total at which spilling starts.
    pub upper_bytes: u64,
    /// Byte total below which spilling stops.
    pub lower_bytes: u64,
}

impl Default for SpillLimits {
    fn default() -> Self {
        Self {
            upper_count: 5_000,
            lower_count: 4_000,
            upper_bytes: 50 * 1024 * 1024,
            lower_bytes: 40 * 1024 * 1024,
        }
    }
}

/// Configuration supplied when opening a [`crate::MessageStore`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Whether items may expire at all.
    pub items_can_expire: bool,
    /// Factor applied to the persisted size of an unrestored item to estimate its footprint.
    pub memory_size_multiplier: usize,
    /// Discard cache budgets.
    pub cache: CacheOptions,
    /// Spill thresholds applied to every stream.
    pub spill: SpillLimits,
    /// Depth applied to streams that do not set their own.
    pub default_max_depth: Option<u64>,
    /// Whether expirable items are registered with the expiry index.
    pub expiry_enabled: bool,
    /// Whether delivery-delayed items are registered with the delivery-delay index.
    pub delivery_delay_enabled: bool,
    /// Time source for expiry and delivery-delay decisions.
    #[serde(skip, default = "default_clock")]
    pub clock: Arc<dyn Clock>,
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            items_can_expire: true,
            memory_size_multiplier: 2,
            cache: CacheOptions::default(),
            spill: SpillLimits::default(),
            default_max_depth: None,
            expiry_enabled: true,
            delivery_delay_enabled: true,
            clock: default_clock(),
        }
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("items_can_expire", &self.items_can_expire)
            .field("memory_size_multiplier", &self.memory_size_multiplier)
            .field("cache", &self.cache)
            .field("spill", &self.spill)
            .field("default_max_depth", &self.default_max_depth)
            .field("expiry_enabled", &self.expiry_enabled)
            .field("delivery_delay_enabled", &self.delivery_delay_enabled)
            .finish_non_exhaustive()
    }
}

impl StoreOptions {
    /// Small caches, low spill limits and a manual clock starting at `start_ms`.
    ///
    /// Returns the clock alongside the options so tests can move time.
    pub fn for_tests(start_ms: u64) -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let options = Self {
            cache: CacheOptions {
                stored_bytes: 64 * 1024,
                unstored_bytes: 16 * 1024,
            },
            spill: SpillLimits {
                upper_count: 100,
                lower_count: 80,
                upper_bytes: 1024 * 1024,
                lower_bytes: 768 * 1024,
            },
            clock: clock.clone(),
            ..Self::default()
        };
        (options, clock)
    }

    /// Parses options from a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let options: Self = toml::from_str(source)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid store options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and parses a TOML options file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Renders the serialisable part of the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StoreError::InvalidArgument(format!("cannot serialise options: {e}")))
    }

    /// Checks that limits are coherent.
    pub fn validate(&self) -> Result<()> {
        if self.memory_size_multiplier == 0 {
            return Err(StoreError::InvalidArgument(
                "memory_size_multiplier must be at least 1".into(),
            ));
        }
        if self.spill.lower_count > self.spill.upper_count
            || self.spill.lower_bytes > self.spill.upper_bytes
        {
            return Err(StoreError::InvalidArgument(
                "spill lower limits must not exceed upper limits".into(),
            ));
        }
        Ok(())
    }

    /// Enables or disables expiry of items.
    pub fn items_can_expire(mut self, enabled: bool) -> Self {
        self.items_can_expire = enabled;
        self
    }

    /// Sets the footprint multiplier for unrestored items.
    pub fn memory_size_multiplier(mut self, multiplier: usize) -> Self {
        self.memory_size_multiplier = multiplier;
        self
    }

    /// Sets the discard cache budgets.
    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the spill thresholds.
    pub fn spill(mut self, spill: SpillLimits) -> Self {
        self.spill = spill;
        self
    }

    /// Sets the default stream depth.
    pub fn default_max_depth(mut self, depth: Option<u64>) -> Self {
        self.default_max_depth = depth;
        self
    }

    /// Enables or disables registration with the expiry index.
    pub fn expiry_enabled(mut self, enabled: bool) -> Self {
        self.expiry_enabled = enabled;
        self
    }

    /// Enables or disables registration with the delivery-delay index.
    pub fn delivery_delay_enabled(mut self, enabled: bool) -> Self {
        self.delivery_delay_enabled = enabled;
        self
    }

    /// Replaces the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
