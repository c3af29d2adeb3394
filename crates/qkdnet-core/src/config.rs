//! Service configuration.
//!
//! Both structs are plain parameters passed at construction; nothing reads
//! configuration from the environment after startup.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::error::QkdError;

/// Rejected configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Key sizes must be whole bytes.
    #[error("key size {0} is not a multiple of 8 bits")]
    NotByteAligned(u32),

    /// `min_key_size <= default_key_size <= max_key_size` does not hold.
    #[error("key size bounds out of order: min {min}, default {default}, max {max}")]
    KeySizeOrder {
        /// Minimum key size (bits).
        min: u32,
        /// Default key size (bits).
        default: u32,
        /// Maximum key size (bits).
        max: u32,
    },

    /// A TTL of zero would expire every block on arrival.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// KME configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct KmeConfig {
    /// Database file for the redb backend. `None` keeps state in memory.
    pub db_url: Option<PathBuf>,
    /// Block lifetime. Older blocks take no new allocations and are swept
    /// once unreferenced.
    pub ttl: Duration,
    /// Smallest key an application may request (bits).
    pub min_key_size: u32,
    /// Largest key an application may request (bits).
    pub max_key_size: u32,
    /// Key size used when a request names none (bits).
    pub default_key_size: u32,
    /// Extra keys generated per batch and kept locally for the next request.
    /// Zero disables prefetching.
    pub prefetch_keys: usize,
    /// Reported in status replies: keys a session may hold.
    pub max_key_count: usize,
    /// Upper bound on keys in one request.
    pub max_keys_per_request: u32,
    /// Reported in status replies: additional slave applications per key.
    pub max_sae_id_count: u32,
}

impl Default for KmeConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            ttl: Duration::from_secs(15),
            min_key_size: 64,
            max_key_size: 1024,
            default_key_size: 256,
            prefetch_keys: 0,
            max_key_count: 100_000,
            max_keys_per_request: 128,
            max_sae_id_count: 0,
        }
    }
}

impl KmeConfig {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("ttl"));
        }
        for size in [self.min_key_size, self.default_key_size, self.max_key_size] {
            if size % 8 != 0 || size == 0 {
                return Err(ConfigError::NotByteAligned(size));
            }
        }
        let ordered = self.min_key_size <= self.default_key_size
            && self.default_key_size <= self.max_key_size;
        if !ordered {
            return Err(ConfigError::KeySizeOrder {
                min: self.min_key_size,
                default: self.default_key_size,
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    /// Resolves the key size for a request.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the size is outside the configured bounds or not
    /// whole bytes.
    pub fn resolve_key_size(&self, requested: Option<u32>) -> Result<u32, QkdError> {
        let size = requested.unwrap_or(self.default_key_size);
        if size % 8 != 0 {
            return Err(QkdError::InvalidRequest(format!("key size {size} is not whole bytes")));
        }
        if size < self.min_key_size || size > self.max_key_size {
            return Err(QkdError::InvalidRequest(format!(
                "key size {size} outside [{}, {}]",
                self.min_key_size, self.max_key_size
            )));
        }
        Ok(size)
    }
}

/// Extra rate demanded of a relayed session's first edge when prefetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverheadPolicy {
    /// Each prefetched key costs a full key's rate: `rate * prefetch`.
    #[default]
    Additive,
    /// The prefetch batch is spread over the keys it serves:
    /// `rate / prefetch`.
    Amortized,
}

impl OverheadPolicy {
    /// Overhead on top of `rate` for `prefetch` extra keys.
    pub fn overhead(self, rate: f64, prefetch: usize) -> f64 {
        if prefetch == 0 {
            return 0.0;
        }
        match self {
            Self::Additive => rate * prefetch as f64,
            Self::Amortized => rate / prefetch as f64,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Unmatched registrations older than this are purged.
    pub pending_ttl: Duration,
    /// Span of each edge's capacity window.
    pub capacity_window: Duration,
    /// Expected spacing of rate reports; sizes the capacity buffer.
    pub sample_interval: Duration,
    /// Prefetch count the KMEs run with.
    pub prefetch_keys: usize,
    /// How prefetch overhead is charged to the first edge.
    pub overhead_policy: OverheadPolicy,
    /// Node count at which the topology is considered complete.
    pub expected_nodes: Option<usize>,
    /// Edge count at which the topology is considered complete.
    pub expected_links: Option<usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(15),
            capacity_window: Duration::from_secs(15),
            sample_interval: Duration::from_secs(1),
            prefetch_keys: 0,
            overhead_policy: OverheadPolicy::Additive,
            expected_nodes: None,
            expected_links: None,
        }
    }
}

impl ControllerConfig {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroDuration`] for a zero TTL or window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("pending_ttl"));
        }
        if self.capacity_window.is_zero() {
            return Err(ConfigError::ZeroDuration("capacity_window"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(KmeConfig::default().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unaligned_sizes() {
        let config = KmeConfig { min_key_size: 60, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NotByteAligned(60)));
    }

    #[test]
    fn resolves_key_size() {
        let config = KmeConfig::default();
        assert_eq!(config.resolve_key_size(None).unwrap(), 256);
        assert_eq!(config.resolve_key_size(Some(128)).unwrap(), 128);
        assert!(config.resolve_key_size(Some(4096)).is_err());
        assert!(config.resolve_key_size(Some(129)).is_err());
    }

    #[test]
    fn overhead_policies() {
        assert!((OverheadPolicy::Additive.overhead(10.0, 3) - 30.0).abs() < f64::EPSILON);
        assert!((OverheadPolicy::Amortized.overhead(9.0, 3) - 3.0).abs() < f64::EPSILON);
        assert!(OverheadPolicy::Additive.overhead(10.0, 0).abs() < f64::EPSILON);
    }
}
