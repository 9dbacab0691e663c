use std::time::Duration;

use crate::error::ConfigError;

/// Immutable engine configuration. Validated once at construction; all
/// fields are fixed afterwards.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How long a blocking operation waits on its future before failing
    /// with [`CacheError::Timeout`](crate::CacheError::Timeout).
    pub timeout: Duration,
    /// Maximum payload size of a single line, in bytes.
    pub max_item_size: usize,
    /// Skip a write (and the version bump) when the new payload is
    /// byte-equal to the current one.
    pub compare_before_write: bool,
    /// Recycle line records through a free list instead of dropping them.
    pub reuse_lines: bool,
    /// Recycle sharer sets through a free list instead of dropping them.
    pub reuse_sharer_sets: bool,
    /// Record rollback snapshots so transactions can be aborted.
    pub rollback_supported: bool,
    /// Weighted capacity of the shared (non-authoritative) cache;
    /// each line weighs 1 + payload length.
    pub max_capacity: u64,
    /// Strongly-consistent read mode. Not implemented; requesting it
    /// fails construction.
    pub synchronous: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200_000),
            max_item_size: 1024,
            compare_before_write: true,
            reuse_lines: true,
            reuse_sharer_sets: false,
            rollback_supported: true,
            max_capacity: 1024 * 1024,
            synchronous: false,
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.synchronous {
            return Err(ConfigError::SynchronousUnsupported);
        }
        if self.max_item_size == 0 {
            return Err(ConfigError::ZeroItemSize);
        }
        if self.max_capacity < 1 + self.max_item_size as u64 {
            return Err(ConfigError::CapacityTooSmall {
                capacity: self.max_capacity,
                max_item_size: self.max_item_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn synchronous_mode_is_rejected() {
        let config = CacheConfig {
            synchronous: true,
            ..CacheConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SynchronousUnsupported)
        );
    }

    #[test]
    fn capacity_must_hold_one_item() {
        let config = CacheConfig {
            max_capacity: 16,
            max_item_size: 1024,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CapacityTooSmall { .. })
        ));
    }
}
