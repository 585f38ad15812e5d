//! # Channel Registry
//!
//! Static configuration of the named streams the bus publishes to. The
//! registry is fixed at construction and never mutated afterwards.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use crate::error::{BusError, BusResult};
use crate::payload::MessageType;

/// Context mutation stream.
pub const CONTEXT_MUTATIONS: &str = "context_mutations";
/// Semantic validation results stream.
pub const SEMANTIC_VALIDATION: &str = "semantic_validation";
/// Coherence alerts stream.
pub const COHERENCE_ALERTS: &str = "coherence_alerts";
/// Fragment updates stream.
pub const FRAGMENT_UPDATES: &str = "fragment_updates";

const DAY: u64 = 24 * 60 * 60;

/// Configuration of a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    /// Stream name.
    pub name: String,
    /// Entries kept before the oldest are evicted.
    pub max_length: usize,
    /// Advisory retention window.
    pub retention: Duration,
    /// Kind of payload the channel carries.
    pub message_type: MessageType,
}

impl ChannelConfig {
    pub fn new(
        name: impl Into<String>,
        max_length: usize,
        retention: Duration,
        message_type: MessageType,
    ) -> Self {
        Self {
            name: name.into(),
            max_length,
            retention,
            message_type,
        }
    }

    /// Retention expressed in whole days, the unit operators configure it in.
    pub fn retention_days(&self) -> u64 {
        self.retention.as_secs() / DAY
    }
}

/// Configs of the four standard coherence channels.
pub fn standard_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new(
            CONTEXT_MUTATIONS,
            10_000,
            Duration::from_secs(7 * DAY),
            MessageType::ContextMutation,
        ),
        ChannelConfig::new(
            SEMANTIC_VALIDATION,
            5_000,
            Duration::from_secs(3 * DAY),
            MessageType::ValidationResult,
        ),
        ChannelConfig::new(
            COHERENCE_ALERTS,
            1_000,
            Duration::from_secs(30 * DAY),
            MessageType::CoherenceAlert,
        ),
        ChannelConfig::new(
            FRAGMENT_UPDATES,
            20_000,
            Duration::from_secs(14 * DAY),
            MessageType::FragmentUpdate,
        ),
    ]
}

/// Lookup table of registered channels.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelConfig>,
    /// Registration order, for deterministic provisioning.
    order: Vec<String>,
}

impl ChannelRegistry {
    /// Build a registry, rejecting empty bounds and duplicate names.
    pub fn new(configs: Vec<ChannelConfig>) -> BusResult<Self> {
        Self::check(&configs)?;
        Ok(Self::from_checked(configs))
    }

    /// The four standard coherence channels.
    pub fn standard() -> Self {
        Self::from_checked(standard_channels())
    }

    fn check(configs: &[ChannelConfig]) -> BusResult<()> {
        if configs.is_empty() {
            return Err(BusError::InvalidChannelConfig {
                reason: "registry must contain at least one channel".into(),
            });
        }

        let mut seen = HashSet::with_capacity(configs.len());
        for config in configs {
            if config.name.is_empty() {
                return Err(BusError::InvalidChannelConfig {
                    reason: "channel name must not be empty".into(),
                });
            }
            if config.max_length == 0 {
                return Err(BusError::InvalidChannelConfig {
                    reason: format!("channel {} has max_length 0", config.name),
                });
            }
            if !seen.insert(config.name.as_str()) {
                return Err(BusError::InvalidChannelConfig {
                    reason: format!("channel {} registered twice", config.name),
                });
            }
        }
        Ok(())
    }

    fn from_checked(configs: Vec<ChannelConfig>) -> Self {
        let mut channels = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());
        for config in configs {
            order.push(config.name.clone());
            channels.insert(config.name.clone(), config);
        }
        Self { channels, order }
    }

    /// Look up a channel, failing with a configuration error if unknown.
    pub fn get(&self, name: &str) -> BusResult<&ChannelConfig> {
        self.channels
            .get(name)
            .ok_or_else(|| BusError::UnknownChannel {
                channel: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Channels in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.order.iter().filter_map(|name| self.channels.get(name))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_channels() {
        let registry = ChannelRegistry::standard();
        assert_eq!(registry.len(), 4);

        let mutations = registry.get(CONTEXT_MUTATIONS).unwrap();
        assert_eq!(mutations.max_length, 10_000);
        assert_eq!(mutations.retention_days(), 7);

        assert_eq!(registry.get(SEMANTIC_VALIDATION).unwrap().max_length, 5_000);
        assert_eq!(registry.get(COHERENCE_ALERTS).unwrap().retention_days(), 30);
        assert_eq!(registry.get(FRAGMENT_UPDATES).unwrap().max_length, 20_000);
    }

    #[test]
    fn test_standard_table_passes_validation() {
        let checked = ChannelRegistry::new(standard_channels()).unwrap();
        let standard = ChannelRegistry::standard();
        assert_eq!(
            checked.iter().collect::<Vec<_>>(),
            standard.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_registration_order() {
        let names: Vec<_> = ChannelRegistry::standard()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                CONTEXT_MUTATIONS,
                SEMANTIC_VALIDATION,
                COHERENCE_ALERTS,
                FRAGMENT_UPDATES
            ]
        );
    }

    #[test]
    fn test_unknown_channel_is_configuration_error() {
        let registry = ChannelRegistry::standard();
        let err = registry.get("belief_updates").unwrap_err();
        assert!(matches!(err, BusError::UnknownChannel { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_rejects_zero_bound() {
        let result = ChannelRegistry::new(vec![ChannelConfig::new(
            "tiny",
            0,
            Duration::from_secs(60),
            MessageType::FragmentUpdate,
        )]);
        assert!(matches!(result, Err(BusError::InvalidChannelConfig { .. })));
    }

    #[test]
    fn test_rejects_duplicates() {
        let config = ChannelConfig::new(
            "dup",
            10,
            Duration::from_secs(60),
            MessageType::CoherenceAlert,
        );
        let result = ChannelRegistry::new(vec![config.clone(), config]);
        assert!(matches!(result, Err(BusError::InvalidChannelConfig { .. })));
    }

    #[test]
    fn test_rejects_empty_registry() {
        assert!(ChannelRegistry::new(Vec::new()).is_err());
    }
}
