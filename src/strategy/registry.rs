//! Named strategy construction.

use super::{
    ConsumerStrategy, DispatchToSingleStrategy, PinnedStrategy, RoundRobinStrategy,
    DEFAULT_CORRELATION_PROPERTY,
};
use crate::error::{Result, SubscriptionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Strategy selected for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "PascalCase")]
pub enum ConsumerStrategyKind {
    RoundRobin,
    DispatchToSingle,
    Pinned,
    PinnedByCorrelation {
        #[serde(default = "default_correlation_property")]
        property: String,
    },
    /// A strategy registered under this name.
    Custom { strategy: String },
}

fn default_correlation_property() -> String {
    DEFAULT_CORRELATION_PROPERTY.to_string()
}

impl ConsumerStrategyKind {
    /// Parse a strategy name. Names that are not built in become `Custom`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "RoundRobin" => ConsumerStrategyKind::RoundRobin,
            "DispatchToSingle" => ConsumerStrategyKind::DispatchToSingle,
            "Pinned" => ConsumerStrategyKind::Pinned,
            "PinnedByCorrelation" => ConsumerStrategyKind::PinnedByCorrelation {
                property: default_correlation_property(),
            },
            other => ConsumerStrategyKind::Custom {
                strategy: other.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConsumerStrategyKind::RoundRobin => "RoundRobin",
            ConsumerStrategyKind::DispatchToSingle => "DispatchToSingle",
            ConsumerStrategyKind::Pinned => "Pinned",
            ConsumerStrategyKind::PinnedByCorrelation { .. } => "PinnedByCorrelation",
            ConsumerStrategyKind::Custom { strategy } => strategy,
        }
    }
}

impl Default for ConsumerStrategyKind {
    fn default() -> Self {
        ConsumerStrategyKind::RoundRobin
    }
}

impl fmt::Display for ConsumerStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Builds a strategy instance for one subscription.
pub type StrategyFactory =
    Arc<dyn Fn(&ConsumerStrategyKind) -> Box<dyn ConsumerStrategy> + Send + Sync>;

/// Strategy factories by name.
#[derive(Clone)]
pub struct ConsumerStrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl ConsumerStrategyRegistry {
    /// A registry holding the built-in strategies.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("RoundRobin", Arc::new(|_| Box::new(RoundRobinStrategy::new())));
        registry.register(
            "DispatchToSingle",
            Arc::new(|_| Box::new(DispatchToSingleStrategy::new())),
        );
        registry.register("Pinned", Arc::new(|_| Box::new(PinnedStrategy::by_stream())));
        registry.register(
            "PinnedByCorrelation",
            Arc::new(|kind| {
                let property = match kind {
                    ConsumerStrategyKind::PinnedByCorrelation { property } => property.clone(),
                    _ => default_correlation_property(),
                };
                Box::new(PinnedStrategy::by_correlation(property))
            }),
        );
        registry
    }

    /// Register (or replace) a factory.
    pub fn register(&mut self, name: impl Into<String>, factory: StrategyFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, kind: &ConsumerStrategyKind) -> bool {
        self.factories.contains_key(kind.name())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, kind: &ConsumerStrategyKind) -> Result<Box<dyn ConsumerStrategy>> {
        let factory = self
            .factories
            .get(kind.name())
            .ok_or_else(|| SubscriptionError::UnknownConsumerStrategy(kind.name().to_string()))?;
        Ok(factory(kind))
    }
}

impl Default for ConsumerStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = ConsumerStrategyRegistry::new();
        for name in ["RoundRobin", "DispatchToSingle", "Pinned", "PinnedByCorrelation"] {
            let strategy = registry.create(&ConsumerStrategyKind::from_name(name)).unwrap();
            assert_eq!(strategy.name(), name);
        }
    }

    #[test]
    fn test_unknown_strategy() {
        let registry = ConsumerStrategyRegistry::new();
        let kind = ConsumerStrategyKind::from_name("Random");
        assert!(!registry.contains(&kind));
        assert!(matches!(
            registry.create(&kind),
            Err(SubscriptionError::UnknownConsumerStrategy(name)) if name == "Random"
        ));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ConsumerStrategyRegistry::new();
        registry.register("Random", Arc::new(|_| Box::new(RoundRobinStrategy::new())));
        assert!(registry.create(&ConsumerStrategyKind::from_name("Random")).is_ok());
    }

    #[test]
    fn test_kind_serialization() {
        let kind = ConsumerStrategyKind::PinnedByCorrelation {
            property: "tenant".into(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"name":"PinnedByCorrelation","property":"tenant"}"#);

        let parsed: ConsumerStrategyKind =
            serde_json::from_str(r#"{"name":"PinnedByCorrelation"}"#).unwrap();
        assert_eq!(parsed, ConsumerStrategyKind::from_name("PinnedByCorrelation"));
    }
}
