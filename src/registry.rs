use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::error::{Result, SimError};
use crate::logging::{log, log_duplicate_name, obj, v_str, Domain, Level};
use crate::strategy::{Strategy, StrategyDefinition};

/// Suffixes appended to a colliding strategy name.
pub const DUPLICATE_SUFFIXES: [&str; 4] = [" (new)", " (other)", " (better?)", " (duplicate)"];

/// Known strategies, in registration order.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, renaming it if the name is already taken.
    pub fn register(&mut self, definition: StrategyDefinition) -> Arc<Strategy> {
        let mut strategy = Strategy::from_definition(definition);
        let original = strategy.name().to_string();
        if self.contains(&original) {
            let renamed = self.unique_name(&original);
            log_duplicate_name(&original, &renamed);
            strategy.rename(renamed);
        }
        let strategy = Arc::new(strategy);
        log(
            Level::Info,
            Domain::Registry,
            "registered",
            obj(&[
                ("strategy", v_str(strategy.name())),
                ("compiled", serde_json::Value::Bool(strategy.decision_function().is_some())),
            ]),
        );
        self.strategies.push(Arc::clone(&strategy));
        strategy
    }

    /// Suffix `name` with a randomly chosen free suffix; repeats on the
    /// suffixed name if every suffix is taken.
    fn unique_name(&self, name: &str) -> String {
        let mut rng = rand::thread_rng();
        let mut base = name.to_string();
        loop {
            let mut suffixes = DUPLICATE_SUFFIXES;
            suffixes.shuffle(&mut rng);
            if let Some(candidate) = suffixes
                .iter()
                .map(|suffix| format!("{}{}", base, suffix))
                .find(|candidate| !self.contains(candidate))
            {
                return candidate;
            }
            base.push_str(suffixes[0]);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Strategy>> {
        self.strategies.iter().find(|s| s.name() == name).cloned()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Strategy>> {
        self.find_by_name(name)
            .ok_or_else(|| SimError::StrategyNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Strategy>> {
        self.strategies.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
