use std::{collections::HashSet, sync::Arc};

use crate::config::Config;
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::relay::{ChatRelay, Relay};

/// Relay instances keyed by name, in configuration order.
pub struct RelayRegistry {
    relays: Vec<Arc<dyn ChatRelay>>,
}

impl RelayRegistry {
    /// Build every configured relay on a shared client, resolving URLs and
    /// credentials through `env`.
    pub fn from_config_with(
        cfg: &Config,
        http: &HttpClient,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> CoreResult<Self> {
        cfg.validate()?;
        let relays = cfg
            .relays
            .iter()
            .map(|profile| {
                let relay = Relay::from_profile(profile.clone(), http.clone(), env);
                if !relay.is_configured() {
                    // Not fatal: the relay answers 500 until the environment is fixed.
                    tracing::warn!(
                        relay = %profile.name,
                        "relay is missing its upstream URL or API key"
                    );
                }
                Arc::new(relay) as Arc<dyn ChatRelay>
            })
            .collect();
        Self::from_relays(relays)
    }

    /// Wrap prebuilt relays. Names must be unique.
    pub fn from_relays(relays: Vec<Arc<dyn ChatRelay>>) -> CoreResult<Self> {
        let mut seen = HashSet::with_capacity(relays.len());
        for r in &relays {
            if !seen.insert(r.name()) {
                return Err(RelayError::Config(format!("duplicate relay name '{}'", r.name())));
            }
        }
        Ok(Self { relays })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ChatRelay>> {
        self.relays.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.relays.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}
