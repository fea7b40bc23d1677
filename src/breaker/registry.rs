use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::circuit::{load_all_rows, snapshot_of};
use super::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::clock::{to_millis, ClockRef, SystemClock};
use crate::config::Config;
use crate::store::{Store, StoreError};

/// One breaker per service name, created on first use.
///
/// Breakers for different services share the store but nothing else, so a
/// failing image API never blocks calls to the renderer.
pub struct BreakerRegistry {
    store: Store,
    clock: ClockRef,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(store: Store, defaults: BreakerConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(store: Store, config: &Config) -> Self {
        let mut registry = Self::new(store, config.breaker.clone());
        registry.overrides = config.breakers.clone();
        registry
    }

    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Settings used for `service`.
    pub fn config_for(&self, service: &str) -> BreakerConfig {
        self.overrides
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Breaker for `service`, creating it on first use.
    pub async fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(service) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(service.to_string()).or_insert_with(|| {
            tracing::debug!(breaker = %service, "Creating circuit breaker");
            Arc::new(
                CircuitBreaker::new(service, self.config_for(service), self.store.clone())
                    .with_clock(Arc::clone(&self.clock)),
            )
        });
        Arc::clone(breaker)
    }

    /// Every breaker that has persisted state, including ones other
    /// processes created.
    pub async fn snapshots(&self) -> Result<Vec<BreakerSnapshot>, StoreError> {
        let rows = self
            .store
            .call(|conn| -> Result<_, StoreError> {
                let tx = conn.transaction()?;
                let rows = load_all_rows(&tx)?;
                tx.commit()?;
                Ok(rows)
            })
            .await?;

        let now_ms = to_millis(self.clock.now());
        Ok(rows
            .iter()
            .map(|(name, row)| snapshot_of(name, row, &self.config_for(name), now_ms))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerError, CircuitState};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    async fn registry() -> BreakerRegistry {
        let store = Store::open_in_memory().await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 14, 10, 0, 0).unwrap());
        BreakerRegistry::new(store, BreakerConfig::new(2, 5_000, 60_000))
            .with_clock(Arc::new(clock))
            .with_override("doc-render", BreakerConfig::new(5, 5_000, 10_000))
    }

    #[tokio::test]
    async fn test_same_name_shares_instance() {
        let registry = registry().await;
        let a = registry.get("image-gen").await;
        let b = registry.get("image-gen").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().failure_threshold, 2);
        assert_eq!(registry.get("doc-render").await.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_failing_service_does_not_block_others() {
        let registry = registry().await;
        let images = registry.get("image-gen").await;
        for _ in 0..2 {
            let _ = images
                .execute(|| async { Err::<(), _>("503 from image api") })
                .await;
        }
        assert_eq!(images.state().await.unwrap(), CircuitState::Open);

        let vision = registry.get("vision").await;
        let result: Result<&str, BreakerError<&str>> =
            vision.execute(|| async { Ok("ok") }).await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(vision.state().await.unwrap(), CircuitState::Closed);

        let snapshots = registry.snapshots().await.unwrap();
        let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["image-gen"]);
        assert_eq!(snapshots[0].state, CircuitState::Open);
        assert_eq!(snapshots[0].remaining_ms, 60_000);
    }

    #[tokio::test]
    async fn test_from_config_applies_overrides() {
        let config = Config::from_yaml_str(
            r#"
breaker:
  failure_threshold: 5
breakers:
  doc-render:
    failure_threshold: 2
"#,
        )
        .unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let registry = BreakerRegistry::from_config(store, &config);

        assert_eq!(registry.config_for("doc-render").failure_threshold, 2);
        assert_eq!(registry.config_for("image-gen").failure_threshold, 5);
        assert_eq!(registry.get("doc-render").await.config().failure_threshold, 2);
    }
}
