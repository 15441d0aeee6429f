//! Workload identity context.
//!
//! Binds workload identifiers to a credential provider and resource scope,
//! and hands out the [`TokenBroker`] for that pair. Brokers are shared: all
//! workloads that resolve to the same `(provider, scope)` use one cache.
//!
//! The context is an explicit object with a lifecycle. It is built once at
//! startup, passed to whoever needs tokens, and shut down at the end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::auth::{BrokerOptions, Clock, SystemClock, TokenBroker};
use crate::config::{ProviderSettings, Settings};
use crate::error::{ConfigError, IdentityError};

/// A registered workload and the scope its tokens are requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub workload_user_id: String,
    pub provider: String,
    pub resource_scope: String,
}

type BrokerKey = (String, String);

pub struct IdentityContext {
    providers: HashMap<String, ProviderSettings>,
    workloads: HashMap<String, WorkloadIdentity>,
    /// `None` once shut down.
    brokers: Mutex<Option<HashMap<BrokerKey, TokenBroker>>>,
    http: reqwest::Client,
    options: BrokerOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityContext")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("workloads", &self.workloads.keys().collect::<Vec<_>>())
            .field("brokers", &self.broker_count())
            .finish_non_exhaustive()
    }
}

impl IdentityContext {
    /// Build the context from validated settings.
    pub fn from_settings(settings: &Settings, http: reqwest::Client) -> Result<Self, ConfigError> {
        settings.validate()?;
        let workloads = settings.workloads.iter().map(|w| WorkloadIdentity {
            workload_user_id: w.workload_user_id.clone(),
            provider: w.provider.clone(),
            resource_scope: w.resource_scope.clone(),
        });
        Self::new(
            settings.providers.clone().into_iter().collect(),
            workloads,
            http,
            settings.broker_options(),
        )
    }

    pub fn new<I>(
        providers: HashMap<String, ProviderSettings>,
        workloads: I,
        http: reqwest::Client,
        options: BrokerOptions,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = WorkloadIdentity>,
    {
        let mut by_id = HashMap::new();
        for workload in workloads {
            let Some(provider) = providers.get(&workload.provider) else {
                return Err(ConfigError::Invalid(format!(
                    "workload '{}' references unknown provider '{}'",
                    workload.workload_user_id, workload.provider
                )));
            };
            provider.credential(&workload.resource_scope)?;
            if by_id.contains_key(&workload.workload_user_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate workload '{}'",
                    workload.workload_user_id
                )));
            }
            by_id.insert(workload.workload_user_id.clone(), workload);
        }

        Ok(Self {
            providers,
            workloads: by_id,
            brokers: Mutex::new(Some(HashMap::new())),
            http,
            options,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use a specific clock for every broker created from now on.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock_brokers(&self) -> MutexGuard<'_, Option<HashMap<BrokerKey, TokenBroker>>> {
        self.brokers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registered identity for `workload_user_id`.
    pub fn identity(&self, workload_user_id: &str) -> Result<&WorkloadIdentity, IdentityError> {
        self.workloads
            .get(workload_user_id)
            .ok_or_else(|| IdentityError::UnknownWorkload {
                workload_user_id: workload_user_id.to_string(),
            })
    }

    /// The token broker for a workload, created on first use.
    pub fn resolve(&self, workload_user_id: &str) -> Result<TokenBroker, IdentityError> {
        let identity = self.identity(workload_user_id)?;

        let mut guard = self.lock_brokers();
        let brokers = guard.as_mut().ok_or(IdentityError::ContextClosed)?;
        let key = (identity.provider.clone(), identity.resource_scope.clone());
        if let Some(broker) = brokers.get(&key) {
            return Ok(broker.clone());
        }

        // Presence and validity were checked at construction.
        let credential = self
            .providers
            .get(&identity.provider)
            .and_then(|p| p.credential(&identity.resource_scope).ok())
            .ok_or_else(|| IdentityError::UnknownWorkload {
                workload_user_id: workload_user_id.to_string(),
            })?;

        let broker = TokenBroker::with_clock(
            credential,
            self.http.clone(),
            self.options.clone(),
            Arc::clone(&self.clock),
        );
        tracing::debug!(
            workload_user_id,
            provider = %identity.provider,
            scope = %identity.resource_scope,
            "created token broker"
        );
        brokers.insert(key, broker.clone());
        Ok(broker)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &WorkloadIdentity> {
        self.workloads.values()
    }

    /// Number of live brokers.
    pub fn broker_count(&self) -> usize {
        self.lock_brokers().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_brokers().is_none()
    }

    /// Drop every broker; later `resolve` calls fail with `ContextClosed`.
    pub fn shutdown(&self) {
        if let Some(brokers) = self.lock_brokers().take() {
            tracing::debug!(brokers = brokers.len(), "identity context shut down");
        }
    }
}
