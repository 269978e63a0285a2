//! Async client tying push channels, REST calls and the shared cache together.
//!
//! [`SyncClient`] owns the [`SyncCore`] behind a tokio mutex. Channel tasks
//! write to it when events arrive; queries and mutations write to it around
//! their REST calls. The lock is never held across a network await.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
};

use nereo_core::{
    CacheKey, Environment, FailureNotice, FetchOutcome, Outcome, Scope, Settlement,
    SpeculativeUpdate, Subscription, SyncCore,
};
use nereo_proto::{BookingStatus, BookingStatusUpdate, NewSubscriber, SubscriberAction, paths};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::{
    ApiClient, ApiError, ChannelDriver, ChannelHandle, ClientConfig, ClientError, Connector,
    HttpConnector, SystemEnv,
};

/// Capacity of the notice and invalidation broadcasts.
const BROADCAST_CAPACITY: usize = 64;

/// Real-time cache client.
pub struct SyncClient<E: Environment = SystemEnv, C: Connector = HttpConnector> {
    env: E,
    config: ClientConfig,
    api: ApiClient,
    connector: Arc<C>,
    core: Arc<Mutex<SyncCore>>,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    queries: Mutex<BTreeMap<CacheKey, String>>,
    notices: broadcast::Sender<FailureNotice>,
    invalidations: broadcast::Sender<Vec<CacheKey>>,
}

impl SyncClient {
    /// Client for `config` using the system clock and an HTTP transport.
    ///
    /// REST calls and push streams share one reqwest client, and with it the
    /// session cookies.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let api = ApiClient::new(http.clone(), &config);
        let connector = HttpConnector::new(http, &config);
        Ok(Self::with_parts(SystemEnv::new(), connector, api, config))
    }
}

impl<E: Environment, C: Connector> SyncClient<E, C> {
    /// Client from explicit parts.
    pub fn with_parts(env: E, connector: C, api: ApiClient, config: ClientConfig) -> Self {
        let (notices, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (invalidations, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            env,
            config,
            api,
            connector: Arc::new(connector),
            core: Arc::new(Mutex::new(SyncCore::new())),
            channels: Mutex::new(HashMap::new()),
            queries: Mutex::new(BTreeMap::new()),
            notices,
            invalidations,
        }
    }

    /// Configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared cache state.
    pub fn core(&self) -> Arc<Mutex<SyncCore>> {
        Arc::clone(&self.core)
    }

    /// Current value under `key`.
    pub async fn cached(&self, key: &CacheKey) -> Option<Value> {
        self.core.lock().await.cache().get(key).cloned()
    }

    /// Notices of rolled back mutations, one per failure.
    pub fn notices(&self) -> broadcast::Receiver<FailureNotice> {
        self.notices.subscribe()
    }

    /// Keys marked stale by push events or settled mutations.
    pub fn invalidations(&self) -> broadcast::Receiver<Vec<CacheKey>> {
        self.invalidations.subscribe()
    }

    /// Open a push channel for `subscription`.
    ///
    /// A channel already open for the same topic key is closed first, so a
    /// tenant switch never leaves two streams feeding the cache.
    pub async fn subscribe(&self, subscription: Subscription) -> ChannelHandle {
        let (driver, handle) = ChannelDriver::new(
            self.env.clone(),
            Arc::clone(&self.connector),
            subscription,
            self.config.channel.clone(),
            Arc::clone(&self.core),
            self.invalidations.clone(),
        );

        let previous = self.channels.lock().await.insert(handle.key(), handle.clone());
        if let Some(previous) = previous {
            tracing::debug!(channel = %handle.key(), "replacing channel");
            previous.close().await;
        }

        tokio::spawn(driver.run());
        handle
    }

    /// Handle of the channel open for `key`.
    pub async fn channel(&self, key: &str) -> Option<ChannelHandle> {
        self.channels.lock().await.get(key).cloned()
    }

    /// Close the channel open for `key`. Returns false if there was none.
    pub async fn unsubscribe(&self, key: &str) -> bool {
        let handle = self.channels.lock().await.remove(key);
        match handle {
            Some(handle) => {
                handle.close().await;
                true
            },
            None => false,
        }
    }

    /// Close every channel.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self.channels.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }

    /// Remember that `key` is loaded from `path`, so it can be refetched.
    pub async fn register_query(&self, key: CacheKey, path: impl Into<String>) {
        self.queries.lock().await.insert(key, path.into());
    }

    /// Registered queries.
    pub async fn queries(&self) -> Vec<(CacheKey, String)> {
        self.queries.lock().await.iter().map(|(k, p)| (k.clone(), p.clone())).collect()
    }

    /// Load `key` from `path` and register it.
    ///
    /// The result is dropped if an optimistic write hit `key` while the
    /// request was in flight. It is stored but left stale if `key` was
    /// invalidated meanwhile.
    pub async fn fetch(&self, key: CacheKey, path: &str) -> Result<FetchOutcome, ClientError> {
        self.register_query(key.clone(), path).await;

        let ticket = self.core.lock().await.begin_fetch(&key);
        let value = self.api.get_json(path).await?;
        let outcome = self.core.lock().await.complete_fetch(ticket, value);

        match outcome {
            FetchOutcome::Stored => {},
            FetchOutcome::StoredStale => tracing::debug!(%key, "fetch outdated by an invalidation"),
            FetchOutcome::Superseded => tracing::debug!(%key, "fetch superseded by a newer write"),
        }
        Ok(outcome)
    }

    /// Refetch every registered query whose entry is stale.
    ///
    /// Failures are logged and leave the entry stale for the next round.
    /// Returns the keys that were refreshed.
    pub async fn refetch_stale(&self) -> Vec<CacheKey> {
        let stale = self.core.lock().await.stale_keys();
        self.refetch(&stale).await
    }

    /// Refetch every registered query, for fallback polling.
    pub async fn refetch_all(&self) -> Vec<CacheKey> {
        let keys: Vec<_> = self.queries.lock().await.keys().cloned().collect();
        self.refetch(&keys).await
    }

    async fn refetch(&self, keys: &[CacheKey]) -> Vec<CacheKey> {
        let targets: Vec<(CacheKey, String)> = {
            let queries = self.queries.lock().await;
            keys.iter()
                .filter_map(|key| queries.get(key).map(|path| (key.clone(), path.clone())))
                .collect()
        };

        let mut refreshed = Vec::new();
        for (key, path) in targets {
            match self.fetch(key.clone(), &path).await {
                Ok(FetchOutcome::Stored) => refreshed.push(key),
                Ok(FetchOutcome::StoredStale | FetchOutcome::Superseded) => {},
                Err(ClientError::Api(e)) if e.is_transient() => {
                    tracing::debug!(%key, "refetch failed, retrying next round: {}", e);
                },
                Err(e) => tracing::warn!(%key, "refetch failed: {}", e),
            }
        }
        refreshed
    }

    async fn refresh(&self, invalidated: Vec<CacheKey>) {
        if invalidated.is_empty() {
            return;
        }
        let _ = self.invalidations.send(invalidated.clone());
        self.refetch(&invalidated).await;
    }

    /// Renew a membership.
    pub async fn renew_subscriber(
        &self,
        scope: &Scope,
        subscriber_id: &str,
    ) -> Result<Value, ClientError> {
        self.subscriber_action(scope, subscriber_id, SubscriberAction::Renew).await
    }

    /// Pause a membership.
    pub async fn pause_subscriber(
        &self,
        scope: &Scope,
        subscriber_id: &str,
    ) -> Result<Value, ClientError> {
        self.subscriber_action(scope, subscriber_id, SubscriberAction::Pause).await
    }

    /// Cancel a membership.
    pub async fn cancel_subscriber(
        &self,
        scope: &Scope,
        subscriber_id: &str,
    ) -> Result<Value, ClientError> {
        self.subscriber_action(scope, subscriber_id, SubscriberAction::Cancel).await
    }

    /// Run a membership action with an optimistic status change.
    pub async fn subscriber_action(
        &self,
        scope: &Scope,
        subscriber_id: &str,
        action: SubscriberAction,
    ) -> Result<Value, ClientError> {
        let update = SpeculativeUpdate::subscriber_status(scope.clone(), subscriber_id, action);
        let path = paths::subscriber_action(subscriber_id, action);
        self.run_mutation(&update, self.api.post(&path)).await
    }

    /// Create a subscriber, showing a placeholder row until the list is
    /// refetched.
    pub async fn create_subscriber(
        &self,
        scope: &Scope,
        request: &NewSubscriber,
    ) -> Result<Value, ClientError> {
        let temp_id = format!("temp-{:x}", self.env.random_u64());
        let update = SpeculativeUpdate::create_subscriber(scope.clone(), request, temp_id);
        let path = paths::subscribers();
        self.run_mutation(&update, self.api.post_json(&path, request)).await
    }

    /// Move a booking to another kanban column.
    pub async fn move_booking(
        &self,
        scope: &Scope,
        booking_id: &str,
        status: BookingStatus,
    ) -> Result<Value, ClientError> {
        let update = SpeculativeUpdate::booking_status(scope.clone(), booking_id, status);
        let path = paths::booking_status(booking_id);
        let body = BookingStatusUpdate { status };
        self.run_mutation(&update, self.api.patch_json(&path, &body)).await
    }

    /// Apply `update`, await `request`, then commit or roll back.
    ///
    /// Either way the affected entries end up invalidated and the registered
    /// ones refetched. On rollback the snapshots are restored first and
    /// exactly one notice is published.
    async fn run_mutation<F>(
        &self,
        update: &SpeculativeUpdate,
        request: F,
    ) -> Result<Value, ClientError>
    where
        F: Future<Output = Result<Value, ApiError>>,
    {
        let id = self.core.lock().await.begin_update(update);
        tracing::debug!(mutation = %id, target = update.target(), "mutation started");

        let result = request.await;
        let outcome = match &result {
            Ok(_) => Outcome::Commit,
            Err(e) => Outcome::Rollback { message: Some(e.message()) },
        };
        let settlement = self.core.lock().await.settle(id, outcome);

        match (result, settlement) {
            (Ok(value), Settlement::Committed { invalidated }) => {
                self.refresh(invalidated).await;
                Ok(value)
            },
            (Err(source), Settlement::RolledBack { notice, invalidated }) => {
                let _ = self.notices.send(notice.clone());
                self.refresh(invalidated).await;
                Err(ClientError::Rejected { notice, source })
            },
            (Ok(value), Settlement::AlreadySettled | Settlement::RolledBack { .. }) => Ok(value),
            (Err(source), Settlement::AlreadySettled | Settlement::Committed { .. }) => {
                Err(ClientError::Api(source))
            },
        }
    }
}
