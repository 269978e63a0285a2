//! Simulated push channel.
//!
//! Drives a [`Channel`] the way the tokio driver does, but synchronously and
//! against a scripted server: every `Connect` the state machine asks for is
//! answered according to the channel's [`StreamBehavior`], delivered payloads
//! go straight into the shared [`SyncCore`]. Transports are only removed when
//! the state machine closes them or the server drops them, so a leaked
//! transport stays visible to the invariants.

use std::collections::{BTreeMap, VecDeque};

use arbitrary::Arbitrary;
use nereo_core::{
    ApplyOutcome, CacheKey, Channel, ChannelAction, ChannelConfig, ChannelStatus, EventRouter,
    MergeOutcome, ReconcilePlan, Subscription, SyncCore,
};

use crate::sim_env::SimInstant;

/// How the simulated server answers a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Arbitrary)]
pub enum StreamBehavior {
    /// Open the stream right away
    #[default]
    Accept,
    /// Fail the request right away (5xx, refused connection)
    Reject,
    /// Never answer
    Silent,
}

/// Server side of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Request sent, no answer yet
    Pending,
    /// Stream open
    Open,
}

/// What happened while executing channel actions.
#[derive(Debug, Default)]
pub struct Effects {
    /// Keys marked stale by delivered events
    pub invalidated: Vec<CacheKey>,
    /// Keys whose value changed through a merge
    pub merged: Vec<CacheKey>,
}

/// One channel plus the server side of its transports.
#[derive(Debug)]
pub struct SimChannel {
    channel: Channel<SimInstant>,
    router: EventRouter,
    config: ChannelConfig,
    behavior: StreamBehavior,
    transports: BTreeMap<u64, TransportState>,
    connects: Vec<SimInstant>,
    statuses: Vec<(SimInstant, ChannelStatus)>,
    delivered: usize,
}

impl SimChannel {
    /// Channel for `subscription`, not yet opened.
    pub fn new(subscription: Subscription, config: ChannelConfig) -> Self {
        Self {
            channel: Channel::new(&subscription, config.clone()),
            router: EventRouter::new(subscription),
            config,
            behavior: StreamBehavior::Accept,
            transports: BTreeMap::new(),
            connects: Vec::new(),
            statuses: Vec::new(),
            delivered: 0,
        }
    }

    /// Topic key.
    pub fn key(&self) -> &str {
        self.channel.key()
    }

    /// Subscription the channel serves.
    pub fn subscription(&self) -> &Subscription {
        self.router.subscription()
    }

    /// The state machine.
    pub fn channel(&self) -> &Channel<SimInstant> {
        &self.channel
    }

    /// Configuration the channel was built with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// How the server answers the next stream requests.
    pub fn behavior(&self) -> StreamBehavior {
        self.behavior
    }

    /// Change how the server answers stream requests from now on.
    pub fn set_behavior(&mut self, behavior: StreamBehavior) {
        self.behavior = behavior;
    }

    /// Transports the server still considers alive.
    pub fn transports(&self) -> &BTreeMap<u64, TransportState> {
        &self.transports
    }

    /// Times at which the state machine asked for a connection.
    pub fn connects(&self) -> &[SimInstant] {
        &self.connects
    }

    /// Every published status, in order.
    pub fn statuses(&self) -> &[(SimInstant, ChannelStatus)] {
        &self.statuses
    }

    /// Payloads handed to the router.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Start the first attempt.
    pub fn open(&mut self, now: SimInstant, core: &mut SyncCore) -> Effects {
        match self.channel.open(now) {
            Ok(actions) => self.execute(now, actions, core),
            Err(e) => {
                tracing::warn!(channel = %self.key(), "open rejected: {}", e);
                Effects::default()
            },
        }
    }

    /// Fire due timers.
    pub fn tick(&mut self, now: SimInstant, core: &mut SyncCore) -> Effects {
        let actions = self.channel.tick(now);
        self.execute(now, actions, core)
    }

    /// Answer a silent request: open the oldest pending transport.
    pub fn accept_pending(&mut self, now: SimInstant, core: &mut SyncCore) -> Effects {
        let pending = self
            .transports
            .iter()
            .find(|(_, state)| **state == TransportState::Pending)
            .map(|(attempt, _)| *attempt);

        match pending {
            Some(attempt) => {
                self.transports.insert(attempt, TransportState::Open);
                let actions = self.channel.handle_opened(attempt, now);
                self.execute(now, actions, core)
            },
            None => Effects::default(),
        }
    }

    /// Server ends every transport, open or pending.
    pub fn drop_streams(&mut self, now: SimInstant, core: &mut SyncCore) -> Effects {
        let attempts: Vec<u64> = self.transports.keys().copied().collect();
        let mut effects = Effects::default();
        for attempt in attempts {
            self.transports.remove(&attempt);
            let actions = self.channel.handle_error(attempt, now);
            effects.extend(self.execute(now, actions, core));
        }
        effects
    }

    /// Server pushes `raw` on every open transport.
    pub fn push(&mut self, now: SimInstant, raw: &str, core: &mut SyncCore) -> Effects {
        let open: Vec<u64> = self
            .transports
            .iter()
            .filter(|(_, state)| **state == TransportState::Open)
            .map(|(attempt, _)| *attempt)
            .collect();

        let mut effects = Effects::default();
        for attempt in open {
            let actions = self.channel.handle_message(attempt, raw.to_owned());
            effects.extend(self.execute(now, actions, core));
        }
        effects
    }

    /// Tear the channel down.
    pub fn close(&mut self, now: SimInstant, core: &mut SyncCore) -> Effects {
        let actions = self.channel.close();
        self.execute(now, actions, core)
    }

    fn execute(
        &mut self,
        now: SimInstant,
        actions: Vec<ChannelAction>,
        core: &mut SyncCore,
    ) -> Effects {
        let mut effects = Effects::default();
        let mut queue: VecDeque<ChannelAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                ChannelAction::Connect { attempt, .. } => {
                    self.connects.push(now);
                    self.transports.insert(attempt, TransportState::Pending);

                    match self.behavior {
                        StreamBehavior::Accept => {
                            self.transports.insert(attempt, TransportState::Open);
                            queue.extend(self.channel.handle_opened(attempt, now));
                        },
                        StreamBehavior::Reject => {
                            self.transports.remove(&attempt);
                            queue.extend(self.channel.handle_error(attempt, now));
                        },
                        StreamBehavior::Silent => {},
                    }
                },
                ChannelAction::CloseTransport { attempt } => {
                    self.transports.remove(&attempt);
                },
                ChannelAction::StatusChanged(status) => {
                    self.statuses.push((now, status));
                },
                ChannelAction::Deliver { raw } => {
                    self.delivered += 1;
                    let (routed, outcome) = core.ingest(&self.router, &raw);
                    tracing::trace!(channel = %self.channel.key(), ?routed, "delivered");

                    match (outcome, routed.plan()) {
                        (ApplyOutcome::Invalidated(keys), _) => effects.invalidated.extend(keys),
                        (
                            ApplyOutcome::Merged(MergeOutcome::Applied { .. }),
                            ReconcilePlan::Merge { key, .. },
                        ) => effects.merged.push(key.clone()),
                        (ApplyOutcome::Merged(_), _) => {},
                    }
                },
            }
        }

        effects
    }
}

impl Effects {
    fn extend(&mut self, other: Effects) {
        self.invalidated.extend(other.invalidated);
        self.merged.extend(other.merged);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nereo_core::{ChannelState, Scope};
    use nereo_proto::Topic;

    use super::*;

    fn analytics() -> SimChannel {
        SimChannel::new(
            Subscription::new(Topic::Analytics, Scope::tenant("t1")),
            ChannelConfig::default(),
        )
    }

    #[test]
    fn accepting_server_connects_immediately() {
        let mut ch = analytics();
        let mut core = SyncCore::new();
        ch.open(SimInstant::EPOCH, &mut core);

        assert_eq!(ch.status().state, ChannelState::Connected);
        assert_eq!(ch.connects().len(), 1);
        assert_eq!(ch.transports().len(), 1);
    }

    #[test]
    fn rejecting_server_leaves_no_transport() {
        let mut ch = analytics();
        ch.set_behavior(StreamBehavior::Reject);
        let mut core = SyncCore::new();
        ch.open(SimInstant::EPOCH, &mut core);

        assert_eq!(ch.status().state, ChannelState::Reconnecting);
        assert_eq!(ch.status().retry_count, 1);
        assert!(ch.transports().is_empty());
    }

    #[test]
    fn silent_request_can_be_accepted_later() {
        let mut ch = analytics();
        ch.set_behavior(StreamBehavior::Silent);
        let mut core = SyncCore::new();
        ch.open(SimInstant::EPOCH, &mut core);
        assert_eq!(ch.status().state, ChannelState::Connecting);

        ch.accept_pending(SimInstant::EPOCH + Duration::from_secs(1), &mut core);
        assert_eq!(ch.status().state, ChannelState::Connected);
    }

    #[test]
    fn pushes_reach_the_cache() {
        let mut ch = analytics();
        let mut core = SyncCore::new();
        let key = nereo_core::keys::kpis("t1");
        core.store(key.clone(), serde_json::json!({"revenue": 1}));
        ch.open(SimInstant::EPOCH, &mut core);

        let effects = ch.push(
            SimInstant::EPOCH,
            r#"{"type":"kpi_updated","payload":{"revenue":2}}"#,
            &mut core,
        );
        assert_eq!(effects.merged, vec![key.clone()]);
        assert_eq!(core.cache().get(&key), Some(&serde_json::json!({"revenue": 2})));
        assert_eq!(ch.delivered(), 1);
    }
}
