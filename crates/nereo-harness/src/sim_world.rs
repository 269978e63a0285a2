//! Simulated world.
//!
//! One tenant's view of the system under a virtual clock: push channels
//! against a scripted server, the shared [`SyncCore`], refetches that can be
//! held in flight and writes that settle only when told to. Everything is
//! synchronous; time moves only in [`SimWorld::advance`], which fires channel
//! timers in deadline order.
//!
//! Channel configurations must use non-zero delays, otherwise a rejecting
//! server keeps a channel reconnecting at a single instant forever.

use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

use nereo_core::{
    CacheKey, ChannelConfig, Environment, FailureNotice, FetchOutcome, FetchTicket, MutationId,
    MutationState, Outcome, Scope, Settlement, SpeculativeUpdate, Subscription, SyncCore,
};
use nereo_proto::Topic;
use serde_json::Value;

use crate::{
    invariants::{
        ChannelSnapshot, EntrySnapshot, InvariantRegistry, RollbackRecord, SystemSnapshot,
        Violation,
    },
    model::{Operation, SimMutation, observe},
    sim_channel::{Effects, SimChannel, StreamBehavior},
    sim_env::{SimEnv, SimInstant},
    sim_server::SimServer,
};

/// Tenant of [`SimWorld::new`].
pub const SIM_TENANT: &str = "tenant-1";

/// Branch of [`SimWorld::new`].
pub const SIM_BRANCH: &str = "branch-1";

/// Message the simulated server rejects writes with.
pub const REJECTION_MESSAGE: &str = "rejected by server";

/// A write waiting for the server.
#[derive(Debug)]
struct InFlightWrite {
    id: MutationId,
    update: SpeculativeUpdate,
    fails: bool,
    before: Vec<(CacheKey, Option<Value>)>,
    disturbed: bool,
}

/// Deterministic simulation of channels, cache and writes.
pub struct SimWorld {
    env: SimEnv,
    scope: Scope,
    config: ChannelConfig,
    core: SyncCore,
    server: SimServer,
    channels: Vec<SimChannel>,
    queries: BTreeSet<CacheKey>,
    fetches: VecDeque<FetchTicket>,
    writes: VecDeque<InFlightWrite>,
    mutations: Vec<MutationId>,
    loaded: BTreeSet<CacheKey>,
    notices: Vec<FailureNotice>,
    rollbacks: Vec<RollbackRecord>,
    invariants: InvariantRegistry,
}

impl SimWorld {
    /// Empty world with default channel timings.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, ChannelConfig::default())
    }

    /// Empty world: seeded server, empty cache, no channels.
    pub fn with_config(seed: u64, config: ChannelConfig) -> Self {
        let scope = Scope::tenant(SIM_TENANT).with_branch(SIM_BRANCH);
        Self {
            env: SimEnv::with_seed(seed),
            server: SimServer::seeded(&scope),
            scope,
            config,
            core: SyncCore::new(),
            channels: Vec::new(),
            queries: BTreeSet::new(),
            fetches: VecDeque::new(),
            writes: VecDeque::new(),
            mutations: Vec::new(),
            loaded: BTreeSet::new(),
            notices: Vec::new(),
            rollbacks: Vec::new(),
            invariants: InvariantRegistry::standard(),
        }
    }

    /// World with every seeded query loaded and both topics subscribed.
    pub fn standard(seed: u64) -> Self {
        let mut world = Self::new(seed);
        world.load_all();
        for topic in Topic::ALL {
            world.subscribe(topic);
        }
        world
    }

    /// Replace the invariants [`SimWorld::check_invariants`] runs.
    #[must_use]
    pub fn with_invariants(mut self, invariants: InvariantRegistry) -> Self {
        self.invariants = invariants;
        self
    }

    /// Environment (clock and RNG).
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Current virtual time.
    pub fn now(&self) -> SimInstant {
        self.env.now()
    }

    /// View scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Shared cache state.
    pub fn core(&self) -> &SyncCore {
        &self.core
    }

    /// Current value under `key`.
    pub fn cached(&self, key: &CacheKey) -> Option<&Value> {
        self.core.cache().get(key)
    }

    /// The simulated backend.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// The simulated backend, for changing data behind the client's back.
    pub fn server_mut(&mut self) -> &mut SimServer {
        &mut self.server
    }

    /// Notices shown so far.
    pub fn notices(&self) -> &[FailureNotice] {
        &self.notices
    }

    /// Every channel ever opened, closed ones included.
    pub fn channels(&self) -> &[SimChannel] {
        &self.channels
    }

    /// Open channel for topic key `key`.
    pub fn channel(&self, key: &str) -> Option<&SimChannel> {
        self.channels.iter().find(|c| c.key() == key && !c.channel().is_closed())
    }

    /// Open a channel for `topic`, closing any open one with the same key.
    pub fn subscribe(&mut self, topic: Topic) -> String {
        self.subscribe_with(topic, StreamBehavior::Accept)
    }

    /// Open a channel for `topic` against a server answering with
    /// `behavior`.
    pub fn subscribe_with(&mut self, topic: Topic, behavior: StreamBehavior) -> String {
        let subscription = Subscription::new(topic, self.scope.clone());
        let key = subscription.key();
        self.unsubscribe(&key);

        let now = self.now();
        let mut channel = SimChannel::new(subscription, self.config.clone());
        channel.set_behavior(behavior);
        let effects = channel.open(now, &mut self.core);
        self.channels.push(channel);
        self.absorb(&effects);

        tracing::debug!(channel = %key, "subscribed");
        key
    }

    /// Close the open channel for `key`. False if there is none.
    pub fn unsubscribe(&mut self, key: &str) -> bool {
        self.with_channel(key, |channel, now, core| channel.close(now, core))
    }

    /// Change how the server answers `key`'s stream requests.
    pub fn set_behavior(&mut self, key: &str, behavior: StreamBehavior) -> bool {
        self.with_channel(key, |channel, _, _| {
            channel.set_behavior(behavior);
            Effects::default()
        })
    }

    /// Answer `key`'s pending stream request.
    pub fn accept_pending(&mut self, key: &str) -> bool {
        self.with_channel(key, |channel, now, core| channel.accept_pending(now, core))
    }

    /// Server ends `key`'s streams.
    pub fn drop_stream(&mut self, key: &str) -> bool {
        self.with_channel(key, |channel, now, core| channel.drop_streams(now, core))
    }

    /// Server pushes `raw` on `key`'s stream.
    pub fn push(&mut self, key: &str, raw: &str) -> bool {
        self.with_channel(key, |channel, now, core| channel.push(now, raw, core))
    }

    /// Advance virtual time by `duration`, firing every timer that falls due
    /// in deadline order.
    pub fn advance(&mut self, duration: Duration) {
        let target = self.now() + duration;

        loop {
            let next = self
                .channels
                .iter()
                .enumerate()
                .filter_map(|(index, c)| c.channel().next_deadline().map(|at| (at, index)))
                .min();

            let Some((deadline, index)) = next.filter(|(at, _)| *at <= target) else {
                break;
            };

            self.env.advance_to(deadline);
            let now = self.now();
            let effects = match self.channels.get_mut(index) {
                Some(channel) => channel.tick(now, &mut self.core),
                None => break,
            };
            self.absorb(&effects);
        }

        self.env.advance_to(target);
    }

    /// Remember that `key` can be refetched from the server.
    pub fn register_query(&mut self, key: CacheKey) {
        self.queries.insert(key);
    }

    /// Registered queries.
    pub fn queries(&self) -> impl Iterator<Item = &CacheKey> {
        self.queries.iter()
    }

    /// Load every key the server holds.
    pub fn load_all(&mut self) {
        let keys: Vec<CacheKey> = self.server.keys().cloned().collect();
        for key in keys {
            self.fetch(key);
        }
    }

    /// Fetch and land `key` in one step.
    pub fn fetch(&mut self, key: CacheKey) -> FetchOutcome {
        self.register_query(key.clone());
        let ticket = self.core.begin_fetch(&key);
        self.land(ticket)
    }

    /// Start a fetch of `key`, landing it on a later
    /// [`SimWorld::complete_fetch`].
    pub fn start_fetch(&mut self, key: CacheKey) {
        self.register_query(key.clone());
        self.fetches.push_back(self.core.begin_fetch(&key));
    }

    /// Land the oldest fetch in flight with what the server holds now.
    pub fn complete_fetch(&mut self) -> Option<FetchOutcome> {
        let ticket = self.fetches.pop_front()?;
        Some(self.land(ticket))
    }

    /// Refetch every stale registered query. Returns the refreshed keys.
    pub fn refetch_stale(&mut self) -> Vec<CacheKey> {
        let stale: Vec<CacheKey> = self
            .core
            .stale_keys()
            .into_iter()
            .filter(|key| self.queries.contains(key))
            .collect();

        stale.into_iter().filter(|key| self.fetch(key.clone()) == FetchOutcome::Stored).collect()
    }

    /// Begin a write. The server answers on [`SimWorld::settle_next`], with
    /// a rejection if `fails`.
    pub fn mutate(&mut self, update: SpeculativeUpdate, fails: bool) -> MutationId {
        let affected = update.affected();
        let before = affected.iter().map(|key| (key.clone(), self.cached(key).cloned())).collect();
        for key in &affected {
            self.disturb(key);
        }

        let id = self.core.begin_update(&update);
        for key in affected {
            if self.core.cache().contains(&key) {
                self.loaded.insert(key);
            }
        }

        tracing::debug!(mutation = %id, target = update.target(), fails, "write begun");
        self.mutations.push(id);
        self.writes.push_back(InFlightWrite { id, update, fails, before, disturbed: false });
        id
    }

    /// Begin one of the simulated writes, drawing a placeholder id from the
    /// seeded RNG.
    pub fn mutate_sim(&mut self, mutation: &SimMutation, fails: bool) -> MutationId {
        let temp_id = format!("temp-{:x}", self.env.random_u64());
        let update = mutation.to_update(&self.scope, temp_id);
        self.mutate(update, fails)
    }

    /// Answer the oldest write in flight.
    pub fn settle_next(&mut self) -> Option<Settlement> {
        let write = self.writes.pop_front()?;
        let outcome = if write.fails {
            Outcome::Rollback { message: Some(REJECTION_MESSAGE.to_owned()) }
        } else {
            Outcome::Commit
        };

        let settlement = self.core.settle(write.id, outcome);
        match &settlement {
            Settlement::Committed { .. } => self.server.accept(&write.update),
            Settlement::RolledBack { notice, .. } => {
                self.notices.push(notice.clone());

                for (key, before) in &write.before {
                    if !write.disturbed {
                        self.rollbacks.push(RollbackRecord {
                            mutation: write.id.get(),
                            key: key.to_string(),
                            before: before.clone(),
                            restored: self.cached(key).cloned(),
                        });
                    }
                    self.disturb(key);
                }
            },
            Settlement::AlreadySettled => {},
        }
        Some(settlement)
    }

    /// Writes still in flight.
    pub fn writes_in_flight(&self) -> usize {
        self.writes.len()
    }

    /// Apply one generated operation. Operations that select a channel or
    /// query that does not exist do nothing.
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::AdvanceTime { millis } => {
                self.advance(Duration::from_millis(u64::from(*millis)));
            },
            Operation::SetBehavior { channel, behavior } => {
                if let Some(key) = self.channel_key(*channel) {
                    self.set_behavior(&key, *behavior);
                }
            },
            Operation::AcceptPending { channel } => {
                if let Some(key) = self.channel_key(*channel) {
                    self.accept_pending(&key);
                }
            },
            Operation::DropStream { channel } => {
                if let Some(key) = self.channel_key(*channel) {
                    self.drop_stream(&key);
                }
            },
            Operation::Push { channel, event } => {
                if let Some(key) = self.channel_key(*channel) {
                    self.push(&key, &event.to_payload());
                }
            },
            Operation::Resubscribe { channel } => {
                let previous = self
                    .channel_key(*channel)
                    .and_then(|key| self.channel(&key))
                    .map(|c| (c.subscription().topic, c.behavior()));
                if let Some((topic, behavior)) = previous {
                    self.subscribe_with(topic, behavior);
                }
            },
            Operation::StartFetch { query } => {
                let key = self.queries.iter().nth(nth(*query, self.queries.len())).cloned();
                if let Some(key) = key {
                    self.start_fetch(key);
                }
            },
            Operation::CompleteFetch => {
                self.complete_fetch();
            },
            Operation::Mutate { mutation, fails } => {
                self.mutate_sim(mutation, *fails);
            },
            Operation::SettleNext => {
                self.settle_next();
            },
            Operation::RefetchStale => {
                self.refetch_stale();
            },
        }
    }

    /// Observable state for invariants and snapshot tests.
    pub fn snapshot(&self) -> SystemSnapshot {
        let mutations = self.core.mutations();
        let rolled_back = self
            .mutations
            .iter()
            .filter(|id| mutations.state(**id) == Some(MutationState::RolledBack))
            .count();

        SystemSnapshot {
            now_ms: self.now().as_millis(),
            channels: self.channels.iter().map(channel_snapshot).collect(),
            cache: observe(&self.core)
                .into_iter()
                .map(|(key, (value, stale))| (key.to_string(), EntrySnapshot { value, stale }))
                .collect(),
            loaded: self.loaded.iter().map(ToString::to_string).collect(),
            pending_writes: mutations.pending().len(),
            rolled_back,
            notices: self.notices.len(),
            rollbacks: self.rollbacks.clone(),
        }
    }

    /// Run the registered invariants against the current state.
    pub fn check_invariants(&self) -> Result<(), Vec<Violation>> {
        self.invariants.check_all(&self.snapshot())
    }

    fn with_channel<F>(&mut self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut SimChannel, SimInstant, &mut SyncCore) -> Effects,
    {
        let now = self.now();
        let Some(channel) =
            self.channels.iter_mut().find(|c| c.key() == key && !c.channel().is_closed())
        else {
            return false;
        };

        let effects = f(channel, now, &mut self.core);
        self.absorb(&effects);
        true
    }

    fn channel_key(&self, index: u8) -> Option<String> {
        let open: Vec<&SimChannel> =
            self.channels.iter().filter(|c| !c.channel().is_closed()).collect();
        open.get(nth(index, open.len())).map(|c| c.key().to_owned())
    }

    fn land(&mut self, ticket: FetchTicket) -> FetchOutcome {
        let key = ticket.key().clone();
        let value = self.server.get(&key).cloned().unwrap_or(Value::Null);

        let outcome = self.core.complete_fetch(ticket, value);
        if outcome != FetchOutcome::Superseded {
            self.loaded.insert(key.clone());
            self.disturb(&key);
        }
        outcome
    }

    fn absorb(&mut self, effects: &Effects) {
        for key in &effects.merged {
            self.disturb(key);
        }
    }

    /// Something other than a write's own begin or settle changed `key`.
    fn disturb(&mut self, key: &CacheKey) {
        for write in &mut self.writes {
            if write.before.iter().any(|(k, _)| k == key) {
                write.disturbed = true;
            }
        }
    }
}

fn nth(index: u8, len: usize) -> usize {
    if len == 0 { 0 } else { usize::from(index) % len }
}

fn channel_snapshot(channel: &SimChannel) -> ChannelSnapshot {
    let status = channel.status();
    let config = channel.config();

    ChannelSnapshot {
        key: channel.key().to_owned(),
        state: status.state.as_str().to_owned(),
        retry_count: status.retry_count,
        fallback_polling: status.fallback_polling,
        polling_interval_ms: status.polling_interval.as_millis() as u64,
        fallback_interval_ms: config.fallback_poll_interval.as_millis() as u64,
        connect_timeout_ms: config.connect_timeout.as_millis() as u64,
        max_retry_delay_ms: config.max_retry_delay.as_millis() as u64,
        live_transports: channel.transports().len(),
        next_deadline_ms: channel.channel().next_deadline().map(SimInstant::as_millis),
        closed: channel.channel().is_closed(),
        connects: channel.connects().len(),
    }
}
