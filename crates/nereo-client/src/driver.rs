//! Channel driver task.
//!
//! One task per subscription bridges the [`Channel`] state machine to the real
//! world: it waits for transport events, close requests and the channel's
//! next deadline, feeds them to the state machine and executes the returned
//! actions.
//!
//! # Action execution
//!
//! - `Connect`: spawn the connector for the new attempt, aborting any previous
//!   transport first
//! - `CloseTransport`: abort the transport of that attempt
//! - `StatusChanged`: publish on the status watch
//! - `Deliver`: route the payload and apply it under the core lock
//!
//! The core lock is only held for the synchronous `ingest` call, never across
//! network I/O.

use std::{sync::Arc, time::Duration};

use nereo_core::{
    ApplyOutcome, CacheKey, Channel, ChannelAction, ChannelConfig, ChannelStatus, Environment,
    EventRouter, Routed, Subscription, SyncCore,
};
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot, watch},
    task::AbortHandle,
};

use crate::{ChannelInput, Connector, TransportEvent, TransportSink};

/// Capacity of a channel's input queue.
const INPUT_CAPACITY: usize = 64;

/// Handle to a running channel task.
///
/// Cheap to clone. Dropping handles does not stop the task; call
/// [`ChannelHandle::close`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    subscription: Subscription,
    inputs: mpsc::Sender<ChannelInput>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelHandle {
    /// Topic key, e.g. `bookings/tenant-1`.
    pub fn key(&self) -> String {
        self.subscription.key()
    }

    /// Subscription the channel serves.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Latest published status.
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// True once the task has stopped.
    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }

    /// Close the channel and wait until its transport is released.
    ///
    /// Safe to call more than once and from several handles.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.inputs.send(ChannelInput::Close { done }).await.is_ok() {
            let _ = wait.await;
        }
    }
}

/// What woke the driver up.
enum Wake {
    Input(Option<ChannelInput>),
    Deadline,
}

/// Driver of one push channel.
pub struct ChannelDriver<E: Environment, C: Connector> {
    env: E,
    connector: Arc<C>,
    channel: Channel<E::Instant>,
    router: EventRouter,
    core: Arc<Mutex<SyncCore>>,
    status: watch::Sender<ChannelStatus>,
    invalidations: broadcast::Sender<Vec<CacheKey>>,
    inputs_tx: mpsc::Sender<ChannelInput>,
    inputs: mpsc::Receiver<ChannelInput>,
    transport: Option<(u64, AbortHandle)>,
}

impl<E: Environment, C: Connector> ChannelDriver<E, C> {
    /// Driver for `subscription`, plus the handle to control it.
    ///
    /// Nothing happens until [`ChannelDriver::run`] is polled.
    pub fn new(
        env: E,
        connector: Arc<C>,
        subscription: Subscription,
        config: ChannelConfig,
        core: Arc<Mutex<SyncCore>>,
        invalidations: broadcast::Sender<Vec<CacheKey>>,
    ) -> (Self, ChannelHandle) {
        let channel = Channel::new(&subscription, config);
        let (status_tx, status_rx) = watch::channel(channel.status());
        let (inputs_tx, inputs) = mpsc::channel(INPUT_CAPACITY);

        let handle = ChannelHandle {
            subscription: subscription.clone(),
            inputs: inputs_tx.clone(),
            status: status_rx,
        };

        let driver = Self {
            env,
            connector,
            channel,
            router: EventRouter::new(subscription),
            core,
            status: status_tx,
            invalidations,
            inputs_tx,
            inputs,
            transport: None,
        };

        (driver, handle)
    }

    /// Run until closed.
    pub async fn run(mut self) {
        match self.channel.open(self.env.now()) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => {
                tracing::warn!(channel = %self.channel.key(), "failed to open channel: {}", e);
                return;
            },
        }

        loop {
            let wake = match self.channel.next_deadline() {
                Some(deadline) => {
                    let now = self.env.now();
                    let wait = if deadline > now { deadline - now } else { Duration::ZERO };
                    tokio::select! {
                        input = self.inputs.recv() => Wake::Input(input),
                        () = self.env.sleep(wait) => Wake::Deadline,
                    }
                },
                None => Wake::Input(self.inputs.recv().await),
            };

            match wake {
                Wake::Deadline => {
                    let actions = self.channel.tick(self.env.now());
                    self.execute(actions).await;
                },
                Wake::Input(Some(ChannelInput::Transport { attempt, event })) => {
                    let actions = self.handle_transport(attempt, event);
                    self.execute(actions).await;
                },
                Wake::Input(Some(ChannelInput::Close { done })) => {
                    let actions = self.channel.close();
                    self.execute(actions).await;
                    self.abort_transport();
                    let _ = done.send(());
                    break;
                },
                Wake::Input(None) => {
                    let actions = self.channel.close();
                    self.execute(actions).await;
                    break;
                },
            }
        }

        self.abort_transport();
    }

    fn handle_transport(&mut self, attempt: u64, event: TransportEvent) -> Vec<ChannelAction> {
        let now = self.env.now();
        match event {
            TransportEvent::Opened => self.channel.handle_opened(attempt, now),
            TransportEvent::Message(raw) => self.channel.handle_message(attempt, raw),
            TransportEvent::Failed(e) => {
                let key = self.channel.key();
                if attempt != self.channel.attempt() {
                    tracing::debug!(channel = %key, attempt, "stale transport failed: {}", e);
                } else if e.is_transient() {
                    tracing::debug!(channel = %key, attempt, "transport failed: {}", e);
                } else {
                    tracing::warn!(channel = %key, attempt, "transport failed: {}", e);
                }
                self.channel.handle_error(attempt, now)
            },
        }
    }

    async fn execute(&mut self, actions: Vec<ChannelAction>) {
        for action in actions {
            match action {
                ChannelAction::Connect { attempt, path } => {
                    self.abort_transport();
                    let sink = TransportSink::new(attempt, self.inputs_tx.clone());
                    let task = tokio::spawn(self.connector.connect(path, sink));
                    self.transport = Some((attempt, task.abort_handle()));
                },
                ChannelAction::CloseTransport { attempt } => {
                    if matches!(self.transport, Some((current, _)) if current == attempt) {
                        self.abort_transport();
                    }
                },
                ChannelAction::StatusChanged(status) => {
                    tracing::info!(
                        channel = %self.channel.key(),
                        state = %status.state,
                        retry = status.retry_count,
                        fallback = status.fallback_polling,
                        "channel status changed"
                    );
                    self.status.send_replace(status);
                },
                ChannelAction::Deliver { raw } => self.deliver(&raw).await,
            }
        }
    }

    async fn deliver(&self, raw: &str) {
        let (routed, outcome) = {
            let mut core = self.core.lock().await;
            core.ingest(&self.router, raw)
        };

        let key = self.channel.key();
        match &routed {
            Routed::Classified { event, .. } => {
                tracing::debug!(channel = %key, kind = %event.kind(), "event applied");
            },
            Routed::Unrecognized { event_type, .. } => {
                tracing::warn!(
                    channel = %key,
                    %event_type,
                    "unrecognized event, invalidating topic"
                );
            },
            Routed::Undecodable { error, .. } => {
                tracing::warn!(channel = %key, "undecodable event, invalidating topic: {}", error);
            },
        }

        if let ApplyOutcome::Invalidated(keys) = outcome
            && !keys.is_empty()
        {
            let _ = self.invalidations.send(keys);
        }
    }

    fn abort_transport(&mut self) {
        if let Some((_, handle)) = self.transport.take() {
            handle.abort();
        }
    }
}

impl<E: Environment, C: Connector> Drop for ChannelDriver<E, C> {
    fn drop(&mut self) {
        self.abort_transport();
    }
}
