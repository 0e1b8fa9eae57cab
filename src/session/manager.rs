//! Connection manager and reconnection supervisor
//!
//! Owns the MQTT client, the polled event loop, and the session state
//! machine. The event loop runs on a spawned supervisor task; state is
//! published over a watch channel so any number of callers can observe
//! transitions. All operations take `&self`, so one manager can be shared
//! behind an `Arc` by publishers and subscribers concurrently.
//!
//! Reconnection policy: transport loss while connected emits exactly one
//! `ConnectionLost` event, then the supervisor retries with exponential
//! backoff until it succeeds, the retry budget runs out, or shutdown is
//! requested. Individual retry failures are logged, not surfaced.

use crate::config::BrokerSection;
use crate::credentials::SecurityConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::connection::{
    can_operate, configure_mqtt_options, qos_from_level, should_attempt_reconnect,
    ConnectionState, ReconnectConfig, ReconnectDecision,
};
use crate::session::events::{
    route_event, EventRoute, LifecycleEvent, LifecycleHandler, LifecycleRegistry, MessageHandler,
    SubscriptionTable,
};
use crate::session::token::{AckRegistry, DeliveryToken};
use crate::topic::{validate_topic_name, validate_topic_filter};
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Registries shared between the manager and the supervisor task
///
/// Guarded by std mutexes: every critical section is short and never
/// awaits.
#[derive(Default)]
struct SharedRegistries {
    acks: StdMutex<AckRegistry>,
    lifecycle: StdMutex<LifecycleRegistry>,
    subscriptions: StdMutex<SubscriptionTable>,
}

/// MQTT connection manager
pub struct ConnectionManager {
    broker: BrokerSection,
    security: SecurityConfig,
    reconnect_config: ReconnectConfig,
    connect_timeout: Duration,
    disconnect_grace: Duration,

    registries: Arc<SharedRegistries>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    client: Mutex<Option<AsyncClient>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    // Serializes publish/subscribe requests so outgoing packet ids bind to
    // tokens in issue order
    request_gate: Mutex<()>,
    // Serializes connect/disconnect so the state check, supervisor spawn,
    // and shutdown-flag handling happen atomically
    lifecycle_gate: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager for the given broker endpoint and credentials
    ///
    /// No I/O happens until [`connect`](Self::connect) is called.
    pub fn new(
        broker: BrokerSection,
        security: SecurityConfig,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let connect_timeout = Duration::from_secs(broker.connect_timeout_secs);
        let disconnect_grace = Duration::from_millis(broker.disconnect_grace_ms);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            broker,
            security,
            reconnect_config,
            connect_timeout,
            disconnect_grace,
            registries: Arc::new(SharedRegistries::default()),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            shutdown_rx,
            client: Mutex::new(None),
            supervisor: Mutex::new(None),
            request_gate: Mutex::new(()),
            lifecycle_gate: Mutex::new(()),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel for observing state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a lifecycle handler
    ///
    /// Handlers registered before [`connect`](Self::connect) observe the
    /// initial `Connected` event. Handlers run inline on the supervisor
    /// task and must not block.
    pub fn on_lifecycle_event(&self, handler: LifecycleHandler) {
        self.registries.lifecycle.lock().unwrap().register(handler);
    }

    /// Connect to the broker, blocking until the session is confirmed
    ///
    /// Bounded by the configured connect timeout; on timeout the session
    /// transitions to `Failed` and `ConnectTimeout` is returned. Only a
    /// fresh, failed, or disconnected session may connect.
    pub async fn connect(&self) -> SessionResult<()> {
        let _gate = self.lifecycle_gate.lock().await;

        let state = self.state();
        match state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
            other => {
                return Err(SessionError::NotConnected { state: other });
            }
        }

        info!(
            host = %self.broker.host,
            port = self.broker.port,
            client_id = %self.broker.client_id,
            "Connecting to MQTT broker over TLS"
        );
        // A previous failed attempt may have left a supervisor behind.
        // Reap it before the shutdown flag is cleared; a watch channel
        // coalesces rapid sends, so an undrained `true` followed by `false`
        // could otherwise leave the old supervisor running.
        self.stop_supervisor().await;
        let _ = self.shutdown_tx.send(false);
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let options = configure_mqtt_options(&self.broker, &self.security);
        let (client, event_loop) = AsyncClient::new(options, 10);
        *self.client.lock().await = Some(client.clone());

        let handle = tokio::spawn(Self::supervise(
            event_loop,
            client,
            self.registries.clone(),
            self.state_tx.clone(),
            self.shutdown_rx.clone(),
            self.reconnect_config.clone(),
        ));
        *self.supervisor.lock().await = Some(handle);

        self.wait_for_confirmation().await
    }

    /// Wait until the supervisor reports Connected or a terminal state
    async fn wait_for_confirmation(&self) -> SessionResult<()> {
        let mut state_rx = self.state_rx.clone();
        let confirmation = tokio::time::timeout(self.connect_timeout, async move {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed(reason) => {
                        return Err(SessionError::TransportLost(reason));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::TransportLost(
                        "connection supervisor terminated".to_string(),
                    ));
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?self.connect_timeout, "No connection confirmation received");
                self.stop_supervisor().await;
                let _ = self
                    .state_tx
                    .send(ConnectionState::Failed("connect timeout".to_string()));
                Err(SessionError::ConnectTimeout {
                    timeout: self.connect_timeout,
                })
            }
        }
    }

    /// Publish one message, returning a token for its acknowledgement
    ///
    /// The topic must be an exact name (no wildcards). Fails with
    /// `NotConnected` unless the session is in the `Connected` state.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
    ) -> SessionResult<DeliveryToken> {
        validate_topic_name(topic)?;
        self.ensure_connected()?;

        let client = self.current_client().await?;
        let _gate = self.request_gate.lock().await;
        let token = self.registries.acks.lock().unwrap().register_publish(qos);

        let result = client
            .publish(topic.to_string(), qos_from_level(qos), retain, payload.into())
            .await;

        if let Err(e) = result {
            self.registries.acks.lock().unwrap().abandon_newest_publish();
            return Err(SessionError::PublishFailed(Box::new(e)));
        }

        debug!(topic, qos, retain, "Publish queued");
        Ok(token)
    }

    /// Subscribe to a topic filter, routing matching messages to `handler`
    ///
    /// The token resolves when the broker confirms the subscription.
    /// Subscribing again to the same filter replaces the handler. Active
    /// subscriptions are replayed automatically after a reconnect.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: u8,
        handler: MessageHandler,
    ) -> SessionResult<DeliveryToken> {
        validate_topic_filter(filter)?;
        self.ensure_connected()?;

        let client = self.current_client().await?;
        let _gate = self.request_gate.lock().await;
        let token = self.registries.acks.lock().unwrap().register_subscribe();

        let result = client.subscribe(filter.to_string(), qos_from_level(qos)).await;

        if let Err(e) = result {
            self.registries
                .acks
                .lock()
                .unwrap()
                .abandon_newest_subscribe();
            return Err(SessionError::SubscribeFailed(Box::new(e)));
        }

        self.registries
            .subscriptions
            .lock()
            .unwrap()
            .insert(filter.to_string(), qos, handler);

        info!(filter, qos, "Subscription requested");
        Ok(token)
    }

    /// Remove a subscription; returns whether the filter was active
    ///
    /// Idempotent: unsubscribing a filter that was never subscribed (or
    /// already removed) returns `Ok(false)` without touching the broker.
    pub async fn unsubscribe(&self, filter: &str) -> SessionResult<bool> {
        let removed = self
            .registries
            .subscriptions
            .lock()
            .unwrap()
            .remove(filter);
        if !removed {
            return Ok(false);
        }

        if can_operate(&self.state()) {
            let client = self.current_client().await?;
            client
                .unsubscribe(filter.to_string())
                .await
                .map_err(|e| SessionError::SubscribeFailed(Box::new(e)))?;
        }

        info!(filter, "Unsubscribed");
        Ok(true)
    }

    /// Gracefully close the session
    ///
    /// Waits the configured grace period for in-flight acknowledgements,
    /// sends the DISCONNECT packet best-effort, and stops the supervisor.
    /// The session always ends in `ClosedByUser`, even when the transport
    /// was already gone.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let _gate = self.lifecycle_gate.lock().await;
        info!(grace = ?self.disconnect_grace, "Disconnecting from MQTT broker");

        let outstanding = self.registries.acks.lock().unwrap().outstanding();
        if outstanding > 0 && can_operate(&self.state()) {
            debug!(outstanding, "Waiting for in-flight acknowledgements");
            tokio::time::sleep(self.disconnect_grace).await;
        }

        if let Some(client) = self.client.lock().await.as_ref() {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "DISCONNECT packet not sent");
            }
        }

        self.stop_supervisor().await;

        self.registries
            .acks
            .lock()
            .unwrap()
            .fail_all("session closed");
        let _ = self.state_tx.send(ConnectionState::ClosedByUser);
        self.registries
            .lifecycle
            .lock()
            .unwrap()
            .dispatch(&LifecycleEvent::Disconnected);

        info!("Session closed");
        Ok(())
    }

    fn ensure_connected(&self) -> SessionResult<()> {
        let state = self.state();
        if can_operate(&state) {
            Ok(())
        } else {
            Err(SessionError::NotConnected { state })
        }
    }

    /// Signal shutdown and join the supervisor task, if one is running
    async fn stop_supervisor(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn current_client(&self) -> SessionResult<AsyncClient> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected {
                state: ConnectionState::Disconnected,
            })
    }

    /// Supervisor task: polls the event loop, routes events, and drives
    /// reconnection with exponential backoff
    async fn supervise(
        mut event_loop: EventLoop,
        client: AsyncClient,
        registries: Arc<SharedRegistries>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        mut shutdown_rx: watch::Receiver<bool>,
        reconnect_config: ReconnectConfig,
    ) {
        // Whether the session is currently up; gates the single
        // ConnectionLost per loss
        let mut connected = false;
        // Whether this session has ever been up; distinguishes Connected
        // from Reconnected
        let mut ever_connected = false;
        // Reconnect attempts completed since the last loss
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Supervisor received shutdown signal");
                        break;
                    }
                }
                result = event_loop.poll() => match result {
                    Ok(event) => match route_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            if !connected {
                                connected = true;
                                attempts = 0;
                                let _ = state_tx.send(ConnectionState::Connected);

                                if ever_connected {
                                    info!("Reconnected to MQTT broker");
                                    let replay = registries
                                        .subscriptions
                                        .lock()
                                        .unwrap()
                                        .replay_set();
                                    for (filter, qos) in replay {
                                        if let Err(e) =
                                            client.subscribe(filter.clone(), qos).await
                                        {
                                            warn!(filter, error = %e, "Subscription replay failed");
                                        } else {
                                            debug!(filter, "Subscription replayed");
                                        }
                                    }
                                    registries
                                        .lifecycle
                                        .lock()
                                        .unwrap()
                                        .dispatch(&LifecycleEvent::Reconnected);
                                } else {
                                    ever_connected = true;
                                    info!("Connected to MQTT broker");
                                    registries
                                        .lifecycle
                                        .lock()
                                        .unwrap()
                                        .dispatch(&LifecycleEvent::Connected);
                                }
                            }
                        }
                        EventRoute::MessageReceived(message) => {
                            debug!(topic = %message.topic, bytes = message.payload.len(), "Message received");
                            registries.subscriptions.lock().unwrap().dispatch(&message);
                        }
                        EventRoute::PublishIssued(pkid) => {
                            registries.acks.lock().unwrap().publish_issued(pkid);
                        }
                        EventRoute::SubscribeIssued(pkid) => {
                            registries.acks.lock().unwrap().subscribe_issued(pkid);
                        }
                        EventRoute::PublishAcknowledged(pkid)
                        | EventRoute::SubscribeAcknowledged(pkid) => {
                            registries.acks.lock().unwrap().acknowledged(pkid);
                        }
                        EventRoute::BrokerDisconnect(reason) => {
                            // The next poll surfaces the loss as an error
                            warn!(reason, "Broker initiated disconnect");
                        }
                        EventRoute::InfrastructureEvent => {}
                    },
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        let reason = e.to_string();
                        registries.acks.lock().unwrap().fail_all(&reason);

                        if connected {
                            connected = false;
                            warn!(reason, "Connection lost");
                            registries
                                .lifecycle
                                .lock()
                                .unwrap()
                                .dispatch(&LifecycleEvent::ConnectionLost {
                                    reason: reason.clone(),
                                });
                        }

                        let shutdown_requested = *shutdown_rx.borrow();
                        match should_attempt_reconnect(attempts, &reconnect_config, shutdown_requested)
                        {
                            ReconnectDecision::Proceed { attempt, delay } => {
                                attempts = attempt;
                                debug!(attempt, delay = ?delay, "Scheduling reconnection attempt");
                                let _ = state_tx.send(ConnectionState::Reconnecting(attempt));
                                if !Self::interruptible_sleep(shutdown_rx.clone(), delay).await {
                                    break;
                                }
                                // The next poll re-establishes the transport
                            }
                            ReconnectDecision::AbortShutdownRequested => break,
                            ReconnectDecision::AbortBudgetExhausted => {
                                error!(
                                    attempts,
                                    reason, "Reconnection budget exhausted, giving up"
                                );
                                let _ = state_tx.send(ConnectionState::Failed(format!(
                                    "reconnection failed after {attempts} attempts: {reason}"
                                )));
                                return;
                            }
                        }
                    }
                }
            }
        }

        debug!("Supervisor stopped");
    }

    /// Sleep that wakes early on shutdown; returns false when interrupted
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
