//! Event loops for the manager and station processes
//!
//! Each service owns its state machine by value and runs a single
//! `tokio::select!` loop, so handlers are strictly serialized and the state
//! needs no locks. Console output is fed through a `watch` snapshot.

use std::future::Future;

use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ManagerConfig, StationConfig};
use crate::error::TransportError;
use crate::manager::{Allocation, Manager, ManagerEvent};
use crate::registry::RegistrySnapshot;
use crate::station::{Outgoing, Station, StationSnapshot};
use crate::topics::{Topic, JOIN_FILTER, LEAVE_FILTER, MANAGER_PRESENCE, RESET_FILTER};
use crate::transport::{BusClient, BusEvent, BusEvents, Will};
use crate::types::{GridProperties, ManagerPresence};

/// Will of the manager connection: `{online: false}` on `services/manager`
pub fn manager_will() -> Result<Will, serde_json::Error> {
    Ok(Will::new(MANAGER_PRESENCE, ManagerPresence::offline().to_bytes()?))
}

/// Will of a station connection: a leave for that station
pub fn station_will(config: &StationConfig) -> Result<Will, serde_json::Error> {
    let (topic, event) = Station::new(config).last_will();
    Ok(Will::new(topic, event.to_bytes()?))
}

/// Manager process: membership events in, allocations out
pub struct ManagerService<C> {
    client: C,
    events: BusEvents,
    manager: Manager,
    config: ManagerConfig,
    snapshot_tx: watch::Sender<RegistrySnapshot>,
}

impl<C: BusClient> ManagerService<C> {
    pub fn new(client: C, events: BusEvents, config: ManagerConfig) -> Self {
        let manager = Manager::new(&config);
        let (snapshot_tx, _) = watch::channel(manager.snapshot());
        Self {
            client,
            events,
            manager,
            config,
            snapshot_tx,
        }
    }

    /// Registry snapshots, refreshed after every handled event
    pub fn snapshots(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run until `shutdown` resolves or the bus goes away.
    ///
    /// On shutdown the manager announces itself offline before disconnecting,
    /// so stations drop to zero just as they would on the will.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.config.timeout_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Manager: service loop started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Manager: shutting down");
                    self.publish_presence(ManagerPresence::offline());
                    if let Err(e) = self.client.disconnect() {
                        debug!("Manager: disconnect failed: {}", e);
                    }
                    return Ok(());
                }

                event = self.events.recv() => match event {
                    Some(BusEvent::Connected) => self.on_connected(),
                    Some(BusEvent::Disconnected) => {
                        warn!("Manager: bus connection lost, waiting for reconnect");
                    }
                    Some(BusEvent::Message { topic, payload }) => {
                        self.on_message(&topic, &payload);
                    }
                    None => {
                        warn!("Manager: bus closed");
                        return Err(TransportError::ConnectionClosed);
                    }
                },

                _ = ticker.tick() => {
                    let out = self.manager.check_timeouts(Instant::now().into_std());
                    if !out.is_empty() {
                        self.publish_allocations(&out);
                        self.refresh_snapshot();
                    }
                }
            }
        }
    }

    fn on_connected(&mut self) {
        info!("Manager: connected, installing subscriptions");
        for filter in [JOIN_FILTER, LEAVE_FILTER, RESET_FILTER] {
            if let Err(e) = self.client.subscribe(filter) {
                warn!("Manager: subscribe {} failed: {}", filter, e);
            }
        }
        self.publish_presence(ManagerPresence::online());
    }

    fn on_message(&mut self, topic: &str, payload: &[u8]) {
        let event = match ManagerEvent::from_message(topic, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Manager: dropping message on {}: {}", topic, e);
                return;
            }
        };

        let out = self.manager.handle(event, Instant::now().into_std());
        self.publish_allocations(&out);
        self.refresh_snapshot();
    }

    fn publish_allocations(&self, allocations: &[Allocation]) {
        for allocation in allocations {
            let topic = Topic::properties(&allocation.grid_id);
            let result = GridProperties::new(allocation.charge_current)
                .to_bytes()
                .map_err(TransportError::from)
                .and_then(|bytes| self.client.publish(&topic, bytes));
            if let Err(e) = result {
                warn!("Manager: publish {} failed: {}", topic, e);
            }
        }
    }

    fn publish_presence(&self, presence: ManagerPresence) {
        let result = presence
            .to_bytes()
            .map_err(TransportError::from)
            .and_then(|bytes| self.client.publish(MANAGER_PRESENCE, bytes));
        if let Err(e) = result {
            warn!("Manager: presence publish failed: {}", e);
        }
    }

    fn refresh_snapshot(&self) {
        self.snapshot_tx.send_replace(self.manager.snapshot());
    }
}

/// Station process: allocations in, join/leave/reset out, plus the charge ramp
pub struct StationService<C> {
    client: C,
    events: BusEvents,
    station: Station,
    config: StationConfig,
    snapshot_tx: watch::Sender<StationSnapshot>,
}

impl<C: BusClient> StationService<C> {
    pub fn new(client: C, events: BusEvents, config: StationConfig) -> Self {
        let station = Station::new(&config);
        let (snapshot_tx, _) = watch::channel(station.snapshot());
        Self {
            client,
            events,
            station,
            config,
            snapshot_tx,
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<StationSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run until `shutdown` resolves or the bus goes away.
    ///
    /// On shutdown the station publishes its own leave and disconnects
    /// cleanly; the will only covers a crash.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Station: {} service loop started (grid {})",
            self.station.station_id(),
            self.station.grid_id()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let leave = self.station.leave();
                    self.execute(vec![leave]);
                    if let Err(e) = self.client.disconnect() {
                        debug!("Station: disconnect failed: {}", e);
                    }
                    self.refresh_snapshot();
                    return Ok(());
                }

                event = self.events.recv() => {
                    match event {
                        Some(BusEvent::Connected) => {
                            let out = self.station.on_connected();
                            self.execute(out);
                        }
                        Some(BusEvent::Disconnected) => self.station.on_disconnected(),
                        Some(BusEvent::Message { topic, payload }) => {
                            match self.station.on_message(&topic, &payload) {
                                Ok(out) => self.execute(out),
                                Err(e) => warn!("Station: dropping message on {}: {}", topic, e),
                            }
                        }
                        None => {
                            warn!("Station: bus closed");
                            self.station.on_disconnected();
                            self.refresh_snapshot();
                            return Err(TransportError::ConnectionClosed);
                        }
                    }
                    self.refresh_snapshot();
                }

                _ = ticker.tick() => {
                    self.station.tick();
                    self.refresh_snapshot();
                }
            }
        }
    }

    fn execute(&self, out: Vec<Outgoing>) {
        for op in out {
            let result = match &op {
                Outgoing::Subscribe(filter) => self.client.subscribe(filter),
                Outgoing::Publish { topic, event } => event
                    .to_bytes()
                    .map_err(TransportError::from)
                    .and_then(|bytes| self.client.publish(topic, bytes)),
            };
            if let Err(e) = result {
                warn!("Station: {:?} failed: {}", op, e);
            }
        }
    }

    fn refresh_snapshot(&self) {
        self.snapshot_tx.send_replace(self.station.snapshot());
    }
}
