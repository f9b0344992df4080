//! Bus transport for AmpShare messages
//!
//! Services talk to the bus through [`BusClient`] for outgoing requests and an
//! unbounded receiver of [`BusEvent`]s for everything incoming. [`MqttBus`] is the
//! production implementation; [`crate::memory::MemoryBroker`] provides an
//! in-process one.

use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BusOptions;
use crate::error::TransportError;

/// Something that happened on the bus connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Connection (re-)established; subscriptions must be (re-)installed
    Connected,
    /// Connection lost; the transport keeps trying to reconnect
    Disconnected,
    /// Message on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Incoming side of a bus connection. Unbounded so that nothing the broker
/// delivered is lost while a handler runs.
pub type BusEvents = mpsc::UnboundedReceiver<BusEvent>;

/// Message the broker publishes on a client's behalf if it vanishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Outgoing side of a bus connection.
///
/// Calls only queue the request and never wait on the network, so they are
/// safe to make from inside an event handler. Everything is at-least-once.
pub trait BusClient: Send + Sync {
    fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection cleanly; the will is not published
    fn disconnect(&self) -> Result<(), TransportError>;
}

/// MQTT client backed by `rumqttc`
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Start connecting in the background.
    ///
    /// The returned receiver yields [`BusEvent::Connected`] on every successful
    /// (re)connect. Lost connections are retried with exponential backoff.
    pub fn connect(options: &BusOptions, will: Option<Will>) -> (Self, BusEvents) {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.broker.host.clone(),
            options.broker.port,
        );
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some(will) = will {
            mqtt_options.set_last_will(LastWill::new(
                will.topic,
                will.payload,
                QoS::AtLeastOnce,
                false,
            ));
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.queue_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_event_loop(
            eventloop,
            event_tx,
            options.reconnect_delay,
            options.max_reconnect_delay,
        ));

        info!("MQTT: connecting to {} as {}", options.broker, options.client_id);
        (Self { client }, event_rx)
    }
}

impl BusClient for MqttBus {
    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        debug!("MQTT: subscribe {}", filter);
        self.client.try_subscribe(filter, QoS::AtLeastOnce)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        debug!("MQTT: publish {} ({} bytes)", topic, payload.len());
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.client.try_disconnect()?;
        Ok(())
    }
}

/// Drive the rumqttc event loop and forward what matters to the service
async fn run_event_loop(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<BusEvent>,
    initial_delay: Duration,
    max_delay: Duration,
) {
    let mut delay = initial_delay;
    let mut connected = false;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT: connected");
                connected = true;
                delay = initial_delay;
                BusEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                info!("MQTT: disconnected");
                let _ = tx.send(BusEvent::Disconnected);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("MQTT: connection error: {}", e);
                if connected {
                    connected = false;
                    if tx.send(BusEvent::Disconnected).is_err() {
                        break;
                    }
                }

                let wait = with_jitter(delay);
                info!("MQTT: reconnecting in {:?}", wait);
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, max_delay);
                continue;
            }
        };

        if tx.send(event).is_err() {
            warn!("MQTT: event receiver dropped, stopping");
            break;
        }
    }
}

/// Add up to 25% random jitter to a backoff delay
pub fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..100 {
            let d = with_jitter(base);
            assert!(d >= base);
            assert!(d <= Duration::from_millis(500));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }
}
