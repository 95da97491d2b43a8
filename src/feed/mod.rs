//! MQTT event feed
//!
//! [`FeedSubscriber`] is a reading source: it subscribes to a topic filter and
//! forwards every publish as a raw payload event. [`FeedPublisher`] is the
//! other end, used by the sniffer to publish each sensor reading retained.

use crate::config::FeedConfig;
use crate::error::{ConfigError, SourceError};
use crate::model::Reading;
use crate::source::{InboundEvent, InboundSender};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_QUEUE: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Broker host and port parsed from `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |why: &str| ConfigError::Invalid(format!("broker url {url:?}: {why}"));

        let rest = ["tcp://", "mqtt://"]
            .iter()
            .find_map(|scheme| url.strip_prefix(scheme))
            .ok_or_else(|| invalid("expected tcp://host:port"))?;

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid("bad host"));
        }
        Ok(BrokerAddr {
            host: host.to_string(),
            port,
        })
    }
}

fn mqtt_options(config: &FeedConfig, role: &str) -> Result<MqttOptions, ConfigError> {
    let broker = BrokerAddr::parse(&config.broker)?;
    let client_id = format!("{}-{role}", config.client_id);
    let mut options = MqttOptions::new(client_id, broker.host, broker.port);
    options.set_keep_alive(config.keep_alive);
    Ok(options)
}

/// Subscribes to a topic filter and turns publishes into inbound events.
pub struct FeedSubscriber {
    name: String,
    topic: String,
    options: MqttOptions,
}

impl FeedSubscriber {
    pub fn new(config: &FeedConfig) -> Result<Self, ConfigError> {
        Ok(FeedSubscriber {
            name: format!("mqtt:{}{}", config.broker, config.topic),
            topic: config.topic.clone(),
            options: mqtt_options(config, "recorder")?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive the MQTT connection until shutdown or until the consumer goes
    /// away. Connection errors are logged and the event loop reconnects.
    ///
    /// While a send into the channel is pending the event loop is not
    /// polled, so a stalled consumer stalls the broker connection too.
    pub async fn run(
        self,
        tx: InboundSender,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let (client, mut eventloop) = AsyncClient::new(self.options, REQUEST_QUEUE);
        info!(topic = %self.topic, "subscribing to event feed");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Clean sessions drop subscriptions, so subscribe on every connect.
                    client
                        .try_subscribe(self.topic.as_str(), QoS::AtMostOnce)
                        .map_err(|e| SourceError::Feed(e.to_string()))?;
                    info!(topic = %self.topic, "connected to broker");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "event received");
                    let event = InboundEvent::Payload {
                        stream_id: publish.topic,
                        payload: publish.payload,
                    };
                    let sent = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        debug!("consumer gone, leaving feed");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "broker connection error, reconnecting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        Ok(())
    }
}

/// Publishes readings, retained, at QoS 0.
pub struct FeedPublisher {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

impl FeedPublisher {
    /// Connect in the background; publishes are queued until the broker
    /// accepts the connection.
    pub fn connect(config: &FeedConfig, shutdown: CancellationToken) -> Result<Self, ConfigError> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config, "sniffer")?, REQUEST_QUEUE);
        let driver = tokio::spawn(drive(eventloop, shutdown));
        Ok(FeedPublisher { client, driver })
    }

    /// Publish `reading` on its stream id.
    pub async fn publish(&self, reading: &Reading) -> Result<(), SourceError> {
        let payload = reading
            .to_payload()
            .map_err(|e| SourceError::Feed(e.to_string()))?;
        self.client
            .publish(reading.stream_id.as_str(), QoS::AtMostOnce, true, payload)
            .await
            .map_err(|e| SourceError::Feed(e.to_string()))
    }

    /// Ask the broker to disconnect, giving the connection a moment to send
    /// what is queued.
    pub async fn close(mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut self.driver).await.is_err() {
            self.driver.abort();
        }
    }
}

async fn drive(mut eventloop: EventLoop, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("publisher connected to broker"),
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker connection error, reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}
