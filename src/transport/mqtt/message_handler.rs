//! Pure routing of MQTT events and hand-off of inbound publishes

use crate::protocol::InboundMessage;
use rumqttc::v5::{mqttbytes::QoS, Event};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// QoS for every outgoing publish, retained or not
pub const PUBLISH_QOS: QoS = QoS::AtLeastOnce;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Whether an inbound publish should reach the bridge
    pub fn should_process_message(topic: &str, retain: bool, forward_retained: bool) -> bool {
        if retain && !forward_retained {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }
        true
    }

    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    }),
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(InboundMessage),
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands inbound publishes to the bridge's queue
pub struct InboundRouter {
    sender: Option<mpsc::Sender<InboundMessage>>,
    forward_retained: bool,
}

impl InboundRouter {
    pub fn new(forward_retained: bool) -> Self {
        Self {
            sender: None,
            forward_retained,
        }
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.sender = Some(sender);
    }

    /// Queue a message for the bridge. Blocks while the queue is full.
    pub async fn route(&self, message: InboundMessage) -> Result<(), String> {
        if !MessageHandler::should_process_message(
            &message.topic,
            message.retain,
            self.forward_retained,
        ) {
            return Ok(());
        }

        match &self.sender {
            Some(sender) => sender
                .send(message)
                .await
                .map_err(|e| format!("Bridge queue closed: {e}")),
            None => {
                warn!("Received MQTT message but no bridge queue configured - message dropped");
                Err("No bridge queue configured".to_string())
            }
        }
    }
}

impl Default for InboundRouter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet, Publish};

    #[test]
    fn test_should_process_message() {
        assert!(MessageHandler::should_process_message("/a", false, false));
        assert!(!MessageHandler::should_process_message("/a", true, false));
        assert!(MessageHandler::should_process_message("/a", true, true));
    }

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("/aaaaa-aa/sensor1"),
            pkid: 1,
            payload: Bytes::from(r#"{"t":1}"#),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "/aaaaa-aa/sensor1");
                assert_eq!(message.payload, br#"{"t":1}"#);
                assert!(!message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_publish_qos_is_at_least_once() {
        assert_eq!(PUBLISH_QOS, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_inbound_router() {
        let mut router = InboundRouter::new(false);
        let message = InboundMessage::new("/aaaaa-aa/x", b"1".to_vec());

        assert!(router.route(message.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        router.set_sender(tx);
        assert!(router.route(message.clone()).await.is_ok());

        let mut retained = message.clone();
        retained.retain = true;
        assert!(router.route(retained).await.is_ok());

        assert_eq!(rx.recv().await, Some(message));
        assert!(rx.try_recv().is_err(), "retained message should be filtered");
    }
}
