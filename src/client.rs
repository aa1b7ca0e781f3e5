use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task;
use tokio::time;
use tracing::event;
use tracing::Level;

use crate::connection_string::ConnectionString;
use crate::error::{MqttError, TransportError};
use crate::packet::{self, ConnackReturnCode, Incoming, QoS};
use crate::transport::{InboundMessage, OutboundMessage, Transport};

pub const DEFAULT_KEEP_ALIVE: u16 = 60;

const SUBSCRIBE_PACKET_ID: u16 = 1;

type Responder = oneshot::Sender<Result<(), TransportError>>;

enum Request {
    Publish {
        topic: String,
        payload: Vec<u8>,
        responder: Responder,
    },
    PubAck(u16),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to the connection's event loop. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Client {
    device_id: String,
    request_sender: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Publish { topic, .. } => write!(f, "Publish({topic})"),
            Request::PubAck(id) => write!(f, "PubAck({id})"),
            Request::Disconnect(_) => write!(f, "Disconnect"),
        }
    }
}

#[derive(Default)]
pub struct ClientOptions<B, D> {
    broker: B,
    device: D,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Option<u16>,
}

#[derive(Default, Clone)]
pub struct MissingBroker;
#[derive(Default, Clone)]
pub struct Broker {
    host: String,
    port: u16,
}

#[derive(Default, Clone)]
pub struct MissingDevice;
#[derive(Default, Clone)]
pub struct Device(String);

impl ClientOptions<MissingBroker, MissingDevice> {
    pub fn new() -> Self {
        ClientOptions::default()
    }
}

impl ClientOptions<Broker, Device> {
    pub fn from_connection_string(connection: &ConnectionString) -> Self {
        let options = ClientOptions::new()
            .with_broker(connection.host_name.clone(), connection.port)
            .with_device_id(connection.device_id.clone());
        ClientOptions {
            username: connection.username.clone(),
            password: connection.password.clone(),
            ..options
        }
    }
}

impl<B, D> ClientOptions<B, D> {
    pub fn with_broker(self, host: String, port: u16) -> ClientOptions<Broker, D> {
        ClientOptions {
            broker: Broker { host, port },
            device: self.device,
            username: self.username,
            password: self.password,
            keep_alive: self.keep_alive,
        }
    }

    pub fn with_device_id(self, device_id: String) -> ClientOptions<B, Device> {
        ClientOptions {
            broker: self.broker,
            device: Device(device_id),
            username: self.username,
            password: self.password,
            keep_alive: self.keep_alive,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: u16) -> ClientOptions<B, D> {
        self.keep_alive = Some(keep_alive);
        self
    }
}

/// Device-to-cloud topic with the message properties appended as a property
/// bag, e.g. `devices/d1/messages/events/$.ct=application%2Fjson&$.ce=utf-8`.
pub fn events_topic(device_id: &str, message: &OutboundMessage) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        urlencoding::encode(&message.content_type),
        urlencoding::encode(&message.content_encoding)
    )
}

pub fn devicebound_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Connects, waits for CONNACK, subscribes to cloud-to-device messages and
/// spawns the event loop. Inbound messages arrive on the returned receiver.
pub async fn connect(
    options: ClientOptions<Broker, Device>,
) -> Result<(Client, mpsc::UnboundedReceiver<InboundMessage>), MqttError> {
    let broker_address = format!("{}:{}", options.broker.host, options.broker.port);
    let device_id = options.device.0;
    let keep_alive = options.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE);

    let mut stream = TcpStream::connect(&broker_address).await?;
    event!(Level::DEBUG, %broker_address, "Connected to MQTT broker.");

    let connect_packet = packet::craft_connect_packet(
        &device_id,
        options.username.as_deref(),
        options.password.as_deref(),
        keep_alive,
    )?;
    stream.write_all(&connect_packet).await?;
    event!(Level::DEBUG, "CONNECT message sent successfully.");

    let mut read_buffer = Vec::new();
    wait_for_connack(&mut stream, &mut read_buffer).await?;

    let subscribe_packet = packet::craft_subscribe_packet(
        SUBSCRIBE_PACKET_ID,
        &devicebound_filter(&device_id),
        QoS::AtLeastOnce,
    )?;
    stream.write_all(&subscribe_packet).await?;
    event!(Level::DEBUG, "SUBSCRIBE message sent successfully.");

    let (request_sender, request_receiver) = mpsc::unbounded_channel();
    let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();

    let event_loop = EventLoop {
        stream,
        read_buffer,
        keep_alive,
        request_receiver,
        inbound_sender,
        pending: HashMap::new(),
        next_packet_id: SUBSCRIBE_PACKET_ID,
    };

    task::spawn(event_loop.run());

    let client = Client {
        device_id,
        request_sender,
    };
    Ok((client, inbound_receiver))
}

async fn wait_for_connack(
    stream: &mut TcpStream,
    read_buffer: &mut Vec<u8>,
) -> Result<(), MqttError> {
    loop {
        if let Some(length) = packet::frame_length(read_buffer)? {
            let frame: Vec<u8> = read_buffer.drain(..length).collect();
            match packet::parse_packet(&frame)? {
                Incoming::ConnAck {
                    session_present,
                    return_code: ConnackReturnCode::ConnectionAccepted,
                } => {
                    event!(Level::DEBUG, session_present, "CONNACK received.");
                    return Ok(());
                }
                Incoming::ConnAck { return_code, .. } => {
                    return Err(MqttError::ConnectionRefused(return_code))
                }
                other => {
                    return Err(MqttError::InvalidPacket(format!(
                        "expected CONNACK, got {other:?}"
                    )))
                }
            }
        }

        if stream.read_buf(read_buffer).await? == 0 {
            return Err(MqttError::ConnectionClosed);
        }
    }
}

impl Client {
    /// Sends DISCONNECT and stops the event loop.
    pub async fn disconnect(&self) {
        let (done_sender, done_receiver) = oneshot::channel();
        if self
            .request_sender
            .send(Request::Disconnect(done_sender))
            .is_ok()
        {
            let _ = done_receiver.await;
        }
    }
}

impl Transport for Client {
    async fn send_event(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let (resp_tx, resp_rx) = oneshot::channel();

        self.request_sender
            .send(Request::Publish {
                topic: events_topic(&self.device_id, &message),
                payload: message.body,
                responder: resp_tx,
            })
            .map_err(|e| {
                event!(
                    Level::ERROR,
                    "Failed to send PUBLISH request to event loop: {}",
                    e
                );
                TransportError::Closed
            })?;

        resp_rx.await.map_err(|e| {
            event!(
                Level::ERROR,
                "Failed to receive response from event loop: {}",
                e
            );
            TransportError::Closed
        })?
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError> {
        match message.packet_id {
            Some(packet_id) => self
                .request_sender
                .send(Request::PubAck(packet_id))
                .map_err(|_| TransportError::Closed),
            None => Ok(()),
        }
    }
}

/// Half the keep-alive, at least one second. `None` when keep-alive is 0,
/// which disables it.
fn ping_period(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_secs(u64::from(keep_alive.max(2)) / 2))
}

struct EventLoop {
    stream: TcpStream,
    read_buffer: Vec<u8>,
    keep_alive: u16,
    request_receiver: mpsc::UnboundedReceiver<Request>,
    inbound_sender: mpsc::UnboundedSender<InboundMessage>,
    // QoS 1 publishes waiting for PUBACK
    pending: HashMap<u16, Responder>,
    next_packet_id: u16,
}

impl EventLoop {
    async fn run(mut self) {
        match self.handle_connection().await {
            Ok(()) => event!(Level::DEBUG, "Event loop stopped."),
            Err(MqttError::ConnectionClosed) => event!(Level::INFO, "Broker closed connection"),
            Err(e) => event!(Level::ERROR, "Connection error: {}", e),
        }

        for (_, responder) in self.pending.drain() {
            let _ = responder.send(Err(TransportError::ConnectionLost));
        }
    }

    async fn handle_connection(&mut self) -> Result<(), MqttError> {
        let ping_period = ping_period(self.keep_alive);
        let period = ping_period.unwrap_or(Duration::from_secs(1));
        let mut ping_interval = time::interval_at(time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ping_interval.tick(), if ping_period.is_some() => {
                    self.write(&packet::craft_pingreq_packet()).await?;
                    event!(Level::DEBUG, "PINGREQ message sent successfully.");
                }
                request = self.request_receiver.recv() => match request {
                    Some(Request::Publish { topic, payload, responder }) => {
                        self.handle_publish(topic, payload, responder).await?;
                    }
                    Some(Request::PubAck(packet_id)) => {
                        self.write(&packet::craft_puback_packet(packet_id)).await?;
                        event!(Level::DEBUG, packet_id, "PUBACK message sent successfully.");
                    }
                    Some(Request::Disconnect(done)) => {
                        let result = self.write(&packet::craft_disconnect_packet()).await;
                        let _ = done.send(());
                        return result;
                    }
                    None => {
                        let _ = self.write(&packet::craft_disconnect_packet()).await;
                        return Ok(());
                    }
                },
                read = self.stream.read_buf(&mut self.read_buffer) => {
                    if read? == 0 {
                        return Err(MqttError::ConnectionClosed);
                    }
                    self.handle_incoming_packets().await?;
                }
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), MqttError> {
        self.stream.write_all(bytes).await.map_err(|e| {
            event!(Level::ERROR, "Failed to write to broker: {}", e);
            MqttError::from(e)
        })
    }

    fn allocate_packet_id(&mut self) -> u16 {
        // zero is not a valid packet identifier
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    async fn handle_publish(
        &mut self,
        topic: String,
        payload: Vec<u8>,
        responder: Responder,
    ) -> Result<(), MqttError> {
        let packet_id = self.allocate_packet_id();
        let publish_packet = match packet::craft_publish_packet(&topic, &payload, Some(packet_id)) {
            Ok(publish_packet) => publish_packet,
            Err(e) => {
                event!(Level::ERROR, "Failed to encode PUBLISH message: {}", e);
                let _ = responder.send(Err(TransportError::Mqtt(e)));
                return Ok(());
            }
        };

        if let Err(e) = self.write(&publish_packet).await {
            let _ = responder.send(Err(TransportError::ConnectionLost));
            return Err(e);
        }

        event!(Level::DEBUG, packet_id, "PUBLISH message sent successfully.");
        self.pending.insert(packet_id, responder);
        Ok(())
    }

    async fn handle_incoming_packets(&mut self) -> Result<(), MqttError> {
        while let Some(length) = packet::frame_length(&self.read_buffer)? {
            let frame: Vec<u8> = self.read_buffer.drain(..length).collect();
            self.process_packet(packet::parse_packet(&frame)?).await?;
        }
        Ok(())
    }

    async fn process_packet(&mut self, packet: Incoming) -> Result<(), MqttError> {
        match packet {
            Incoming::PubAck(packet_id) => match self.pending.remove(&packet_id) {
                Some(responder) => {
                    let _ = responder.send(Ok(()));
                }
                None => event!(Level::DEBUG, packet_id, "PUBACK for unknown packet"),
            },
            Incoming::Publish(publish) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    body: publish.payload,
                    packet_id: publish.packet_id,
                };
                if let Err(mpsc::error::SendError(message)) = self.inbound_sender.send(message) {
                    // nobody is listening, complete it here so it is not redelivered
                    event!(Level::DEBUG, "Inbound receiver dropped, acknowledging message");
                    if let Some(packet_id) = message.packet_id {
                        self.write(&packet::craft_puback_packet(packet_id)).await?;
                    }
                }
            }
            Incoming::SubAck { return_codes, .. } => {
                if return_codes.iter().any(|code| *code == 0x80) {
                    event!(Level::WARN, "Broker rejected the cloud-to-device subscription");
                } else {
                    event!(Level::DEBUG, ?return_codes, "SUBACK received.");
                }
            }
            Incoming::PingResp => event!(Level::DEBUG, "PINGRESP packet received."),
            Incoming::ConnAck { .. } => event!(Level::DEBUG, "Unexpected CONNACK ignored"),
            Incoming::Unsupported(packet_type) => {
                event!(Level::DEBUG, "Unsupported packet type: {}", packet_type)
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_events_topic_carries_property_bag() {
        let message = OutboundMessage::json(b"{}".to_vec());
        assert_eq!(
            events_topic("sensor-1", &message),
            "devices/sensor-1/messages/events/$.ct=application%2Fjson&$.ce=utf-8"
        );
        assert_eq!(
            devicebound_filter("sensor-1"),
            "devices/sensor-1/messages/devicebound/#"
        );
    }

    #[test]
    fn test_options_from_connection_string() {
        let connection: ConnectionString =
            "HostName=h;DeviceId=d;Port=1884;Username=u;Password=p".parse().unwrap();
        let options = ClientOptions::from_connection_string(&connection).with_keep_alive(30);
        assert_eq!(options.broker.host, "h");
        assert_eq!(options.broker.port, 1884);
        assert_eq!(options.device.0, "d");
        assert_eq!(options.username.as_deref(), Some("u"));
        assert_eq!(options.password.as_deref(), Some("p"));
        assert_eq!(options.keep_alive, Some(30));
    }

    // Client-only packet types (CONNECT, SUBSCRIBE, DISCONNECT) come back as
    // Incoming::Unsupported with their type number.
    #[test]
    fn test_ping_period_follows_keep_alive() {
        assert_eq!(ping_period(0), None);
        assert_eq!(ping_period(1), Some(Duration::from_secs(1)));
        assert_eq!(ping_period(60), Some(Duration::from_secs(30)));
    }

    async fn read_frame(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Incoming {
        loop {
            if let Some(length) = packet::frame_length(buffer).unwrap() {
                let frame: Vec<u8> = buffer.drain(..length).collect();
                return packet::parse_packet(&frame).unwrap();
            }
            assert_ne!(stream.read_buf(buffer).await.unwrap(), 0, "client hung up");
        }
    }

    async fn local_broker() -> (TcpListener, ClientOptions<Broker, Device>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = ClientOptions::new()
            .with_broker("127.0.0.1".to_string(), port)
            .with_device_id("sensor-1".to_string());
        (listener, options)
    }

    #[tokio::test]
    async fn test_publish_resolves_on_puback_and_inbound_is_completed() {
        let (listener, options) = local_broker().await;

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();

            // CONNECT
            assert_eq!(
                read_frame(&mut stream, &mut buffer).await,
                Incoming::Unsupported(1)
            );
            stream.write_all(&[0x20, 2, 0, 0]).await.unwrap();

            // SUBSCRIBE
            assert_eq!(
                read_frame(&mut stream, &mut buffer).await,
                Incoming::Unsupported(8)
            );
            stream.write_all(&[0x90, 3, 0, 1, 1]).await.unwrap();

            // Telemetry PUBLISH, acknowledged
            let Incoming::Publish(publish) = read_frame(&mut stream, &mut buffer).await else {
                panic!("expected PUBLISH");
            };
            assert_eq!(
                publish.topic,
                "devices/sensor-1/messages/events/$.ct=application%2Fjson&$.ce=utf-8"
            );
            assert_eq!(publish.payload, br#"{"temperature":0}"#.to_vec());
            let packet_id = publish.packet_id.unwrap();
            stream
                .write_all(&packet::craft_puback_packet(packet_id))
                .await
                .unwrap();

            // Cloud-to-device message, expect PUBACK back
            stream
                .write_all(
                    &packet::craft_publish_packet(
                        "devices/sensor-1/messages/devicebound/%24.to=x",
                        br#"{"command":"pause","duration":10}"#,
                        Some(77),
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                read_frame(&mut stream, &mut buffer).await,
                Incoming::PubAck(77)
            );

            // DISCONNECT
            assert_eq!(
                read_frame(&mut stream, &mut buffer).await,
                Incoming::Unsupported(14)
            );
        });

        let (client, mut inbound) = connect(options).await.unwrap();

        client
            .send_event(OutboundMessage::json(br#"{"temperature":0}"#.to_vec()))
            .await
            .unwrap();

        let message = inbound.recv().await.unwrap();
        assert_eq!(message.packet_id, Some(77));
        assert_eq!(message.body, br#"{"command":"pause","duration":10}"#.to_vec());
        client.complete(&message).await.unwrap();

        client.disconnect().await;
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        let (listener, options) = local_broker().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            read_frame(&mut stream, &mut buffer).await;
            stream.write_all(&[0x20, 2, 0, 4]).await.unwrap();
        });

        assert!(matches!(
            connect(options).await,
            Err(MqttError::ConnectionRefused(
                ConnackReturnCode::ConnectionRefusedBadUsernameOrPassword
            ))
        ));
    }

    #[tokio::test]
    async fn test_pending_publish_fails_when_broker_hangs_up() {
        let (listener, options) = local_broker().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            read_frame(&mut stream, &mut buffer).await;
            stream.write_all(&[0x20, 2, 0, 0]).await.unwrap();
            read_frame(&mut stream, &mut buffer).await; // SUBSCRIBE
            read_frame(&mut stream, &mut buffer).await; // PUBLISH, never acked
        });

        let (client, _inbound) = connect(options).await.unwrap();

        let result = client
            .send_event(OutboundMessage::json(b"{}".to_vec()))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionLost)));
    }
}
