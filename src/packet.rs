// Ref: https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html

use crate::error::MqttError;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// Largest inbound packet we are willing to buffer.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

/// Outgoing control packets.
enum Packet<'a> {
    Connect {
        client_id: &'a str,
        username: Option<&'a str>,
        password: Option<&'a str>,
        keep_alive: u16,
    },
    Publish {
        topic: &'a str,
        payload: &'a [u8],
        packet_id: Option<u16>,
    },
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        topic_filter: &'a str,
        qos: QoS,
    },
    PingReq,
    Disconnect,
}

struct ConnectFlags {
    username_flag: u8,
    password_flag: u8,
    will_retain: u8,
    will_qos: u8,
    will_flag: u8,
    clean_session: u8,
}

impl ConnectFlags {
    fn to_byte(&self) -> u8 {
        self.username_flag << 7
            | self.password_flag << 6
            | self.will_retain << 5
            | self.will_qos << 3 // QoS level is 2 bits (0, 1, 2)
            | self.will_flag << 2
            | self.clean_session << 1
    }
}

struct RawPacket {
    fixed_header: Vec<u8>,
    variable_header: Vec<u8>,
    payload: Vec<u8>,
}

impl RawPacket {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.fixed_header.len() + self.variable_header.len() + self.payload.len(),
        );
        bytes.extend_from_slice(&self.fixed_header);
        bytes.extend_from_slice(&self.variable_header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Rejects strings that do not fit a two byte length prefix.
fn check_str(field: &str, value: &str) -> Result<(), MqttError> {
    if value.len() > usize::from(u16::MAX) {
        return Err(MqttError::InvalidPacket(format!(
            "{field} is {} bytes, limit is {}",
            value.len(),
            u16::MAX
        )));
    }
    Ok(())
}

/// Writes a length-prefixed UTF-8 string. Callers run [`check_str`] first.
fn push_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Variable length "Remaining Length" encoding: seven bits per byte, the high
/// bit flags a continuation. At most four bytes.
fn encode_remaining_length(mut remaining_length: usize) -> Vec<u8> {
    let mut encoded_bytes = Vec::with_capacity(4);
    loop {
        let mut byte = (remaining_length % 128) as u8;
        remaining_length /= 128;
        if remaining_length > 0 {
            byte |= 0x80;
        }
        encoded_bytes.push(byte);
        if remaining_length == 0 {
            break;
        }
    }
    encoded_bytes
}

impl Packet<'_> {
    fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect { .. } => PacketType::Connect,
            Packet::Publish { .. } => PacketType::Publish,
            Packet::PubAck { .. } => PacketType::PubAck,
            Packet::Subscribe { .. } => PacketType::Subscribe,
            Packet::PingReq => PacketType::PingReq,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Low nibble of the first fixed header byte.
    fn header_flags(&self) -> u8 {
        match self {
            Packet::Publish {
                packet_id: Some(_), ..
            } => (QoS::AtLeastOnce as u8) << 1,
            Packet::Subscribe { .. } => 0b0010, // reserved, must be 0010
            _ => 0,
        }
    }

    fn to_raw_packet(&self) -> RawPacket {
        let mut packet = RawPacket {
            fixed_header: vec![(self.packet_type() as u8) << 4 | self.header_flags()],
            variable_header: Vec::new(),
            payload: Vec::new(),
        };

        match self {
            Packet::Connect {
                client_id,
                username,
                password,
                keep_alive,
            } => {
                push_str(&mut packet.variable_header, PROTOCOL_NAME);
                packet.variable_header.push(PROTOCOL_LEVEL);

                let connect_flags = ConnectFlags {
                    username_flag: u8::from(username.is_some()),
                    password_flag: u8::from(password.is_some()),
                    will_retain: 0,
                    will_qos: 0,
                    will_flag: 0,
                    clean_session: 1,
                };
                packet.variable_header.push(connect_flags.to_byte());
                packet
                    .variable_header
                    .extend_from_slice(&keep_alive.to_be_bytes());

                push_str(&mut packet.payload, client_id);
                if let Some(username) = username {
                    push_str(&mut packet.payload, username);
                }
                if let Some(password) = password {
                    push_str(&mut packet.payload, password);
                }
            }
            Packet::Publish {
                topic,
                payload,
                packet_id,
            } => {
                push_str(&mut packet.variable_header, topic);
                // Packet Identifier only present for QoS > 0
                if let Some(packet_id) = packet_id {
                    packet
                        .variable_header
                        .extend_from_slice(&packet_id.to_be_bytes());
                }
                packet.payload.extend_from_slice(payload);
            }
            Packet::PubAck { packet_id } => {
                packet
                    .variable_header
                    .extend_from_slice(&packet_id.to_be_bytes());
            }
            Packet::Subscribe {
                packet_id,
                topic_filter,
                qos,
            } => {
                packet
                    .variable_header
                    .extend_from_slice(&packet_id.to_be_bytes());
                push_str(&mut packet.payload, topic_filter);
                packet.payload.push(*qos as u8);
            }
            Packet::PingReq | Packet::Disconnect => {}
        }

        let remaining_length = packet.variable_header.len() + packet.payload.len();
        packet
            .fixed_header
            .extend(encode_remaining_length(remaining_length));

        packet
    }
}

pub fn craft_connect_packet(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive: u16,
) -> Result<Vec<u8>, MqttError> {
    check_str("client id", client_id)?;
    check_str("username", username.unwrap_or_default())?;
    check_str("password", password.unwrap_or_default())?;
    Ok(Packet::Connect {
        client_id,
        username,
        password,
        keep_alive,
    }
    .to_raw_packet()
    .to_bytes())
}

/// `packet_id` selects QoS 1; `None` publishes at QoS 0.
pub fn craft_publish_packet(
    topic: &str,
    payload: &[u8],
    packet_id: Option<u16>,
) -> Result<Vec<u8>, MqttError> {
    check_str("topic", topic)?;
    Ok(Packet::Publish {
        topic,
        payload,
        packet_id,
    }
    .to_raw_packet()
    .to_bytes())
}

pub fn craft_puback_packet(packet_id: u16) -> Vec<u8> {
    Packet::PubAck { packet_id }.to_raw_packet().to_bytes()
}

pub fn craft_subscribe_packet(
    packet_id: u16,
    topic_filter: &str,
    qos: QoS,
) -> Result<Vec<u8>, MqttError> {
    check_str("topic filter", topic_filter)?;
    Ok(Packet::Subscribe {
        packet_id,
        topic_filter,
        qos,
    }
    .to_raw_packet()
    .to_bytes())
}

pub fn craft_pingreq_packet() -> Vec<u8> {
    Packet::PingReq.to_raw_packet().to_bytes()
}

pub fn craft_disconnect_packet() -> Vec<u8> {
    Packet::Disconnect.to_raw_packet().to_bytes()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnackReturnCode {
    ConnectionAccepted = 0,
    ConnectionRefusedUnacceptableProtocolVersion = 1,
    ConnectionRefusedIdentifierRejected = 2,
    ConnectionRefusedServerUnavailable = 3,
    ConnectionRefusedBadUsernameOrPassword = 4,
    ConnectionRefusedNotAuthorized = 5,
}

impl TryFrom<u8> for ConnackReturnCode {
    type Error = MqttError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ConnackReturnCode::ConnectionAccepted),
            1 => Ok(ConnackReturnCode::ConnectionRefusedUnacceptableProtocolVersion),
            2 => Ok(ConnackReturnCode::ConnectionRefusedIdentifierRejected),
            3 => Ok(ConnackReturnCode::ConnectionRefusedServerUnavailable),
            4 => Ok(ConnackReturnCode::ConnectionRefusedBadUsernameOrPassword),
            5 => Ok(ConnackReturnCode::ConnectionRefusedNotAuthorized),
            _ => Err(MqttError::InvalidPacket(format!(
                "invalid CONNACK return code: {code}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub qos: QoS,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

/// Packets we expect the broker to send us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    ConnAck {
        session_present: bool,
        return_code: ConnackReturnCode,
    },
    Publish(PublishPacket),
    PubAck(u16),
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    PingResp,
    Unsupported(u8),
}

/// Decodes the remaining length starting at `buf[0]`. Returns the value and
/// the number of bytes it occupied, or `None` if more bytes are needed.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in buf.iter().take(4).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(MqttError::InvalidPacket(
            "remaining length exceeds four bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Length of the first complete packet in `buf`, if one has fully arrived.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, MqttError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let Some((remaining_length, length_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let total = 1 + length_bytes + remaining_length;
    if total > MAX_PACKET_SIZE {
        return Err(MqttError::PacketTooLarge);
    }

    Ok((buf.len() >= total).then_some(total))
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, MqttError> {
    buf.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or_else(|| MqttError::InvalidPacket("truncated two byte integer".to_string()))
}

fn parse_publish(header: u8, body: &[u8]) -> Result<PublishPacket, MqttError> {
    let qos = match (header >> 1) & 0b11 {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        other => {
            return Err(MqttError::InvalidPacket(format!(
                "unsupported PUBLISH QoS: {other}"
            )))
        }
    };

    let topic_length = usize::from(read_u16(body, 0)?);
    let topic = body
        .get(2..2 + topic_length)
        .ok_or_else(|| MqttError::InvalidPacket("truncated PUBLISH topic".to_string()))?;
    let topic = String::from_utf8(topic.to_vec())
        .map_err(|_| MqttError::InvalidPacket("PUBLISH topic is not UTF-8".to_string()))?;

    let mut offset = 2 + topic_length;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => {
            let packet_id = read_u16(body, offset)?;
            offset += 2;
            Some(packet_id)
        }
    };

    Ok(PublishPacket {
        topic,
        qos,
        packet_id,
        payload: body[offset..].to_vec(),
    })
}

/// Parses one complete packet, as delimited by [`frame_length`].
pub fn parse_packet(frame: &[u8]) -> Result<Incoming, MqttError> {
    let header = *frame
        .first()
        .ok_or_else(|| MqttError::InvalidPacket("empty packet".to_string()))?;
    let (remaining_length, length_bytes) = decode_remaining_length(&frame[1..])?
        .ok_or_else(|| MqttError::InvalidPacket("truncated fixed header".to_string()))?;
    let body = frame
        .get(1 + length_bytes..1 + length_bytes + remaining_length)
        .ok_or_else(|| MqttError::InvalidPacket("truncated packet body".to_string()))?;

    let packet_type = header >> 4;
    match PacketType::try_from(packet_type) {
        Ok(PacketType::ConnAck) => {
            if body.len() != 2 {
                return Err(MqttError::InvalidPacket(format!(
                    "CONNACK body must be 2 bytes, got {}",
                    body.len()
                )));
            }
            Ok(Incoming::ConnAck {
                session_present: body[0] & 0x01 == 1,
                return_code: ConnackReturnCode::try_from(body[1])?,
            })
        }
        Ok(PacketType::Publish) => Ok(Incoming::Publish(parse_publish(header, body)?)),
        Ok(PacketType::PubAck) => Ok(Incoming::PubAck(read_u16(body, 0)?)),
        Ok(PacketType::SubAck) => Ok(Incoming::SubAck {
            packet_id: read_u16(body, 0)?,
            return_codes: body[2..].to_vec(),
        }),
        Ok(PacketType::PingResp) => Ok(Incoming::PingResp),
        _ => Ok(Incoming::Unsupported(packet_type)),
    }
}
