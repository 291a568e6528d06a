//! MQTT 3.1.1 packet encode/decode.
//!
//! Wire layout grounded on the synchronous encoding technique in
//! `newAM-w5500-rs`'s `mqtt/src/{connect,publish,subscribe,fixed_header}.rs`
//! (fixed header + remaining-length varint, written directly into a
//! caller-supplied buffer rather than built up through an async writer),
//! adapted from MQTT v5 to v3.1.1's simpler fixed header and CONNECT/CONNACK
//! payloads. Value types (`QoS`) follow `tjh-dev-mqtt`'s `misc::QoS`.

use thiserror::Error;

pub const PROTOCOL_NAME: &[u8] = b"MQTT";
pub const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid QoS value: {0}")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

mod control_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PUBREC: u8 = 5;
    pub const PUBREL: u8 = 6;
    pub const PUBCOMP: u8 = 7;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

/// Flags carried in the CONNECT variable header / in `publish`'s `flags`
/// argument: bits 0-1 are QoS, bit 2 is retain (for publish) / will-retain
/// (for connect, where it lands at bit 5 of the connect flags byte).
pub const QOS_MASK: u8 = 0b0000_0011;
pub const RETAIN_BIT: u8 = 0b0000_0100;

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingLengthOutcome {
    NeedMoreBytes,
    TooLarge,
    Ok { value: usize, consumed: usize },
}

fn decode_remaining_length(buf: &[u8]) -> RemainingLengthOutcome {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for (i, &byte) in buf.iter().enumerate().take(4) {
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return RemainingLengthOutcome::Ok {
                value,
                consumed: i + 1,
            };
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        RemainingLengthOutcome::TooLarge
    } else {
        RemainingLengthOutcome::NeedMoreBytes
    }
}

fn encode_utf8_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub struct ConnectParams<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will_topic: Option<&'a str>,
    pub will_msg: Option<&'a [u8]>,
    /// Same bit layout as `publish`'s flags byte: bits 0-1 QoS, bit 2 retain.
    pub will_flags: u8,
    pub keep_alive_secs: u16,
}

pub fn encode_connect(params: &ConnectParams) -> Vec<u8> {
    let mut variable_and_payload = Vec::new();
    encode_utf8_str(std::str::from_utf8(PROTOCOL_NAME).unwrap(), &mut variable_and_payload);
    variable_and_payload.push(PROTOCOL_LEVEL);

    let mut connect_flags = 0b0000_0010u8; // CLEAN_SESSION always set
    let has_will = params.will_topic.is_some() && params.will_msg.is_some();
    if has_will {
        connect_flags |= 0b0000_0100;
        let will_qos = params.will_flags & QOS_MASK;
        connect_flags |= will_qos << 3;
        if params.will_flags & RETAIN_BIT != 0 {
            connect_flags |= 0b0010_0000;
        }
    }
    if params.username.is_some() {
        connect_flags |= 0b1000_0000;
    }
    if params.password.is_some() {
        connect_flags |= 0b0100_0000;
    }
    variable_and_payload.push(connect_flags);
    variable_and_payload.extend_from_slice(&params.keep_alive_secs.to_be_bytes());

    encode_utf8_str(params.client_id, &mut variable_and_payload);
    if has_will {
        encode_utf8_str(params.will_topic.unwrap(), &mut variable_and_payload);
        let msg = params.will_msg.unwrap();
        variable_and_payload.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        variable_and_payload.extend_from_slice(msg);
    }
    if let Some(username) = params.username {
        encode_utf8_str(username, &mut variable_and_payload);
    }
    if let Some(password) = params.password {
        variable_and_payload.extend_from_slice(&(password.len() as u16).to_be_bytes());
        variable_and_payload.extend_from_slice(password);
    }

    let mut out = Vec::with_capacity(variable_and_payload.len() + 5);
    out.push(control_type::CONNECT << 4);
    encode_remaining_length(variable_and_payload.len(), &mut out);
    out.extend_from_slice(&variable_and_payload);
    out
}

pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    flags: u8,
    dup: bool,
    packet_id: Option<u16>,
) -> Vec<u8> {
    let qos = flags & QOS_MASK;
    let retain = flags & RETAIN_BIT != 0;

    let mut variable_and_payload = Vec::new();
    encode_utf8_str(topic, &mut variable_and_payload);
    if qos > 0 {
        variable_and_payload.extend_from_slice(&packet_id.expect("QoS>0 publish requires a packet id").to_be_bytes());
    }
    variable_and_payload.extend_from_slice(payload);

    let mut header_byte = control_type::PUBLISH << 4;
    header_byte |= qos << 1;
    if retain {
        header_byte |= 0b0000_0001;
    }
    if dup {
        header_byte |= 0b0000_1000;
    }

    let mut out = Vec::with_capacity(variable_and_payload.len() + 5);
    out.push(header_byte);
    encode_remaining_length(variable_and_payload.len(), &mut out);
    out.extend_from_slice(&variable_and_payload);
    out
}

fn encode_packet_id_only(control: u8, packet_id: u16) -> Vec<u8> {
    let mut out = vec![control << 4, 2];
    out.extend_from_slice(&packet_id.to_be_bytes());
    out
}

pub fn encode_puback(packet_id: u16) -> Vec<u8> {
    encode_packet_id_only(control_type::PUBACK, packet_id)
}

pub fn encode_pubrec(packet_id: u16) -> Vec<u8> {
    encode_packet_id_only(control_type::PUBREC, packet_id)
}

pub fn encode_pubrel(packet_id: u16) -> Vec<u8> {
    let mut out = vec![(control_type::PUBREL << 4) | 0b0010, 2];
    out.extend_from_slice(&packet_id.to_be_bytes());
    out
}

pub fn encode_pubcomp(packet_id: u16) -> Vec<u8> {
    encode_packet_id_only(control_type::PUBCOMP, packet_id)
}

pub fn encode_subscribe(packet_id: u16, topic: &str, max_qos: u8) -> Vec<u8> {
    let mut variable_and_payload = Vec::new();
    variable_and_payload.extend_from_slice(&packet_id.to_be_bytes());
    encode_utf8_str(topic, &mut variable_and_payload);
    variable_and_payload.push(max_qos & QOS_MASK);

    let mut out = Vec::with_capacity(variable_and_payload.len() + 5);
    out.push((control_type::SUBSCRIBE << 4) | 0b0010); // reserved bits fixed at 0b0010
    encode_remaining_length(variable_and_payload.len(), &mut out);
    out.extend_from_slice(&variable_and_payload);
    out
}

pub fn encode_pingreq() -> Vec<u8> {
    vec![control_type::PINGREQ << 4, 0]
}

pub fn encode_disconnect() -> Vec<u8> {
    vec![control_type::DISCONNECT << 4, 0]
}

/// A fully decoded incoming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, return_code: u8 },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
        dup: bool,
        packet_id: Option<u16>,
    },
    PubAck { packet_id: u16 },
    PubRec { packet_id: u16 },
    PubRel { packet_id: u16 },
    PubComp { packet_id: u16 },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("remaining length field exceeds the 4-byte varint limit")]
    RemainingLengthTooLarge,
    #[error("packet is structurally malformed")]
    Malformed,
    #[error("unrecognized control packet type {0}")]
    UnknownControlType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    NeedMoreBytes,
    /// `consumed` is the total size of the packet on the wire, so the
    /// caller can advance its buffer past it.
    Packet { packet: Packet, consumed: usize },
}

pub fn decode_packet(buf: &[u8]) -> Result<DecodeOutcome, DecodeError> {
    if buf.is_empty() {
        return Ok(DecodeOutcome::NeedMoreBytes);
    }
    let control = buf[0] >> 4;
    let flags = buf[0] & 0x0F;

    let (remaining_len, rl_consumed) = match decode_remaining_length(&buf[1..]) {
        RemainingLengthOutcome::NeedMoreBytes => return Ok(DecodeOutcome::NeedMoreBytes),
        RemainingLengthOutcome::TooLarge => return Err(DecodeError::RemainingLengthTooLarge),
        RemainingLengthOutcome::Ok { value, consumed } => (value, consumed),
    };
    let header_len = 1 + rl_consumed;
    let total = header_len + remaining_len;
    if buf.len() < total {
        return Ok(DecodeOutcome::NeedMoreBytes);
    }
    let body = &buf[header_len..total];

    let packet = match control {
        control_type::CONNACK => {
            if body.len() < 2 {
                return Err(DecodeError::Malformed);
            }
            Packet::ConnAck {
                session_present: body[0] & 1 != 0,
                return_code: body[1],
            }
        }
        control_type::PUBLISH => {
            if body.len() < 2 {
                return Err(DecodeError::Malformed);
            }
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            if body.len() < 2 + topic_len {
                return Err(DecodeError::Malformed);
            }
            let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
            let qos = (flags >> 1) & QOS_MASK;
            let retain = flags & 0b0001 != 0;
            let dup = flags & 0b1000 != 0;
            let mut offset = 2 + topic_len;
            let packet_id = if qos > 0 {
                if body.len() < offset + 2 {
                    return Err(DecodeError::Malformed);
                }
                let pid = u16::from_be_bytes([body[offset], body[offset + 1]]);
                offset += 2;
                Some(pid)
            } else {
                None
            };
            let payload = body[offset..].to_vec();
            Packet::Publish {
                topic,
                payload,
                qos,
                retain,
                dup,
                packet_id,
            }
        }
        control_type::PUBACK => Packet::PubAck {
            packet_id: packet_id_only(body)?,
        },
        control_type::PUBREC => Packet::PubRec {
            packet_id: packet_id_only(body)?,
        },
        control_type::PUBREL => Packet::PubRel {
            packet_id: packet_id_only(body)?,
        },
        control_type::PUBCOMP => Packet::PubComp {
            packet_id: packet_id_only(body)?,
        },
        control_type::SUBACK => {
            if body.len() < 2 {
                return Err(DecodeError::Malformed);
            }
            Packet::SubAck {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
                return_codes: body[2..].to_vec(),
            }
        }
        control_type::PINGRESP => Packet::PingResp,
        control_type::DISCONNECT => Packet::Disconnect,
        other => return Err(DecodeError::UnknownControlType(other)),
    };

    Ok(DecodeOutcome::Packet {
        packet,
        consumed: total,
    })
}

fn packet_id_only(body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() < 2 {
        return Err(DecodeError::Malformed);
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_roundtrips_across_varint_boundaries() {
        for &len in &[0usize, 1, 127, 128, 16383, 16384, 2_097_151] {
            let mut out = Vec::new();
            encode_remaining_length(len, &mut out);
            let decoded = decode_remaining_length(&out);
            assert_eq!(
                decoded,
                RemainingLengthOutcome::Ok {
                    value: len,
                    consumed: out.len()
                }
            );
        }
    }

    #[test]
    fn connect_flags_encode_clean_session_and_will_bits() {
        let params = ConnectParams {
            client_id: "c1",
            username: None,
            password: None,
            will_topic: Some("lwt/topic"),
            will_msg: Some(b"bye"),
            will_flags: (QoS::AtLeastOnce as u8) | RETAIN_BIT,
            keep_alive_secs: 60,
        };
        let encoded = encode_connect(&params);
        // header(1) + remaining-length(1, packet is short) + protocol
        // name len(2) + "MQTT"(4) + level(1) puts us at the flags byte.
        let flags_offset = 1 + 1 + 2 + 4 + 1;
        let flags_byte = encoded[flags_offset];
        assert_eq!(flags_byte & 0b0000_0010, 0b0000_0010, "clean session always set");
        assert_eq!(flags_byte & 0b0000_0100, 0b0000_0100, "will flag set");
        assert_eq!((flags_byte >> 3) & 0b11, 1, "will qos carried through");
        assert_eq!(flags_byte & 0b0010_0000, 0b0010_0000, "will retain carried through");
    }

    #[test]
    fn publish_wire_flags_match_the_qos_retain_formula() {
        let flags = (QoS::ExactlyOnce as u8) | RETAIN_BIT;
        let encoded = encode_publish("a/b", b"hi", flags, false, Some(42));
        let header_byte = encoded[0];
        assert_eq!(header_byte & 0x0F, (2 << 1) | 0b0001);
    }

    #[test]
    fn publish_roundtrips_through_decode() {
        let encoded = encode_publish("topic/x", b"payload", QoS::AtLeastOnce as u8, false, Some(7));
        let outcome = decode_packet(&encoded).unwrap();
        match outcome {
            DecodeOutcome::Packet { packet, consumed } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(
                    packet,
                    Packet::Publish {
                        topic: "topic/x".to_string(),
                        payload: b"payload".to_vec(),
                        qos: 1,
                        retain: false,
                        dup: false,
                        packet_id: Some(7),
                    }
                );
            }
            DecodeOutcome::NeedMoreBytes => panic!("expected complete packet"),
        }
    }

    #[test]
    fn truncated_packet_reports_need_more_bytes() {
        let encoded = encode_publish("t", b"123456", QoS::AtMostOnce as u8, false, None);
        let truncated = &encoded[..encoded.len() - 2];
        assert_eq!(decode_packet(truncated).unwrap(), DecodeOutcome::NeedMoreBytes);
    }

    #[test]
    fn connack_decodes_session_present_and_return_code() {
        let encoded = vec![control_type::CONNACK << 4, 2, 1, 0];
        match decode_packet(&encoded).unwrap() {
            DecodeOutcome::Packet { packet, .. } => assert_eq!(
                packet,
                Packet::ConnAck {
                    session_present: true,
                    return_code: 0
                }
            ),
            _ => panic!("expected complete packet"),
        }
    }
}
