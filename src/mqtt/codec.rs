//! MQTT 3.1.1 session codec: exposes `init`/`connect`/`publish`/
//! `publish_pid`/`subscribe`/`disconnect`/`ping`/`sync`, plus the
//! CONNACK/PUBACK/inbound-PUBLISH callback hooks.
//!
//! This codec never touches a socket; it only encodes into `send_buf`
//! (drained by the PAL bridge into the WS codec) and decodes whatever
//! `sync` is handed back from the to-MQTT ring, producing a list of
//! [`MqttEvent`]s for `Client::service` to dispatch to the caller's
//! callbacks. That split is what makes it unit-testable without a socket.

use std::collections::HashMap;

use thiserror::Error;

use crate::mqtt::packet::{self, ConnectParams, DecodeError, DecodeOutcome, Packet, QOS_MASK};
use crate::ringbuf::RingBuf;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt packet decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("send buffer is full")]
    SendBufferFull,
}

/// One fact the codec observed while decoding inbound bytes, for
/// `Client::service` to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    ConnAckAccepted { session_present: bool },
    ConnAckRejected { return_code: u8 },
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
    },
    PubAck { packet_id: u16 },
    PingResp,
}

pub struct MqttCodec {
    pub send_buf: RingBuf,
    recv_accum: Vec<u8>,
    next_packet_id: u16,
    /// QoS>0 outbound publishes awaiting PUBACK (QoS1) or PUBREC (QoS2).
    inflight_qos1: HashMap<u16, ()>,
    inflight_qos2: HashMap<u16, ()>,
}

impl MqttCodec {
    pub fn new(buf_capacity: usize) -> Self {
        Self {
            send_buf: RingBuf::with_capacity(buf_capacity),
            recv_accum: Vec::new(),
            next_packet_id: 1,
            inflight_qos1: HashMap::new(),
            inflight_qos2: HashMap::new(),
        }
    }

    /// Resets session bookkeeping for a fresh `connect`, including inflight
    /// QoS>0 state, since CONNECT always sets CLEAN_SESSION and a clean
    /// session server-side with stale client-side bookkeeping would be a
    /// bug (see DESIGN.md, Open Question 3).
    pub fn reset(&mut self) {
        self.send_buf.reset();
        self.recv_accum.clear();
        self.next_packet_id = 1;
        self.inflight_qos1.clear();
        self.inflight_qos2.clear();
    }

    fn alloc_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    fn enqueue(&mut self, bytes: &[u8]) -> Result<(), MqttError> {
        if bytes.len() > self.send_buf.capacity() - self.send_buf.len() {
            return Err(MqttError::SendBufferFull);
        }
        self.send_buf.push(bytes);
        Ok(())
    }

    pub fn connect(&mut self, params: &ConnectParams) -> Result<(), MqttError> {
        self.enqueue(&packet::encode_connect(params))
    }

    /// Encodes and enqueues a PUBLISH, returning the packet id assigned
    /// when `flags` carries QoS>0 (0 for QoS 0, matching the source's
    /// "packet id is meaningless for QoS 0" convention).
    pub fn publish_pid(&mut self, topic: &str, payload: &[u8], flags: u8) -> Result<u16, MqttError> {
        let qos = flags & QOS_MASK;
        let packet_id = if qos > 0 { self.alloc_packet_id() } else { 0 };
        let encoded = packet::encode_publish(topic, payload, flags, false, if qos > 0 { Some(packet_id) } else { None });
        self.enqueue(&encoded)?;
        match qos {
            1 => {
                self.inflight_qos1.insert(packet_id, ());
            }
            2 => {
                self.inflight_qos2.insert(packet_id, ());
            }
            _ => {}
        }
        Ok(packet_id)
    }

    pub fn subscribe(&mut self, topic: &str, max_qos: u8) -> Result<u16, MqttError> {
        let packet_id = self.alloc_packet_id();
        self.enqueue(&packet::encode_subscribe(packet_id, topic, max_qos))?;
        Ok(packet_id)
    }

    pub fn disconnect(&mut self) -> Result<(), MqttError> {
        self.enqueue(&packet::encode_disconnect())
    }

    pub fn ping(&mut self) -> Result<(), MqttError> {
        self.enqueue(&packet::encode_pingreq())
    }

    /// Appends newly-received bytes (popped from the WS codec's to-MQTT
    /// ring by the PAL bridge) and decodes as many complete packets as are
    /// now available, returning the events they produced in wire order.
    pub fn sync(&mut self, incoming: &[u8]) -> Result<Vec<MqttEvent>, MqttError> {
        self.recv_accum.extend_from_slice(incoming);
        let mut events = Vec::new();
        let mut consumed_total = 0;

        loop {
            match packet::decode_packet(&self.recv_accum[consumed_total..])? {
                DecodeOutcome::NeedMoreBytes => break,
                DecodeOutcome::Packet { packet, consumed } => {
                    consumed_total += consumed;
                    if let Some(event) = self.handle_packet(packet)? {
                        events.push(event);
                    }
                }
            }
        }

        if consumed_total > 0 {
            self.recv_accum.drain(..consumed_total);
        }
        Ok(events)
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<Option<MqttEvent>, MqttError> {
        Ok(match packet {
            Packet::ConnAck { session_present, return_code } => {
                if return_code == 0 {
                    Some(MqttEvent::ConnAckAccepted { session_present })
                } else {
                    Some(MqttEvent::ConnAckRejected { return_code })
                }
            }
            Packet::Publish { topic, payload, qos, packet_id, .. } => {
                match qos {
                    1 => {
                        if let Some(pid) = packet_id {
                            self.enqueue(&packet::encode_puback(pid))?;
                        }
                    }
                    2 => {
                        if let Some(pid) = packet_id {
                            self.enqueue(&packet::encode_pubrec(pid))?;
                        }
                    }
                    _ => {}
                }
                Some(MqttEvent::Message { topic, payload, qos })
            }
            Packet::PubAck { packet_id } => {
                self.inflight_qos1.remove(&packet_id);
                Some(MqttEvent::PubAck { packet_id })
            }
            Packet::PubRec { packet_id } => {
                self.enqueue(&packet::encode_pubrel(packet_id))?;
                None
            }
            Packet::PubRel { packet_id } => {
                self.enqueue(&packet::encode_pubcomp(packet_id))?;
                None
            }
            Packet::PubComp { packet_id } => {
                self.inflight_qos2.remove(&packet_id);
                Some(MqttEvent::PubAck { packet_id })
            }
            Packet::SubAck { .. } => None,
            Packet::PingResp => Some(MqttEvent::PingResp),
            Packet::Disconnect => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_send_buf(codec: &mut MqttCodec) -> Vec<u8> {
        let mut out = vec![0u8; codec.send_buf.len()];
        codec.send_buf.pop(&mut out);
        out
    }

    #[test]
    fn publish_qos0_returns_packet_id_zero_and_tracks_nothing_inflight() {
        let mut codec = MqttCodec::new(4096);
        let pid = codec.publish_pid("t", b"hi", 0).unwrap();
        assert_eq!(pid, 0);
        assert!(codec.inflight_qos1.is_empty());
    }

    #[test]
    fn qos1_publish_then_puback_fires_puback_event_exactly_once() {
        let mut codec = MqttCodec::new(4096);
        let pid = codec.publish_pid("t", b"hi", 1).unwrap();
        assert!(codec.inflight_qos1.contains_key(&pid));
        drain_send_buf(&mut codec);

        let puback = packet::encode_puback(pid);
        let events = codec.sync(&puback).unwrap();
        assert_eq!(events, vec![MqttEvent::PubAck { packet_id: pid }]);
        assert!(!codec.inflight_qos1.contains_key(&pid));

        // a second sync with no new bytes produces no further events.
        let events2 = codec.sync(&[]).unwrap();
        assert!(events2.is_empty());
    }

    #[test]
    fn inbound_qos1_publish_enqueues_a_puback_and_emits_message() {
        let mut codec = MqttCodec::new(4096);
        let publish = packet::encode_publish("a/b", b"payload", 1, false, Some(55));
        let events = codec.sync(&publish).unwrap();
        assert_eq!(
            events,
            vec![MqttEvent::Message {
                topic: "a/b".to_string(),
                payload: b"payload".to_vec(),
                qos: 1
            }]
        );
        let sent = drain_send_buf(&mut codec);
        assert_eq!(sent, packet::encode_puback(55));
    }

    #[test]
    fn qos2_inbound_round_trip_sends_pubrec_then_pubcomp() {
        let mut codec = MqttCodec::new(4096);
        let publish = packet::encode_publish("a/b", b"x", 2, false, Some(9));
        codec.sync(&publish).unwrap();
        assert_eq!(drain_send_buf(&mut codec), packet::encode_pubrec(9));

        let pubrel = packet::encode_pubrel(9);
        codec.sync(&pubrel).unwrap();
        assert_eq!(drain_send_buf(&mut codec), packet::encode_pubcomp(9));
    }

    #[test]
    fn connack_accepted_vs_rejected() {
        let mut codec = MqttCodec::new(4096);
        let accepted = codec.sync(&[0x20, 2, 1, 0]).unwrap();
        assert_eq!(
            accepted,
            vec![MqttEvent::ConnAckAccepted { session_present: true }]
        );

        let mut codec2 = MqttCodec::new(4096);
        let rejected = codec2.sync(&[0x20, 2, 0, 5]).unwrap();
        assert_eq!(rejected, vec![MqttEvent::ConnAckRejected { return_code: 5 }]);
    }

    #[test]
    fn reset_clears_inflight_and_buffers() {
        let mut codec = MqttCodec::new(4096);
        codec.publish_pid("t", b"x", 1).unwrap();
        assert!(!codec.inflight_qos1.is_empty());
        codec.reset();
        assert!(codec.inflight_qos1.is_empty());
        assert_eq!(codec.send_buf.len(), 0);
    }
}
