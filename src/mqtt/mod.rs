//! MQTT 3.1.1 control packet codec.

pub mod codec;
pub mod packet;

pub use codec::{MqttCodec, MqttError, MqttEvent};
pub use packet::{ConnectParams, QoS};
