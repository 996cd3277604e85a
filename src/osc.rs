//! OSC wire encoding for the downstream mapping application.
//!
//! Layout per message: NUL-terminated address padded to 4 bytes, type-tag
//! string (`,` + one tag per argument) padded to 4 bytes, then each argument
//! big-endian. Padding is done by `rosc`.

use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};

use crate::error::{RelayError, Result};
use crate::pose::VECTOR_LEN;

/// Address the Wekinator-style consumer listens on
pub const WEK_INPUTS_ADDR: &str = "/wek/inputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// 32-bit float, tag `f`
    Float,
    /// 64-bit float, tag `d`
    Double,
    /// 32-bit int, tag `i` (values are rounded)
    Int,
}

impl ArgKind {
    fn to_osc(self, value: f32) -> OscType {
        match self {
            ArgKind::Float => OscType::Float(value),
            ArgKind::Double => OscType::Double(value as f64),
            ArgKind::Int => OscType::Int(value.round() as i32),
        }
    }
}

/// Address plus an ordered list of argument types
#[derive(Debug, Clone, PartialEq)]
pub struct WireSchema {
    pub address: String,
    pub args: Vec<ArgKind>,
}

impl WireSchema {
    pub fn new(address: impl Into<String>, args: Vec<ArgKind>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// 17 keypoints × (x, y, score), all `f`
    pub fn pose(address: impl Into<String>) -> Self {
        Self::new(address, vec![ArgKind::Float; VECTOR_LEN])
    }

    /// Typed message for `values`. Length must match the schema exactly.
    pub fn build(&self, values: &[f32]) -> Result<OscMessage> {
        if values.len() != self.args.len() {
            return Err(RelayError::ContractViolation {
                what: "values",
                expected: self.args.len(),
                actual: values.len(),
            });
        }
        Ok(OscMessage {
            addr: self.address.clone(),
            args: self
                .args
                .iter()
                .zip(values)
                .map(|(kind, v)| kind.to_osc(*v))
                .collect(),
        })
    }
}

impl Default for WireSchema {
    fn default() -> Self {
        Self::pose(WEK_INPUTS_ADDR)
    }
}

pub fn encode_osc_message(msg: &OscMessage) -> Result<Vec<u8>> {
    let packet = OscPacket::Message(msg.clone());
    Ok(encoder::encode(&packet)?)
}

/// Vector to packet bytes. No bytes are produced on a length mismatch.
#[derive(Debug, Clone, Default)]
pub struct RelayEncoder {
    schema: WireSchema,
}

impl RelayEncoder {
    pub fn new(schema: WireSchema) -> Self {
        Self { schema }
    }

    pub fn encode(&self, values: &[f32]) -> Result<Vec<u8>> {
        let msg = self.schema.build(values)?;
        encode_osc_message(&msg)
    }
}

/// Decode a single-message packet into its address and numeric arguments.
pub fn decode_packet(bytes: &[u8]) -> Result<(String, Vec<f32>)> {
    let (_, packet) = decoder::decode_udp(bytes)?;
    let msg = match packet {
        OscPacket::Message(msg) => msg,
        OscPacket::Bundle(_) => return Err(RelayError::Encode("unexpected bundle".into())),
    };
    let mut values = Vec::with_capacity(msg.args.len());
    for arg in msg.args {
        values.push(match arg {
            OscType::Float(v) => v,
            OscType::Double(v) => v as f32,
            OscType::Int(v) => v as f32,
            other => {
                return Err(RelayError::Encode(format!("unsupported argument {other:?}")))
            }
        });
    }
    Ok((msg.addr, values))
}
