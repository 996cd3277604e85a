//! TCP protocol between the pose producer and the relay.
//!
//! Length-delimited frames, bincode bodies. One connection carries one
//! producer's frames in send order; nothing is acknowledged.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{RelayError, Result};

/// Frames larger than this are a protocol error
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Producer → relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// One normalized pose, 51 floats
    PoseUpdate { values: Vec<f32> },
    /// Pointer position in 0..1 viewport units. Accepted, not relayed.
    PointerMove { x: f32, y: f32 },
}

/// Relay → producer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Sent once right after accept
    Greeting { hello: String },
}

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

pub async fn send_message<T: Serialize>(stream: &mut MessageStream, msg: &T) -> Result<()> {
    send_to_sink(stream, msg).await
}

/// Send on any framed sink, including the write half of a split stream.
pub async fn send_to_sink<S, T>(sink: &mut S, msg: &T) -> Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let data = encode_message(msg)?;
    sink.send(data)
        .await
        .map_err(|e| RelayError::Channel(format!("send failed: {e}")))
}

/// Next message, or `Channel` error on I/O failure or close.
pub async fn recv_message<S, T>(stream: &mut S) -> Result<T>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(bytes)) => decode_message(&bytes),
        Some(Err(e)) => Err(RelayError::Channel(format!("receive failed: {e}"))),
        None => Err(RelayError::Channel("connection closed".into())),
    }
}
