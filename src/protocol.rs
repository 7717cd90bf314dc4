//! TCP protocol between the remote caller and the responder.
//!
//! Length-delimited frames, each carrying one bincode message.

use anyhow::Context;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Caller → responder
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// 符号化済み画像 (JPEG/PNG)
    Frame { width: u32, height: u32, image: Vec<u8> },
    /// カメラ側でフレームなし。応答は返らない
    NoFrame,
}

/// Responder → caller
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Response {
    /// Primary subject, display-transformed
    Vertices { vertices: Vec<[f32; 3]> },
    Failed,
}

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode_message<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    bincode::deserialize(bytes).context("malformed message")
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T: Serialize>(stream: &mut MessageStream, msg: &T) -> anyhow::Result<()> {
    let data = encode_message(msg)?;
    stream.send(Bytes::from(data)).await?;
    Ok(())
}

/// Next raw frame; `None` once the peer has closed the connection.
pub async fn recv_frame(stream: &mut MessageStream) -> anyhow::Result<Option<Bytes>> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok(Some(bytes.freeze())),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Receive and deserialize a message.
pub async fn recv_message<T: DeserializeOwned>(stream: &mut MessageStream) -> anyhow::Result<T> {
    match recv_frame(stream).await? {
        Some(bytes) => decode_message(&bytes),
        None => Err(anyhow::anyhow!("connection closed")),
    }
}
