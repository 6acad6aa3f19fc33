//! The wire-level framing abstraction: pairing one [`Header`] with one body
//! on a byte stream, plus the handshake preamble ([`ConnOptions`]) sent once
//! before any framed message.
//!
//! The read and write sides of the contract are deliberately two separate
//! traits ([`CodecReader`], [`CodecWriter`]) rather than one combined
//! `Codec`: spec §3 requires "the receive task is the sole reader, the Send
//! path serializes writes via a *dedicated* mutex" — i.e. a call must be
//! able to write a request while the receive task is parked awaiting the
//! next header. A single object implementing both halves, shared behind
//! one lock, makes that impossible: whichever side holds the lock across
//! its `.await` starves the other. Splitting the underlying stream with
//! [`tokio::io::split`] and handing one half exclusively to the reader and
//! the other (behind its own mutex) to writers is what actually delivers
//! the independence the spec asks for.
//!
//! The default [`JsonCodecReader`]/[`JsonCodecWriter`] pair is this crate's
//! self-describing encoding, playing the role the Go implementation gives
//! its Gob codec: callers never need to know a message's shape ahead of
//! time to skip over it.

use std::collections::HashMap;
use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{OrpcError, Result};

/// Magic number every connection's [`ConnOptions`] preamble must carry.
pub const MAGIC_NUMBER: i32 = 0x3BEF5C;

/// `(service_method, seq, error)` — always present, in this order, on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Error")]
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// Identifies which codec implementation to construct for a connection.
///
/// Only `Json` is registered by default; the type is open (like the Go
/// `Type` string) so a caller can register further codecs without this
/// crate needing to know about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    #[serde(rename = "application/json")]
    Json,
}

/// The handshake preamble sent once, immediately after connect, before any
/// framed (header, body) pair. See [`crate::client::Client::dial`] and
/// [`crate::server::Server::serve_conn`] — neither the codec nor any other
/// layer re-sends this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnOptions {
    #[serde(rename = "MagicNumber")]
    pub magic_number: i32,
    #[serde(rename = "CodecType")]
    pub codec_type: CodecType,
    #[serde(rename = "ConnectTimeOut", with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "HandleTimeout", with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::Json,
            connect_timeout: Duration::from_secs(1),
            handle_timeout: Duration::from_secs(1),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// The read half of the framing contract: headers and bodies off the wire.
///
/// Owned exclusively by one task (the receive loop on the client, the
/// request loop on the server) — never shared behind a lock. That
/// exclusivity, not a mutex, is what the "sole reader" invariant rests on.
#[async_trait]
pub trait CodecReader: Send {
    /// Reads one header frame from the stream.
    async fn read_header(&mut self) -> Result<Header>;

    /// Reads the body paired with the most recently read header, as raw
    /// encoded bytes. Must be called exactly once per `read_header` call,
    /// even to discard the body.
    async fn read_body(&mut self) -> Result<Vec<u8>>;
}

/// The write half of the framing contract: headers and bodies onto the wire.
///
/// Multiple callers may hold an `Arc<Mutex<Box<dyn CodecWriter>>>` and
/// write concurrently; the mutex (held by the caller, not this trait)
/// serializes them so no two calls' frames interleave.
#[async_trait]
pub trait CodecWriter: Send {
    /// Writes a header and its encoded body as one atomic unit from the
    /// writer's point of view. Callers still serialize concurrent writers
    /// externally (see the server and client write mutexes).
    async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Releases the underlying transport's write half.
    async fn close(&mut self) -> Result<()>;
}

/// Typed convenience methods layered over the raw [`CodecReader`] contract.
#[async_trait]
pub trait CodecReaderExt: CodecReader {
    /// Reads and decodes the next body into `T`.
    async fn read_body_into<T: DeserializeOwned + Send>(&mut self) -> Result<T> {
        let bytes = self.read_body().await?;
        serde_json::from_slice(&bytes).map_err(Into::into)
    }

    /// Reads and discards the next body without decoding it. The
    /// `into = null` case from the codec contract.
    async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await?;
        Ok(())
    }
}

impl<C: CodecReader + ?Sized> CodecReaderExt for C {}

/// Typed convenience methods layered over the raw [`CodecWriter`] contract.
#[async_trait]
pub trait CodecWriterExt: CodecWriter {
    /// Encodes `body` and writes it with `header`.
    async fn write<T: Serialize + Sync>(&mut self, header: &Header, body: &T) -> Result<()> {
        let bytes = serde_json::to_vec(body)?;
        self.write_raw(header, &bytes).await
    }
}

impl<C: CodecWriter + ?Sized> CodecWriterExt for C {}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            OrpcError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))
        } else {
            OrpcError::Transport(e)
        }
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| OrpcError::Codec("frame too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Length-delimited JSON reader: a 4-byte big-endian length prefix followed
/// by that many bytes of JSON, repeated for header then body.
///
/// This is this crate's concrete, self-describing default — the
/// equivalent of the Go implementation's Gob codec. The length prefix
/// exists only because JSON, unlike Gob, draws no frame boundary of its
/// own; callers never observe it.
pub struct JsonCodecReader<R> {
    stream: R,
}

impl<R: AsyncRead + Send + Unpin> JsonCodecReader<R> {
    pub fn new(stream: R) -> Self {
        JsonCodecReader { stream }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> CodecReader for JsonCodecReader<R> {
    async fn read_header(&mut self) -> Result<Header> {
        let bytes = read_frame(&mut self.stream).await?;
        serde_json::from_slice(&bytes).map_err(Into::into)
    }

    async fn read_body(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.stream).await
    }
}

/// Length-delimited JSON writer, the counterpart to [`JsonCodecReader`].
pub struct JsonCodecWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Send + Unpin> JsonCodecWriter<W> {
    pub fn new(stream: W) -> Self {
        JsonCodecWriter { stream }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> CodecWriter for JsonCodecWriter<W> {
    async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = serde_json::to_vec(header)?;
        write_frame(&mut self.stream, &header_bytes).await?;
        write_frame(&mut self.stream, body).await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Splits a boxed read half and write half into a [`CodecReader`]/
/// [`CodecWriter`] pair for the negotiated [`CodecType`]. Callers split the
/// underlying transport with [`tokio::io::split`] on the *concrete* stream
/// type (before it is erased into a trait object), then box each half —
/// that is what lets the read half outlive the write half's mutex-guarded
/// lifetime without either blocking the other.
pub type NewCodecFn = fn(
    Box<dyn AsyncRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>);

fn new_json_codec(
    read_half: Box<dyn AsyncRead + Send + Unpin>,
    write_half: Box<dyn AsyncWrite + Send + Unpin>,
) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    (
        Box::new(JsonCodecReader::new(read_half)),
        Box::new(JsonCodecWriter::new(write_half)),
    )
}

/// The codec registry: `CodecType` to constructor, mirroring the Go
/// package's `NewCodecFuncMap`.
pub static CODEC_REGISTRY: LazyLock<HashMap<CodecType, NewCodecFn>> = LazyLock::new(|| {
    let mut m: HashMap<CodecType, NewCodecFn> = HashMap::new();
    m.insert(CodecType::Json, new_json_codec as NewCodecFn);
    m
});
