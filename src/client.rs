//! The pipelining client: one connection, many concurrently in-flight calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::codec::{CodecReader, CodecReaderExt, CodecWriter, CodecWriterExt, ConnOptions, Header, CODEC_REGISTRY};
use crate::error::{OrpcError, Result};

type CallResult = Result<Vec<u8>>;

/// A pending call awaiting its reply, consumed exactly once by construction
/// (the `oneshot::Sender` can only be used once).
struct Call {
    tx: oneshot::Sender<CallResult>,
}

/// One connection to an Orpc server, supporting any number of concurrently
/// outstanding calls multiplexed over it.
///
/// The codec's read half is owned solely by the background receive task
/// (spawned in [`Client::dial`]) and never stored here — only the write
/// half is, behind `writer`, since it is the only half more than one task
/// ever touches concurrently. Storing both halves behind one lock would let
/// the receive task's `read_header().await` (which can block for an
/// arbitrarily long time between requests) starve every `go()` call trying
/// to write, deadlocking the whole client; splitting the transport is what
/// spec §3's "the receive task is the sole reader, the Send path serializes
/// writes via a dedicated mutex" actually requires.
pub struct Client {
    writer: AsyncMutex<Box<dyn CodecWriter>>,
    pending: StdMutex<HashMap<u64, Call>>,
    seq: AtomicU64,
    closing: AtomicBool,
    shutdown: AtomicBool,
}

impl Client {
    /// Dials `address` over `network` ("tcp" or "http" for the CONNECT
    /// tunnel variant), sends the handshake preamble, and starts the
    /// background receive task. The whole sequence is bounded by
    /// `opt.connect_timeout`.
    pub async fn dial(network: &str, address: &str, opt: ConnOptions) -> Result<Arc<Client>> {
        tokio::time::timeout(opt.connect_timeout, Self::dial_inner(network, address, opt))
            .await
            .map_err(|_| OrpcError::ConnectTimeout)?
    }

    async fn dial_inner(network: &str, address: &str, opt: ConnOptions) -> Result<Arc<Client>> {
        let stream = TcpStream::connect(address).await?;
        let mut reader = BufReader::new(stream);

        if network == "http" {
            let connect = format!("CONNECT {address} HTTP/1.0\r\n\r\n");
            reader.get_mut().write_all(connect.as_bytes()).await?;
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(OrpcError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during CONNECT handshake",
                    )));
                }
                if line == "\r\n" || line == "\n" {
                    break;
                }
            }
        }

        let opt_json = serde_json::to_string(&opt)?;
        reader.get_mut().write_all(opt_json.as_bytes()).await?;
        reader.get_mut().write_all(b"\n").await?;

        let new_codec = CODEC_REGISTRY
            .get(&opt.codec_type)
            .ok_or_else(|| OrpcError::Codec(format!("unknown codec type {:?}", opt.codec_type)))?;

        // Split before erasure: the halves must be independently boxed so
        // the reader can live on its own task while the writer lives behind
        // its own mutex — see the struct doc comment.
        let (read_half, write_half) = tokio::io::split(reader);
        let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let (codec_reader, codec_writer) = new_codec(read_half, write_half);

        let client = Arc::new(Client {
            writer: AsyncMutex::new(codec_writer),
            pending: StdMutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let recv_client = client.clone();
        tokio::spawn(async move {
            recv_client.receive_loop(codec_reader).await;
        });

        Ok(client)
    }

    /// `!closing && !shutdown`.
    pub fn is_available(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Registers a pending call, stamps its `seq`, and writes the request
    /// frame. Returns a receiver that resolves when the reply arrives.
    async fn go<A: Serialize + Sync>(
        &self,
        method: &str,
        args: &A,
    ) -> Result<oneshot::Receiver<CallResult>> {
        if !self.is_available() {
            return Err(OrpcError::Shutdown);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(OrpcError::Shutdown);
            }
            pending.insert(seq, Call { tx });
        }

        let header = Header::request(method, seq);
        let body = serde_json::to_vec(args)?;
        let write_result = {
            let mut writer = self.writer.lock().await;
            writer.write_raw(&header, &body).await
        };
        if let Err(e) = write_result {
            self.pending.lock().unwrap().remove(&seq);
            self.terminate_pending().await;
            return Err(e);
        }
        Ok(rx)
    }

    /// Sends `args` to `method` and awaits the decoded reply, with no
    /// cancellation path.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let rx = self.go(method, args).await?;
        let body = rx.await.map_err(|_| OrpcError::Shutdown)??;
        serde_json::from_slice(&body).map_err(Into::into)
    }

    /// Like [`Client::call`], but races the reply against `token`. On
    /// cancellation the pending entry is left in place: a late reply is
    /// still consumed by the receive loop rather than leaking.
    pub async fn call_with_cancel<A, R>(
        &self,
        token: &CancellationToken,
        method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let rx = self.go(method, args).await?;
        tokio::select! {
            result = rx => {
                let body = result.map_err(|_| OrpcError::Shutdown)??;
                serde_json::from_slice(&body).map_err(Into::into)
            }
            _ = token.cancelled() => Err(OrpcError::Cancelled),
        }
    }

    /// Marks the client as closing. Idempotent in effect; returns
    /// `OrpcError::Shutdown` if already closing.
    pub async fn close(&self) -> Result<()> {
        if self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrpcError::Shutdown);
        }
        self.terminate_pending().await;
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }

    /// Write mutex, then state mutex — the ordering invariant that keeps a
    /// concurrent `go()` from observing a half-torn-down client.
    async fn terminate_pending(&self) {
        let _write_guard = self.writer.lock().await;
        self.shutdown.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();
        for (_, call) in pending.drain() {
            let _ = call.tx.send(Err(OrpcError::Shutdown));
        }
    }

    /// Runs for the lifetime of the connection on its own task, holding the
    /// codec's read half exclusively — no lock is ever taken to read, so a
    /// long wait for the next header never blocks a concurrent `go()`.
    async fn receive_loop(self: Arc<Self>, mut reader: Box<dyn CodecReader>) {
        loop {
            let header = match reader.read_header().await {
                Ok(h) => h,
                Err(_) => {
                    self.terminate_pending().await;
                    return;
                }
            };

            let body = match reader.read_body().await {
                Ok(b) => b,
                Err(_) => {
                    self.terminate_pending().await;
                    return;
                }
            };

            let call = self.pending.lock().unwrap().remove(&header.seq);
            let Some(call) = call else {
                warn!(seq = header.seq, "reply for unknown or already-resolved call");
                continue;
            };

            let result = if header.error.is_empty() {
                Ok(body)
            } else {
                Err(OrpcError::Invoke(header.error))
            };
            let _ = call.tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::service::ServiceBuilder;
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new("Foo")
                    .method("Sum", |a: Args| Ok(a.num1 + a.num2))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        tokio::spawn(async move {
            let _ = server.accept(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn pipelines_concurrent_calls() {
        let addr = spawn_server().await;
        let client = Client::dial("tcp", &addr.to_string(), ConnOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..20i64 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .call::<_, i64>(
                        "Foo.Sum",
                        &Args {
                            num1: i,
                            num2: i,
                        },
                    )
                    .await
                    .unwrap()
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap(), i as i64 * 2);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_in_effect_but_errors_twice() {
        let addr = spawn_server().await;
        let client = Client::dial("tcp", &addr.to_string(), ConnOptions::default())
            .await
            .unwrap();
        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(client.close().await.is_err());
    }

    #[tokio::test]
    async fn connect_timeout_on_unreachable_address() {
        // 10.255.255.1 is a non-routable address chosen to hang rather than refuse.
        let mut opt = ConnOptions::default();
        opt.connect_timeout = std::time::Duration::from_millis(50);
        let result = Client::dial("tcp", "10.255.255.1:9", opt).await;
        assert!(result.is_err());
    }
}
