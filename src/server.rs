//! The connection-oriented server: accepts connections, negotiates the
//! handshake preamble, and dispatches framed requests to a
//! [`ServiceRegistrar`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{
    CodecReader, CodecReaderExt, CodecWriter, CodecWriterExt, CodecType, ConnOptions, Header,
    CODEC_REGISTRY, MAGIC_NUMBER,
};
use crate::error::{OrpcError, Result};
use crate::service::{ErasedReply, ServiceDescriptor, ServiceRegistrar};

/// Accepts connections and dispatches requests to registered services.
///
/// One [`ServiceRegistrar`] is shared across every accepted connection, the
/// same way the Go server keeps one `serviceMap` for its whole process
/// lifetime.
pub struct Server {
    registrar: Arc<ServiceRegistrar>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Server {
            registrar: Arc::new(ServiceRegistrar::new()),
        }
    }

    /// Registers a service. Fails if a service of the same name already exists.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        self.registrar.register(descriptor)
    }

    /// `(service, method, call_count)` triples, the data a debug page would render.
    pub fn snapshot(&self) -> Vec<(String, String, u64)> {
        self.registrar.snapshot()
    }

    /// Accepts connections from `listener` forever, spawning one task per
    /// connection. Returns only on a fatal accept error.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let registrar = self.registrar.clone();
            tokio::spawn(async move {
                debug!(%peer, "accepted connection");
                if let Err(err) = serve_conn(stream, registrar).await {
                    warn!(%peer, error = %err, "connection terminated");
                }
            });
        }
    }
}

/// Handles one accepted connection end to end: strips an optional HTTP
/// `CONNECT` tunnel, reads the handshake preamble, then runs the request
/// loop until EOF.
async fn serve_conn(stream: TcpStream, registrar: Arc<ServiceRegistrar>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let opt = read_preamble(&mut reader).await?;

    let codec_type = opt.codec_type;
    let new_codec = CODEC_REGISTRY
        .get(&codec_type)
        .ok_or_else(|| OrpcError::Codec(format!("unknown codec type {codec_type:?}")))?;

    // Split before erasure, the same way the client does: the request loop
    // below owns the read half outright (it is the connection's sole
    // reader), while the write half is shared behind a mutex with every
    // spawned handler task. A single lock guarding both would let the loop's
    // wait for the *next* header starve a handler's reply write for the
    // request it is already holding — see the `Client` struct doc for the
    // identical failure mode on the client side.
    let (read_half, write_half) = tokio::io::split(reader);
    let read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
    let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
    let (codec_reader, codec_writer) = new_codec(read_half, write_half);
    let writer = Arc::new(AsyncMutex::new(codec_writer));

    run_request_loop(codec_reader, writer, registrar, opt.handle_timeout).await
}

/// Reads the HTTP `CONNECT` tunnel (if present) and the Option preamble,
/// returning the negotiated [`ConnOptions`].
async fn read_preamble(reader: &mut BufReader<TcpStream>) -> Result<ConnOptions> {
    let mut first_line = String::new();
    reader.read_line(&mut first_line).await?;

    if first_line.starts_with("CONNECT") {
        // Drain headers up to the blank line, then ack the tunnel.
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }
        reader
            .get_mut()
            .write_all(b"HTTP/1.0 200 Connected to  Orpc\n\n")
            .await?;
        let mut opt_line = String::new();
        reader.read_line(&mut opt_line).await?;
        parse_preamble_line(&opt_line)
    } else {
        // Not a CONNECT: first_line already holds the Option preamble (it
        // has been consumed as the line delimiter requires, not pushed back).
        parse_preamble_line(&first_line)
    }
}

fn parse_preamble_line(line: &str) -> Result<ConnOptions> {
    let opt: ConnOptions = serde_json::from_str(line.trim_end())
        .map_err(|e| OrpcError::Codec(format!("malformed handshake preamble: {e}")))?;
    if opt.magic_number != MAGIC_NUMBER {
        return Err(OrpcError::Codec(format!(
            "bad magic number: {:#x}",
            opt.magic_number
        )));
    }
    if !CODEC_REGISTRY.contains_key(&opt.codec_type) {
        return Err(OrpcError::Codec(format!("unknown codec type {:?}", opt.codec_type)));
    }
    Ok(opt)
}

async fn run_request_loop(
    mut reader: Box<dyn CodecReader>,
    writer: Arc<AsyncMutex<Box<dyn CodecWriter>>>,
    registrar: Arc<ServiceRegistrar>,
    handle_timeout: std::time::Duration,
) -> Result<()> {
    let mut in_flight = JoinSet::new();

    let result = loop {
        let header = match reader.read_header().await {
            Ok(h) => h,
            Err(OrpcError::Transport(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        match registrar.find(&header.service_method) {
            Ok((svc, method_name)) => {
                let body = match reader.read_body().await {
                    Ok(b) => b,
                    Err(e) => break Err(e),
                };
                let writer = writer.clone();
                let registrar = registrar.clone();
                let responded = Arc::new(AtomicBool::new(false));
                in_flight.spawn(handle_request(
                    writer,
                    registrar,
                    svc,
                    method_name,
                    header,
                    body,
                    handle_timeout,
                    responded,
                ));
            }
            Err(e) => {
                // Body must still be consumed to keep the stream aligned.
                if let Err(read_err) = reader.discard_body().await {
                    break Err(read_err);
                }
                let reply_header = Header {
                    service_method: header.service_method,
                    seq: header.seq,
                    error: e.to_string(),
                };
                let mut guard = writer.lock().await;
                if let Err(write_err) = guard.write_raw(&reply_header, b"null").await {
                    drop(guard);
                    break Err(write_err);
                }
            }
        }
    };

    while in_flight.join_next().await.is_some() {}

    let mut guard = writer.lock().await;
    let _ = guard.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    writer: Arc<AsyncMutex<Box<dyn CodecWriter>>>,
    registrar: Arc<ServiceRegistrar>,
    svc: Arc<ServiceDescriptor>,
    method_name: String,
    header: Header,
    body: Vec<u8>,
    handle_timeout: std::time::Duration,
    responded: Arc<AtomicBool>,
) {
    // The handler is a plain synchronous closure (`Fn(A) -> Result<R>`) that
    // may block the thread it runs on (spec S3's sleeping handler, or any
    // CPU-bound work). Racing it against a timer only works if it runs
    // somewhere the timer can still be polled while it is running, so it is
    // spawned onto the blocking thread pool rather than awaited inline.
    let invoke = tokio::task::spawn_blocking(move || {
        let mut de = serde_json::Deserializer::from_slice(&body);
        let mut de = <dyn erased_serde::Deserializer>::erase(&mut de);
        registrar.call(&svc, &method_name, &mut de)
    });

    let outcome: Result<ErasedReply> = if handle_timeout.is_zero() {
        match invoke.await {
            Ok(result) => result,
            Err(_) => Err(OrpcError::Invoke("handler task panicked".into())),
        }
    } else {
        tokio::select! {
            result = invoke => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(OrpcError::Invoke("handler task panicked".into())),
                }
            }
            _ = tokio::time::sleep(handle_timeout) => {
                if responded
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let reply_header = Header {
                        service_method: header.service_method.clone(),
                        seq: header.seq,
                        error: OrpcError::HandleTimeout(handle_timeout).to_string(),
                    };
                    let mut guard = writer.lock().await;
                    let _ = guard.write_raw(&reply_header, b"null").await;
                }
                return;
            }
        }
    };

    if responded
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // The timeout path already answered this seq; a late completion must be dropped.
        return;
    }

    let mut guard = writer.lock().await;
    match outcome {
        Ok(reply) => {
            let Ok(bytes) = serde_json::to_vec(&reply) else {
                return;
            };
            let reply_header = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: String::new(),
            };
            let _ = guard.write_raw(&reply_header, &bytes).await;
        }
        Err(e) => {
            let reply_header = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: e.to_string(),
            };
            let _ = guard.write_raw(&reply_header, b"null").await;
        }
    }
}

/// Decodes a reply body into `T`, for callers that received a raw body
/// (e.g. the debug surface) without going through [`CodecReaderExt`].
pub fn decode_reply<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::service::ServiceBuilder;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn foo_service() -> ServiceDescriptor {
        ServiceBuilder::new("Foo")
            .method("Sum", |a: Args| Ok(a.num1 + a.num2))
            .method("Fail", |_: Args| {
                Err::<i64, _>(OrpcError::Invoke("always fails".into()))
            })
            .build()
            .unwrap()
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        server.register(foo_service()).unwrap();
        tokio::spawn(async move {
            let _ = server.accept(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn round_trip_sum_call() {
        let addr = spawn_server().await;
        let client = Client::dial("tcp", &addr.to_string(), ConnOptions::default())
            .await
            .unwrap();
        let reply: i64 = client
            .call("Foo.Sum", &Args { num1: 3, num2: 4 })
            .await
            .unwrap();
        assert_eq!(reply, 7);
    }

    #[tokio::test]
    async fn unknown_method_returns_error_and_connection_survives() {
        let addr = spawn_server().await;
        let client = Client::dial("tcp", &addr.to_string(), ConnOptions::default())
            .await
            .unwrap();
        let err = client
            .call::<_, i64>("Foo.Missing", &Args { num1: 1, num2: 1 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("method not found: Missing"));

        let reply: i64 = client
            .call("Foo.Sum", &Args { num1: 1, num2: 2 })
            .await
            .unwrap();
        assert_eq!(reply, 3);
    }

    #[tokio::test]
    async fn handler_error_is_surfaced_as_invoke_error() {
        let addr = spawn_server().await;
        let client = Client::dial("tcp", &addr.to_string(), ConnOptions::default())
            .await
            .unwrap();
        let err = client
            .call::<_, i64>("Foo.Fail", &Args { num1: 1, num2: 1 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("always fails"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_timeout_produces_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new("Slow")
                    .method("Wait", |_: Args| {
                        std::thread::sleep(Duration::from_millis(200));
                        Ok::<i64, OrpcError>(1)
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        tokio::spawn(async move {
            let _ = server.accept(listener).await;
        });

        let mut opt = ConnOptions::default();
        opt.handle_timeout = Duration::from_millis(20);
        let client = Client::dial("tcp", &addr.to_string(), opt).await.unwrap();
        let err = client
            .call::<_, i64>("Slow.Wait", &Args { num1: 0, num2: 0 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("request handle timeout"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_outlasting_timeout_does_not_corrupt_the_next_reply() {
        // Regression: a late handler completion after the timeout reply was
        // sent must be dropped rather than overwrite a later seq's response.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        server
            .register(
                ServiceBuilder::new("Slow")
                    .method("Wait", |_: Args| {
                        std::thread::sleep(Duration::from_millis(150));
                        Ok::<i64, OrpcError>(1)
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        server.register(foo_service()).unwrap();
        tokio::spawn(async move {
            let _ = server.accept(listener).await;
        });

        let mut opt = ConnOptions::default();
        opt.handle_timeout = Duration::from_millis(20);
        let client = Client::dial("tcp", &addr.to_string(), opt).await.unwrap();
        let err = client
            .call::<_, i64>("Slow.Wait", &Args { num1: 0, num2: 0 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("request handle timeout"));

        // Give the slow handler time to finish in the background, then
        // confirm the connection still answers subsequent calls correctly.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reply: i64 = client
            .call("Foo.Sum", &Args { num1: 2, num2: 2 })
            .await
            .unwrap();
        assert_eq!(reply, 4);
    }
}
