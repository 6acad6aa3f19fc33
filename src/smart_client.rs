//! A discovery-aware client: selects one endpoint per call, or fans a call
//! out to every known endpoint and aggregates the result.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::codec::ConnOptions;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{DiscoveryError, OrpcError, Result};

fn split_addr(addr: &str) -> Result<(&str, &str)> {
    addr.split_once('@')
        .ok_or_else(|| OrpcError::Protocol(format!("malformed address, expected network@host:port: {addr}")))
}

/// Pools one [`Client`] per endpoint and delegates calls to a discovery
/// implementation's current endpoint set.
pub struct SmartClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    default_opt: ConnOptions,
    pool: AsyncMutex<HashMap<String, Arc<Client>>>,
}

impl SmartClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, default_opt: ConnOptions) -> Arc<Self> {
        Arc::new(SmartClient {
            discovery,
            mode,
            default_opt,
            pool: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Returns a pooled client for `addr`, dialing a fresh one if none
    /// exists or the existing one is no longer available.
    async fn client_for(&self, addr: &str) -> Result<Arc<Client>> {
        let mut pool = self.pool.lock().await;
        if let Some(existing) = pool.get(addr) {
            if existing.is_available() {
                return Ok(existing.clone());
            }
            let stale = pool.remove(addr).unwrap();
            drop(pool);
            let _ = stale.close().await;
            pool = self.pool.lock().await;
        }
        let (network, address) = split_addr(addr)?;
        let client = Client::dial(network, address, self.default_opt.clone()).await?;
        pool.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Refreshes discovery, selects one endpoint by `mode`, and delegates
    /// the call to its pooled client.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.discovery.refresh().await?;
        let addr = self.discovery.get(self.mode)?;
        let client = self.client_for(&addr).await?;
        client.call(method, args).await
    }

    /// Fans `method(args)` out to every currently known endpoint. The first
    /// success cancels the rest and is returned; if every endpoint fails,
    /// the first recorded error is returned.
    pub async fn broadcast_collect<A, R>(self: &Arc<Self>, method: &str, args: A) -> Result<R>
    where
        A: Serialize + Sync + Send + Clone + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        self.discovery.refresh().await?;
        let addrs = self.discovery.get_all();
        if addrs.is_empty() {
            return Err(OrpcError::Discovery(DiscoveryError::NoServers));
        }

        let token = CancellationToken::new();
        let args = Arc::new(args);
        let method = Arc::new(method.to_string());
        let mut set: JoinSet<Result<R>> = JoinSet::new();
        for addr in addrs {
            let this = self.clone();
            let child_token = token.clone();
            let args = args.clone();
            let method = method.clone();
            set.spawn(async move {
                tokio::select! {
                    result = async {
                        let client = this.client_for(&addr).await?;
                        client.call_with_cancel::<A, R>(&child_token, &method, &args).await
                    } => result,
                    _ = child_token.cancelled() => Err(OrpcError::Cancelled),
                }
            });
        }

        let mut first_error: Option<OrpcError> = None;
        let mut first_success: Option<R> = None;
        while let Some(joined) = set.join_next().await {
            let Ok(outcome) = joined else { continue };
            match outcome {
                Ok(reply) if first_success.is_none() => {
                    first_success = Some(reply);
                    token.cancel();
                }
                Ok(_) => {}
                Err(e) if first_success.is_none() && first_error.is_none() => {
                    first_error = Some(e);
                    token.cancel();
                }
                Err(_) => {}
            }
        }

        match (first_success, first_error) {
            (Some(reply), _) => Ok(reply),
            (None, Some(e)) => Err(e),
            (None, None) => Err(OrpcError::Discovery(DiscoveryError::NoServers)),
        }
    }

    /// Like [`SmartClient::broadcast_collect`], but for calls whose reply
    /// is not needed: successes are merely counted, and the first failure
    /// (if every endpoint fails) is surfaced.
    pub async fn broadcast_notify<A>(self: &Arc<Self>, method: &str, args: A) -> Result<()>
    where
        A: Serialize + Sync + Send + Clone + 'static,
    {
        self.discovery.refresh().await?;
        let addrs = self.discovery.get_all();
        if addrs.is_empty() {
            return Err(OrpcError::Discovery(DiscoveryError::NoServers));
        }

        let token = CancellationToken::new();
        let args = Arc::new(args);
        let method = Arc::new(method.to_string());
        let mut set: JoinSet<Result<serde_json::Value>> = JoinSet::new();
        for addr in addrs {
            let this = self.clone();
            let child_token = token.clone();
            let args = args.clone();
            let method = method.clone();
            set.spawn(async move {
                tokio::select! {
                    result = async {
                        let client = this.client_for(&addr).await?;
                        client
                            .call_with_cancel::<A, serde_json::Value>(&child_token, &method, &args)
                            .await
                    } => result,
                    _ = child_token.cancelled() => Err(OrpcError::Cancelled),
                }
            });
        }

        let mut first_error: Option<OrpcError> = None;
        let mut any_success = false;
        while let Some(joined) = set.join_next().await {
            let Ok(outcome) = joined else { continue };
            match outcome {
                Ok(_) => any_success = true,
                Err(e) if first_error.is_none() && !any_success => {
                    first_error = Some(e);
                    token.cancel();
                }
                Err(_) => {}
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(first_error.unwrap_or(OrpcError::Discovery(DiscoveryError::NoServers)))
        }
    }

    /// Closes every pooled client and clears the pool.
    pub async fn close(&self) {
        let mut pool = self.pool.lock().await;
        for (_, client) in pool.drain() {
            let _ = client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::server::Server;
    use crate::service::ServiceBuilder;
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, Serialize, Deserialize, Clone)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    async fn spawn_foo_server() -> String {
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
        format!("tcp@{addr}")
    }

    #[tokio::test]
    async fn call_selects_and_dials_an_endpoint() {
        let addr = spawn_foo_server().await;
        let discovery = Arc::new(StaticDiscovery::new(vec![addr]));
        let smart = SmartClient::new(discovery, SelectMode::RoundRobin, ConnOptions::default());
        let reply: i64 = smart
            .call("Foo.Sum", &Args { num1: 2, num2: 5 })
            .await
            .unwrap();
        assert_eq!(reply, 7);
    }

    #[tokio::test]
    async fn broadcast_collect_returns_first_success() {
        let a = spawn_foo_server().await;
        let b = spawn_foo_server().await;
        let discovery = Arc::new(StaticDiscovery::new(vec![a, b]));
        let smart = SmartClient::new(discovery, SelectMode::RoundRobin, ConnOptions::default());
        let reply: i64 = smart
            .broadcast_collect("Foo.Sum", Args { num1: 1, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply, 2);
    }

    #[tokio::test]
    async fn broadcast_notify_succeeds_if_any_endpoint_succeeds() {
        let a = spawn_foo_server().await;
        let discovery = Arc::new(StaticDiscovery::new(vec![a]));
        let smart = SmartClient::new(discovery, SelectMode::RoundRobin, ConnOptions::default());
        smart
            .broadcast_notify("Foo.Sum", Args { num1: 1, num2: 1 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broadcast_with_no_endpoints_fails() {
        let discovery = Arc::new(StaticDiscovery::new(vec![]));
        let smart = SmartClient::new(discovery, SelectMode::RoundRobin, ConnOptions::default());
        let err = smart
            .broadcast_collect::<_, i64>("Foo.Sum", Args { num1: 1, num2: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, OrpcError::Discovery(DiscoveryError::NoServers)));
    }
}
