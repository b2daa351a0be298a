//! Redis-backed lock store
//!
//! Locks are written with `SET key token NX PX ttl` and released with a Lua
//! script that deletes the key only while it still holds the caller's token.
//! A background probe keeps the connection alive and turns connectivity
//! changes into [`StoreEvent`]s; stores built from sentinels re-resolve the
//! master whenever the connection is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{EVENT_CHANNEL_CAPACITY, LockStore, StoreEvent};
use crate::config::{MasterOptions, StoreDescriptor};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

enum Source {
    Direct(Client),
    Sentinel {
        sentinels: Vec<(String, Client)>,
        master_name: String,
        options: MasterOptions,
    },
}

struct Inner {
    source: Source,
    connection: RwLock<Option<MultiplexedConnection>>,
    /// `host:port` of the master currently in use (sentinel sources only)
    master: RwLock<Option<String>>,
    connected: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
    release_script: Script,
}

/// Redis lock store
pub struct RedisStore {
    inner: Arc<Inner>,
    probe: JoinHandle<()>,
}

impl RedisStore {
    /// Build a store from a descriptor and start its health probe. The
    /// store connects in the background; watch for [`StoreEvent::Connect`].
    pub fn from_descriptor(
        descriptor: &StoreDescriptor,
        probe_interval: Duration,
    ) -> anyhow::Result<Self> {
        let source = match descriptor {
            StoreDescriptor::Url { url } => Source::Direct(
                Client::open(url.as_str()).with_context(|| format!("invalid redis url '{}'", url))?,
            ),
            StoreDescriptor::Sentinel {
                endpoints,
                master_name,
                options,
            } => {
                let sentinels = endpoints
                    .iter()
                    .map(|endpoint| {
                        Client::open(endpoint.as_str())
                            .map(|client| (endpoint.clone(), client))
                            .with_context(|| format!("invalid sentinel endpoint '{}'", endpoint))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Source::Sentinel {
                    sentinels,
                    master_name: master_name.clone(),
                    options: options.clone(),
                }
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            source,
            connection: RwLock::new(None),
            master: RwLock::new(None),
            connected: AtomicBool::new(false),
            events,
            release_script: Script::new(COMPARE_AND_DELETE),
        });

        let probe = tokio::spawn(Inner::run_probe(inner.clone(), probe_interval));
        Ok(Self { inner, probe })
    }

    async fn connection(&self) -> anyhow::Result<MultiplexedConnection> {
        self.inner
            .connection
            .read()
            .await
            .clone()
            .context("redis connection not ready")
    }

    async fn check_command_error(&self, err: redis::RedisError) -> anyhow::Error {
        if err.is_io_error() {
            self.inner.mark_down().await;
        }
        anyhow::Error::new(err)
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.probe.abort();
    }
}

impl Inner {
    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    async fn run_probe(inner: Arc<Inner>, probe_interval: Duration) {
        let mut ticker = tokio::time::interval(probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            inner.probe_once().await;
        }
    }

    async fn probe_once(&self) {
        let current = self.connection.read().await.clone();
        match current {
            Some(mut conn) => {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                if let Err(e) = pong {
                    warn!(error = %e, "Redis health probe failed");
                    self.mark_down().await;
                }
            }
            None => {
                if let Err(e) = self.connect().await {
                    debug!(error = %e, "Redis connect attempt failed");
                    self.emit(StoreEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn mark_down(&self) {
        let had_connection = self.connection.write().await.take().is_some();
        if had_connection {
            self.connected.store(false, Ordering::SeqCst);
            self.emit(StoreEvent::End);
        }
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let conn = match &self.source {
            Source::Direct(client) => client.get_multiplexed_async_connection().await?,
            Source::Sentinel {
                sentinels,
                master_name,
                options,
            } => {
                let master = self.resolve_master(sentinels, master_name).await?;
                let previous = self.master.read().await.clone();
                let switched = previous.as_deref().is_some_and(|p| p != master);
                if switched {
                    self.emit(StoreEvent::FailoverStart);
                }

                let url = master_url(&master, options);
                let client = Client::open(url.as_str())
                    .with_context(|| format!("invalid master address '{}'", master))?;
                let conn = client.get_multiplexed_async_connection().await?;

                *self.master.write().await = Some(master.clone());
                if switched {
                    self.emit(StoreEvent::SwitchMaster {
                        master: master.clone(),
                    });
                    self.emit(StoreEvent::FailoverEnd);
                }
                conn
            }
        };

        *self.connection.write().await = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        info!("Redis store connected");
        self.emit(StoreEvent::Connect);
        Ok(())
    }

    /// Ask each sentinel in turn for the master address.
    async fn resolve_master(
        &self,
        sentinels: &[(String, Client)],
        master_name: &str,
    ) -> anyhow::Result<String> {
        for (endpoint, client) in sentinels {
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Sentinel unreachable");
                    self.emit(StoreEvent::SentinelDisconnect {
                        endpoint: endpoint.clone(),
                    });
                    continue;
                }
            };
            self.emit(StoreEvent::SentinelConnect {
                endpoint: endpoint.clone(),
            });

            let addr: redis::RedisResult<Option<(String, u16)>> = redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async(&mut conn)
                .await;
            match addr {
                Ok(Some((host, port))) => return Ok(format!("{}:{}", host, port)),
                Ok(None) => {
                    warn!(endpoint = %endpoint, master = %master_name, "Sentinel does not know master");
                }
                Err(e) => {
                    error!(endpoint = %endpoint, error = %e, "Sentinel query failed");
                }
            }
        }
        anyhow::bail!("no sentinel could resolve master '{}'", master_name)
    }
}

/// Connection URL for a resolved master.
fn master_url(master: &str, options: &MasterOptions) -> String {
    let auth = match (&options.username, &options.password) {
        (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
        (None, Some(pass)) => format!(":{}@", pass),
        (Some(user), None) => format!("{}@", user),
        (None, None) => String::new(),
    };
    let db = options.db.map(|db| format!("/{}", db)).unwrap_or_default();
    format!("redis://{}{}{}", auth, master, db)
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.connection().await?;
        let reply: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => Err(self.check_command_error(e).await),
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: redis::RedisResult<i64> = self
            .inner
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        match deleted {
            Ok(deleted) => Ok(deleted == 1),
            Err(e) => Err(self.check_command_error(e).await),
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }
}
