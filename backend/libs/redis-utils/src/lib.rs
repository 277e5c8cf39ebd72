use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// Shared Redis connection manager guarded by a Tokio mutex.
///
/// Callers lock only long enough to clone the manager, then issue commands on
/// the clone so the mutex is never held across a round-trip.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis connection handle shared by the rate limiter and the event channel.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_timeout(redis_url, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let client = Client::open(info).context("failed to construct Redis client")?;

        let connection_manager = timeout(connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| anyhow!("timed out connecting to Redis after {connect_timeout:?}"))?
            .context("failed to initialize Redis connection manager")?;

        info!("Redis connection manager initialized");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    /// Underlying client, for connections the manager cannot multiplex (pub/sub).
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Round-trip health probe.
    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.lock().await.clone();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(reply) => reply == "PONG",
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                false
            }
        }
    }
}
