// Bounded per-shard connection pool. Callers wait when every connection
// is out; there is no "pool exhausted" error. Borrowed connections are
// validated first, with a role probe instead of a ping when leader
// discovery is configured.
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{POOL_IDLE_TIMEOUT, POOL_MAX_IDLE, ShardConfig};
use crate::conn::Conn;
use crate::error::{EngineError, Result};
use crate::sentinel::Sentinel;

pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: Arc<ShardConfig>,
    sentinel: Option<Arc<Sentinel>>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
    max_idle: usize,
}

struct IdleConn {
    conn: Conn,
    since: Instant,
}

impl Pool {
    pub fn new(config: Arc<ShardConfig>, sentinel: Option<Arc<Sentinel>>) -> Self {
        let using_password = if config.password.is_some() {
            "yes"
        } else {
            "no"
        };
        match &sentinel {
            None => tracing::info!(
                addr = %config.addr(),
                db = config.db,
                pool = config.pool_size,
                using_password,
                "store pool created"
            ),
            Some(_) => tracing::info!(
                master = config.master_name.as_deref().unwrap_or_default(),
                db = config.db,
                pool = config.pool_size,
                using_password,
                "store pool created with leader discovery"
            ),
        }
        let max_idle = config.pool_size.min(POOL_MAX_IDLE);
        Self {
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(config.pool_size)),
                idle: Mutex::new(Vec::new()),
                max_idle,
                config,
                sentinel,
            }),
        }
    }

    /// Borrows a connection, waiting for a slot when the pool is at its
    /// limit. Stale idle connections are discarded, the rest re-validated.
    pub async fn get(&self) -> Result<PooledConn> {
        let permit = Arc::clone(&self.shared.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)?;

        while let Some(idle) = self.pop_idle() {
            if idle.since.elapsed() > POOL_IDLE_TIMEOUT {
                continue;
            }
            let mut conn = idle.conn;
            if self.validate(&mut conn).await.is_ok() {
                return Ok(PooledConn::new(conn, Arc::clone(&self.shared), permit));
            }
        }

        let conn = self.dial().await?;
        Ok(PooledConn::new(conn, Arc::clone(&self.shared), permit))
    }

    fn pop_idle(&self) -> Option<IdleConn> {
        self.shared.idle.lock().expect("pool idle lock").pop()
    }

    async fn validate(&self, conn: &mut Conn) -> Result<()> {
        match &self.shared.sentinel {
            Some(_) => {
                if conn.is_master().await? {
                    Ok(())
                } else {
                    Err(EngineError::Store("failed leader role check".to_string()))
                }
            }
            None => conn.ping().await,
        }
    }

    async fn dial(&self) -> Result<Conn> {
        let addr = match &self.shared.sentinel {
            Some(sentinel) => sentinel.master_addr().await?,
            None => self.shared.config.addr(),
        };
        let mut conn = match Conn::connect(&self.shared.config, &addr).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(addr = %addr, error = %err, "store dial failed");
                return Err(err);
            }
        };
        // A freshly dialed connection still gets the role probe: sentinel
        // answers can lag a failover.
        if self.shared.sentinel.is_some() && !conn.is_master().await? {
            return Err(EngineError::Store("failed leader role check".to_string()));
        }
        metrics::counter!("manifold_pool_dials_total").increment(1);
        Ok(conn)
    }
}

/// A borrowed connection. Returns to the idle list on drop unless marked
/// broken or detached.
pub(crate) struct PooledConn {
    conn: Option<Conn>,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl PooledConn {
    fn new(conn: Conn, shared: Arc<PoolShared>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            shared,
            permit: Some(permit),
            broken: false,
        }
    }

    /// Flags the connection as unusable; it will be closed instead of
    /// recycled.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Takes the connection out of pool management entirely, keeping its
    /// pool slot occupied for as long as the permit lives. Used for the
    /// subscription connection, which never returns to command mode.
    pub fn detach(mut self) -> (Conn, OwnedSemaphorePermit) {
        let conn = self.conn.take().expect("connection already detached");
        let permit = self.permit.take().expect("permit already detached");
        (conn, permit)
    }
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("connection already detached")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("connection already detached")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut idle = self.shared.idle.lock().expect("pool idle lock");
        if idle.len() < self.shared.max_idle {
            idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }
}
