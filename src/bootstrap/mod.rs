//! Connection pool bootstrap
//!
//! Builds a session out of N freshly prepared connections:
//!
//! - draw the session identifier (0 for an admin client, random otherwise)
//! - dial and handshake N lanes concurrently, each retrying on its own
//! - wait for every lane; a session never starts short of connections
//! - key the obfuscator with lane 0's session key
//! - attach the connections in the order their lanes finished
//!
//! Each lane runs its own retry state machine:
//!
//! ```text
//!        +--------+  ok   +---------+  ok   +-------+
//! ------>|  Dial  |------>| Prepare |------>| Ready |
//!        +--------+       +---------+       +-------+
//!          ^    | err          | err (connection closed)
//!          |    v              v
//!        +----------------------+
//!        |       Backoff        |
//!        +----------------------+
//! ```

use crate::crypto::{random_u32, CryptoError, SessionKey};
use crate::handshake::Handshaker;
use crate::transport::Dialer;
use crate::tunnel::{
    EncryptionMethod, Obfuscator, Session, SessionConfig, SessionHandle, TunnelError,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bootstrap errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Bootstrap cancelled")]
    Cancelled,

    #[error("Lane task ended without a connection")]
    LaneLost,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Produces a fresh session on demand
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: SessionHandle;

    async fn establish(&self) -> Result<Self::Session, BootstrapError>;
}

/// Backoff between lane attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first failure
    pub initial: Duration,
    /// Upper bound on any single wait
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th consecutive failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max.max(self.initial))
    }
}

/// Bootstrap parameters
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Relay address (`host:port`)
    pub remote_addr: String,
    /// Connections per session
    pub num_conn: usize,
    /// Admin clients use session 0 over a single connection
    pub admin: bool,
    /// Frame protection for the session
    pub encryption_method: EncryptionMethod,
    pub retry: RetryPolicy,
}

/// Where a lane is in its attempt cycle
enum LaneState<C> {
    Dial,
    Prepare(C),
    Ready(C, SessionKey),
    Backoff,
}

/// A lane that made it to Ready
struct LaneOutcome<C> {
    lane: usize,
    conn: C,
    key: SessionKey,
}

/// Aborts lane tasks when the bootstrap ends for any reason
struct LaneGuard(Vec<JoinHandle<()>>);

impl Drop for LaneGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Establishes sessions over `num_conn` concurrent connections
pub struct Bootstrapper<D, H> {
    dialer: Arc<D>,
    handshaker: Arc<H>,
    config: BootstrapConfig,
    cancel: Option<watch::Receiver<bool>>,
}

impl<D, H> Bootstrapper<D, H>
where
    D: Dialer,
    H: Handshaker<D::Conn>,
{
    pub fn new(dialer: D, handshaker: H, config: BootstrapConfig) -> Self {
        Self {
            dialer: Arc::new(dialer),
            handshaker: Arc::new(handshaker),
            config,
            cancel: None,
        }
    }

    /// Abort any bootstrap in progress once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Number of lanes each bootstrap launches
    pub fn lane_count(&self) -> usize {
        if self.config.admin {
            1
        } else {
            self.config.num_conn.max(1)
        }
    }

    fn session_id(&self) -> Result<u32, BootstrapError> {
        if self.config.admin {
            Ok(0)
        } else {
            Ok(random_u32()?)
        }
    }

    /// Dial, prepare and assemble a new session
    pub async fn bootstrap(&self) -> Result<Session, BootstrapError> {
        info!("Attempting to start a new session");

        let session_id = self.session_id()?;
        let lanes = self.lane_count();
        let addr: Arc<str> = Arc::from(self.config.remote_addr.as_str());

        let (tx, mut rx) = mpsc::channel(lanes);
        let mut guard = LaneGuard(Vec::with_capacity(lanes));
        for lane in 0..lanes {
            let tx = tx.clone();
            let dialer = self.dialer.clone();
            let handshaker = self.handshaker.clone();
            let addr = addr.clone();
            let retry = self.config.retry;
            guard.0.push(tokio::spawn(async move {
                let outcome = run_lane(lane, dialer, handshaker, addr, session_id, retry).await;
                let _ = tx.send(outcome).await;
            }));
        }
        drop(tx);

        let cancelled = wait_cancelled(self.cancel.clone());
        tokio::pin!(cancelled);

        let mut completed: Vec<LaneOutcome<D::Conn>> = Vec::with_capacity(lanes);
        while completed.len() < lanes {
            tokio::select! {
                _ = &mut cancelled => {
                    info!("Bootstrap of session {} cancelled", session_id);
                    return Err(BootstrapError::Cancelled);
                }
                outcome = rx.recv() => match outcome {
                    Some(outcome) => completed.push(outcome),
                    None => return Err(BootstrapError::LaneLost),
                },
            }
        }
        drop(guard);
        debug!("All underlying connections established");

        let key = canonical_key(&completed)?;
        let obfuscator = Obfuscator::new(self.config.encryption_method, &key)?;
        let session = Session::new(session_id, SessionConfig::new(obfuscator));
        for outcome in completed {
            session.add_connection(outcome.conn).await?;
        }

        info!("Session {} established", session_id);
        Ok(session)
    }
}

#[async_trait]
impl<D, H> SessionFactory for Bootstrapper<D, H>
where
    D: Dialer,
    H: Handshaker<D::Conn>,
{
    type Session = Session;

    async fn establish(&self) -> Result<Session, BootstrapError> {
        self.bootstrap().await
    }
}

async fn run_lane<D, H>(
    lane: usize,
    dialer: Arc<D>,
    handshaker: Arc<H>,
    addr: Arc<str>,
    session_id: u32,
    retry: RetryPolicy,
) -> LaneOutcome<D::Conn>
where
    D: Dialer,
    H: Handshaker<D::Conn>,
{
    let mut attempt = 0u32;
    let mut state = LaneState::Dial;

    loop {
        state = match state {
            LaneState::Dial => {
                attempt += 1;
                match dialer.dial(&addr).await {
                    Ok(conn) => LaneState::Prepare(conn),
                    Err(e) => {
                        error!(
                            "Lane {}: failed to establish connection to {} (attempt {}): {}",
                            lane, addr, attempt, e
                        );
                        LaneState::Backoff
                    }
                }
            }
            LaneState::Prepare(mut conn) => {
                match handshaker.prepare(&mut conn, session_id).await {
                    Ok(key) => LaneState::Ready(conn, key),
                    Err(e) => {
                        error!(
                            "Lane {}: failed to prepare connection (attempt {}): {}",
                            lane, attempt, e
                        );
                        let _ = conn.shutdown().await;
                        LaneState::Backoff
                    }
                }
            }
            LaneState::Backoff => {
                let delay = retry.delay(attempt);
                debug!("Lane {}: retrying in {:?}", lane, delay);
                tokio::time::sleep(delay).await;
                LaneState::Dial
            }
            LaneState::Ready(conn, key) => {
                debug!("Lane {}: ready after {} attempt(s)", lane, attempt);
                return LaneOutcome { lane, conn, key };
            }
        };
    }
}

/// Lane 0's key; other lanes are expected to agree with it
fn canonical_key<C>(completed: &[LaneOutcome<C>]) -> Result<SessionKey, BootstrapError> {
    let key = completed
        .iter()
        .find(|o| o.lane == 0)
        .map(|o| o.key.clone())
        .ok_or(BootstrapError::LaneLost)?;

    for outcome in completed.iter().filter(|o| o.key != key) {
        warn!(
            "Lane {} derived a different session key than lane 0; using lane 0's",
            outcome.lane
        );
    }
    Ok(key)
}

/// Resolves once the cancel flag is raised; never resolves without one
async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
