//! CA Server Module
//!
//! Accept loop of the certificate authority. Every connection is handed to
//! its own named worker thread running an [`EnrollmentSession`], so a slow or
//! failing device never blocks the listener or other enrollments.

use crate::configs::{CaConfig, CertConfig};
use crate::error::{io_error, EnrollError, EnrollResult};
use crate::session::{EnrollmentSession, SessionState};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

/// Idle time after which a silent device is disconnected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

type ActiveStreams = Arc<Mutex<HashMap<u64, TcpStream>>>;

/// Stops a running [`CaServer`] from another thread (or a signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    active: ActiveStreams,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Request shutdown: active sessions are disconnected and the accept
    /// loop exits once woken.
    pub fn trigger(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down CA server");
        for (id, stream) in lock(&self.active).iter() {
            debug!(session = id, "closing active session");
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Unblock accept() with a throwaway connection.
        let _ = TcpStream::connect_timeout(&self.wake_addr, Duration::from_secs(1));
    }

    pub fn is_triggered(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Certificate authority enrollment server.
pub struct CaServer {
    listener: TcpListener,
    config: CaConfig,
    cert_config: CertConfig,
    idle_timeout: Duration,
    shutdown: ShutdownHandle,
    next_id: AtomicU64,
}

impl CaServer {
    /// Bind the listener on `IP:PORT` from `config`.
    ///
    /// # Arguments
    /// * `config` - Server settings
    /// * `cert_config` - The CA's issuing identity (CA key, certificate, database)
    pub fn bind(config: CaConfig, cert_config: CertConfig) -> EnrollResult<Self> {
        let listener = TcpListener::bind((config.ip.as_str(), config.port))
            .map_err(io_error(format!("Failed to bind {}:{}", config.ip, config.port)))?;
        let local = listener
            .local_addr()
            .map_err(io_error("Failed to read listener address"))?;
        let shutdown = ShutdownHandle {
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(HashMap::new())),
            wake_addr: wake_address(local),
        };
        info!(addr = %local, "CA server listening");
        Ok(Self {
            listener,
            config,
            cert_config,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shutdown,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> EnrollResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(io_error("Failed to read listener address"))
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is triggered, then wait for the
    /// running sessions to finish.
    pub fn run(self) -> EnrollResult<()> {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        for incoming in self.listener.incoming() {
            if self.shutdown.is_triggered() {
                break;
            }
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            match self.spawn_session(stream) {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(error = %e, "failed to start session"),
            }
            workers.retain(|worker| !worker.is_finished());
        }

        for worker in workers {
            if worker.join().is_err() {
                error!("session worker panicked");
            }
        }
        info!("CA server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) -> EnrollResult<JoinHandle<()>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream
            .set_read_timeout(Some(self.idle_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.idle_timeout)))
            .map_err(io_error("Failed to set socket timeout"))?;
        let registered = stream
            .try_clone()
            .map_err(io_error("Failed to clone connection"))?;
        lock(&self.shutdown.active).insert(id, registered);
        info!(session = id, peer = %peer, "connection accepted");

        let config = self.config.clone();
        let cert_config = self.cert_config.clone();
        let active = Arc::clone(&self.shutdown.active);
        let spawned = thread::Builder::new()
            .name(format!("enroll-{}", id))
            .spawn(move || {
                let span = info_span!("session", id, peer = %peer);
                let _guard = span.enter();
                match serve(stream, &config, &cert_config) {
                    Ok(state) => info!(?state, "session finished"),
                    Err(EnrollError::Timeout) => warn!("session idle timeout"),
                    Err(e) => error!(error = %e, "session failed"),
                }
                if let Some(stream) = lock(&active).remove(&id) {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                lock(&self.shutdown.active).remove(&id);
                Err(io_error("Failed to spawn session worker")(e))
            }
        }
    }
}

fn serve(stream: TcpStream, config: &CaConfig, cert_config: &CertConfig) -> EnrollResult<SessionState> {
    EnrollmentSession::new(stream, config, cert_config)?.run()
}

/// Address that reaches a listener bound to `local`, mapping wildcard binds
/// to loopback.
fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
