//! Health reporting and the HTTP endpoint exposing it
//!
//! The agent is healthy when it can read the kernel interfaces it samples.
//! Each source reports its own [`HealthStatus`]; the overall status is the
//! worst of them. The endpoint is a deliberately small HTTP/1.1 responder
//! on a tokio listener with two routes:
//!
//! * `GET /healthz` always answers 200 with a [`HealthReport`]
//! * `GET /telemetry` answers 503 until a first record has been published

use crate::core::constants::{http, paths};
use crate::error::Result;
use crate::sensors::rapl::{self, RaplProbe};
use crate::telemetry::{HostEnergy, PublishedState};
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Failed,
}

impl HealthStatus {
    /// Worst status of the inputs, `Ok` for none
    pub fn worst<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses.into_iter().max().unwrap_or(HealthStatus::Ok)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Readability of the host CPU-time record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcHealth {
    pub status: HealthStatus,
    pub path: PathBuf,
    pub reason: Option<String>,
}

/// Check that `<proc_root>/stat` is readable and carries an aggregate `cpu ` line
pub async fn probe_proc(proc_root: impl AsRef<Path>) -> ProcHealth {
    let path = proc_root.as_ref().join("stat");
    let reason = match tokio::fs::read_to_string(&path).await {
        Ok(content) if content.lines().any(|l| l.starts_with("cpu ")) => None,
        Ok(_) => Some("no aggregate cpu line".to_string()),
        Err(e) => Some(e.to_string()),
    };
    ProcHealth {
        status: if reason.is_none() {
            HealthStatus::Ok
        } else {
            HealthStatus::Failed
        },
        path,
        reason,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub proc: ProcHealth,
    pub rapl: RaplProbe,
    /// Host energy of the latest published record
    pub energy_last: Option<HostEnergy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: HealthDetails,
}

impl HealthReport {
    pub fn new(proc: ProcHealth, rapl: RaplProbe, energy_last: Option<HostEnergy>) -> Self {
        let status = HealthStatus::worst([proc.status, rapl.status]);
        Self {
            status,
            details: HealthDetails {
                proc,
                rapl,
                energy_last,
            },
        }
    }
}

#[derive(Debug)]
struct CachedProbe {
    taken: Instant,
    probe: RaplProbe,
}

/// Everything the endpoint needs to answer a request.
///
/// The RAPL probe is refreshed once it is older than the TTL, so a change
/// of permissions on the counters shows up in `/healthz` while running.
#[derive(Debug)]
pub struct HealthSources {
    pub proc_root: PathBuf,
    pub rapl_root: PathBuf,
    pub published: Arc<PublishedState>,
    rapl_ttl: Duration,
    rapl: Mutex<CachedProbe>,
}

impl HealthSources {
    /// `rapl` is the probe taken at startup of the tree under `rapl_root`
    pub fn new(rapl_root: PathBuf, rapl: RaplProbe, published: Arc<PublishedState>) -> Self {
        Self {
            proc_root: PathBuf::from(paths::PROC_ROOT),
            rapl_root,
            published,
            rapl_ttl: http::RAPL_PROBE_TTL,
            rapl: Mutex::new(CachedProbe {
                taken: Instant::now(),
                probe: rapl,
            }),
        }
    }

    pub fn with_rapl_ttl(mut self, ttl: Duration) -> Self {
        self.rapl_ttl = ttl;
        self
    }

    async fn rapl(&self) -> RaplProbe {
        let mut cached = self.rapl.lock().await;
        if cached.taken.elapsed() >= self.rapl_ttl {
            let probe = rapl::probe(&self.rapl_root).await;
            if probe.status != cached.probe.status {
                info!("health.rapl {} -> {}", cached.probe.status, probe.status);
            }
            *cached = CachedProbe {
                taken: Instant::now(),
                probe,
            };
        }
        cached.probe.clone()
    }

    pub async fn report(&self) -> HealthReport {
        let (proc, rapl) = tokio::join!(probe_proc(&self.proc_root), self.rapl());
        let energy_last = self.published.latest().map(|t| t.host_energy.clone());
        HealthReport::new(proc, rapl, energy_last)
    }
}

/// HTTP endpoint serving health and the latest telemetry
pub struct HealthServer {
    listener: TcpListener,
    sources: Arc<HealthSources>,
}

impl HealthServer {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(addr: &str, sources: Arc<HealthSources>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, sources })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("health.listen {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("health.shutdown");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let sources = Arc::clone(&self.sources);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, sources).await {
                                    debug!("health.conn.error {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("health.accept.error {}", e),
                    }
                }
            }
        }
    }
}

/// Route one request line to a status line and JSON body
async fn route(request_line: &str, sources: &HealthSources) -> (&'static str, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    match (method, path) {
        ("GET", "/healthz") => {
            let report = sources.report().await;
            (
                "HTTP/1.1 200 OK",
                serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string()),
            )
        }
        ("GET", "/telemetry") => match sources.published.latest() {
            Some(telemetry) => (
                "HTTP/1.1 200 OK",
                serde_json::to_string(&*telemetry).unwrap_or_else(|_| "{}".to_string()),
            ),
            None => (
                "HTTP/1.1 503 Service Unavailable",
                r#"{"error":"no telemetry published yet"}"#.to_string(),
            ),
        },
        _ => (
            "HTTP/1.1 404 Not Found",
            r#"{"error":"not found"}"#.to_string(),
        ),
    }
}

async fn handle_connection(mut stream: TcpStream, sources: Arc<HealthSources>) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let n = stream.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let line = request.lines().next().unwrap_or("");
    let (status_line, body) = route(line, &sources).await;

    let response = format!(
        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
