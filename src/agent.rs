//! Wires configuration, readers, resolver, loop and health endpoint

use crate::config::{AgentConfig, SamplingConfig};
use crate::error::Result;
use crate::health::{HealthServer, HealthSources, HealthStatus};
use crate::resolver::{ProcessIdentityResolver, ResolvedIdentity};
use crate::sampling::{LoopStats, Readers, SamplingLoop};
use crate::sensors::host_cpu::HostCpuTimeReader;
use crate::sensors::process_cpu::ProcessCpuTimeReader;
use crate::sensors::rapl::{self, EnergyCounterReader, RaplProbe};
use crate::telemetry::PublishedState;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// A configured agent, target resolved, ready to run
pub struct Agent {
    config: AgentConfig,
    sampling: SamplingConfig,
    rapl: RaplProbe,
    identity: ResolvedIdentity,
    published: Arc<PublishedState>,
    sampling_loop: SamplingLoop,
}

impl Agent {
    /// Probe the energy counters, resolve the target and build the loop.
    ///
    /// A target that cannot be resolved fails startup. Missing or
    /// unreadable energy counters do not; the health endpoint reports them.
    pub async fn start(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let sampling = config.sampling.to_config()?;

        let probe = rapl::probe(&config.energy.rapl.base_path).await;
        match probe.status {
            HealthStatus::Ok => info!(
                "rapl.ok vendor={:?} packages={}",
                probe.vendor,
                probe.readable_packages().count()
            ),
            status => warn!(
                "rapl.{} {}",
                status.to_string().to_lowercase(),
                probe.hint.as_deref().unwrap_or("")
            ),
        }

        let resolver = Arc::new(ProcessIdentityResolver::new(&config.target)?);
        let identity = resolver.resolve().await.map_err(|e| {
            error!("agent.resolve.fail code={} {}", e.code(), e);
            e
        })?;
        info!("agent.target pid={}", identity.pid);

        let readers = Readers::new(
            EnergyCounterReader::from_probe(&probe, sampling.clamp),
            HostCpuTimeReader::new(sampling.tick_hz, sampling.clamp),
            ProcessCpuTimeReader::new(identity.pid, sampling.tick_hz),
        );
        let published = Arc::new(PublishedState::new());
        let sampling_loop = SamplingLoop::new(&sampling, readers, Arc::clone(&published))
            .with_resolver(resolver)?;

        Ok(Self {
            config,
            sampling,
            rapl: probe,
            identity,
            published,
            sampling_loop,
        })
    }

    pub fn identity(&self) -> &ResolvedIdentity {
        &self.identity
    }

    pub fn rapl(&self) -> &RaplProbe {
        &self.rapl
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn published(&self) -> Arc<PublishedState> {
        Arc::clone(&self.published)
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.sampling_loop.stats()
    }

    /// Sample and serve health until `shutdown` completes
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let sources = Arc::new(HealthSources::new(
            self.config.energy.rapl.base_path.clone(),
            self.rapl.clone(),
            Arc::clone(&self.published),
        ));
        let server = HealthServer::bind(&self.config.export.http.address(), sources).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stopped = |mut rx: watch::Receiver<bool>| async move {
            let _ = rx.wait_for(|stop| *stop).await;
        };

        let trigger = async move {
            shutdown.await;
            info!("agent.shutdown");
            let _ = stop_tx.send(true);
        };

        let ((), (), served) = tokio::join!(
            trigger,
            self.sampling_loop.run(stopped(stop_rx.clone())),
            server.serve(stopped(stop_rx)),
        );
        served
    }

    /// Run until Ctrl-C
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("agent.signal.fail {}", e);
            }
        })
        .await
    }
}
