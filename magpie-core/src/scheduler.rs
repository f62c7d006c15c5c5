//! The forever loop driving the agent.
//!
//! Each tick: make sure the device is authorized, run the mod's collection
//! sweep (file index + rule pipeline + upload-request handling), then drive
//! every record cache through its state machine and report the heartbeat.
//! Ctrl-C ends the loop at the next boundary; background workers watch the
//! shared stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::api::{build_client, PlatformClient};
use crate::auth::{ApiClientState, AuthOutcome, Registrar};
use crate::codes::EventCodeManager;
use crate::collector::Collector;
use crate::error::{AgentError, Result};
use crate::mods::{resolve_mod_name, AgentMod, ModInit, ModRegistry};
use crate::model::save_json;
use crate::netmeter::NetworkMeter;
use crate::paths::AgentPaths;
use magpie_config::AppConfig;

pub struct Scheduler {
    conf: AppConfig,
    paths: AgentPaths,
    meter: Arc<NetworkMeter>,
    agent_version: String,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state_dir", &self.paths.state_dir)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(conf: AppConfig, paths: AgentPaths, agent_version: String) -> Self {
        Self {
            conf,
            paths,
            meter: NetworkMeter::new(),
            agent_version,
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        {
            let stop = Arc::clone(&stop);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutting down gracefully");
                    stop.store(true, Ordering::SeqCst);
                    shutdown.notify_waiters();
                }
            });
        }

        let client = build_client(&self.conf.api, &self.paths, Arc::clone(&self.meter))?;
        let registry = ModRegistry::builtin();
        let mod_name = resolve_mod_name(&self.conf.api.server_url, &self.conf.mod_.name);
        tracing::info!(mod_name = %mod_name, "using mod for collector");
        let mut agent_mod: Option<Arc<dyn AgentMod>> = None;

        while !stop.load(Ordering::SeqCst) {
            match self
                .tick(&client, &registry, &mod_name, &mut agent_mod, &stop, &shutdown)
                .await
            {
                Ok(()) => {}
                Err(AgentError::DeviceNotFound(err)) => {
                    tracing::warn!(error = %err, "no device found, waiting for next scan");
                }
                Err(AgentError::Unauthorized) => {
                    tracing::error!("unauthorized, clearing stored token");
                    let mut state = ApiClientState::load(&self.paths);
                    state.authorized_device(0, String::new());
                    if let Err(err) = state.save(&self.paths) {
                        tracing::error!(error = %err, "failed to clear token");
                    }
                    client.reload_auth();
                }
                Err(err) => {
                    tracing::error!(error = %err, "an error occurred when running collector");
                }
            }

            let sleep = tokio::time::sleep(Duration::from_secs(
                self.conf.collector.scan_interval_in_secs,
            ));
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.notified() => break,
            }
        }

        stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tick(
        &self,
        client: &Arc<dyn PlatformClient>,
        registry: &ModRegistry,
        mod_name: &str,
        agent_mod: &mut Option<Arc<dyn AgentMod>>,
        stop: &Arc<AtomicBool>,
        shutdown: &Arc<Notify>,
    ) -> Result<()> {
        if agent_mod.is_none() {
            let init = ModInit {
                client: Arc::clone(client),
                conf: self.conf.mod_.conf.clone(),
                paths: self.paths.clone(),
                handle: tokio::runtime::Handle::current(),
                stop: Arc::clone(stop),
            };
            *agent_mod = Some(registry.build(mod_name, init)?);
        }
        let agent_mod = agent_mod.as_ref().expect("mod constructed above");

        // 1. device identity + authorization
        let raw_device = agent_mod.get_device()?;
        save_json(&self.paths.raw_device_state(), &raw_device)?;

        let registrar = Registrar::new(Arc::clone(client), self.paths.clone());
        loop {
            match registrar.register_and_authorize(&raw_device).await? {
                AuthOutcome::Authorized => {
                    client.reload_auth();
                    if let Err(err) = registrar.setup_agent_version(&self.agent_version).await {
                        tracing::warn!(error = %err, "failed to update version tag");
                    }
                    if let Err(err) = registrar.setup_virmesh_info().await {
                        tracing::warn!(error = %err, "failed to update virmesh tag");
                    }
                    break;
                }
                outcome => {
                    tracing::info!(?outcome, "device not authorized yet");
                    if stop.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    let sleep = tokio::time::sleep(Duration::from_secs(
                        self.conf.device_register.interval_in_secs,
                    ));
                    tokio::select! {
                        _ = sleep => {}
                        _ = shutdown.notified() => return Ok(()),
                    }
                }
            }
        }

        // 2. collection sweep
        agent_mod.run().await?;

        // 3. record state machines + heartbeat
        let code_mgr = EventCodeManager::load(
            self.conf.event_code.clone(),
            client.as_ref(),
            &self.paths,
            |value| agent_mod.convert_code(value),
        )
        .await;
        let collector = Collector::new(
            self.conf.collector.clone(),
            Arc::clone(client),
            Arc::new(code_mgr),
            self.paths.clone(),
            Arc::clone(&self.meter),
            self.agent_version.clone(),
        );
        collector.run().await?;
        Ok(())
    }
}
