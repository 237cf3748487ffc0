//! Start, stop, status and cleanup of configured servers.
//!
//! This module contains [`Lifecycle`], the only writer of the state snapshot.
//! Each operation loads the snapshot, reconciles it against live processes,
//! and writes it back while holding the store's lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DevPaths, ServerDefinition, ServersConfig};
use crate::error::{DevError, Result};
use crate::events::{Event, ProcessSignal};
use crate::health::{HealthChecker, HealthSettings};
use crate::output::{OutputCapture, DEFAULT_CAPTURE_LINES};
use crate::ports::{
    resolve_effective_port, AnnouncementPattern, PortPlan, PortProbe, PortSource,
};
use crate::process::Supervisor;
use crate::state::{RecordStatus, RuntimeRecord, StateMap, StateStore};

/// Tunables for `start`.
#[derive(Debug, Clone)]
pub struct StartSettings {
    /// Time a freshly spawned server gets before its port is detected.
    pub startup_grace: Duration,
    pub health: HealthSettings,
    pub announcement: AnnouncementPattern,
    pub capture_lines: usize,
}

impl StartSettings {
    pub fn new(announcement: AnnouncementPattern) -> Self {
        Self {
            startup_grace: Duration::from_secs(3),
            health: HealthSettings::default(),
            announcement,
            capture_lines: DEFAULT_CAPTURE_LINES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A live process is already recorded for the server; nothing was done.
    AlreadyRunning { name: String, record: RuntimeRecord },
    Started {
        name: String,
        record: RuntimeRecord,
        port_source: PortSource,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { name: String, record: RuntimeRecord },
    /// The record pointed at a process that was already gone.
    AlreadyDead { name: String, record: RuntimeRecord },
    NotRunning { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub name: String,
    pub record: RuntimeRecord,
    pub alive: bool,
}

/// Orchestrates the supervisor, port resolver, health checker and state store.
pub struct Lifecycle {
    paths: DevPaths,
    store: StateStore,
    supervisor: Arc<dyn Supervisor>,
    ports: Arc<dyn PortProbe>,
    health: HealthChecker,
    settings: StartSettings,
    event_tx: Option<mpsc::Sender<Event>>,
}

impl Lifecycle {
    pub fn new(
        paths: DevPaths,
        supervisor: Arc<dyn Supervisor>,
        ports: Arc<dyn PortProbe>,
        settings: StartSettings,
    ) -> Self {
        let store = StateStore::new(paths.state_file());
        let health = HealthChecker::new(settings.health);
        Self {
            paths,
            store,
            supervisor,
            ports,
            health,
            settings,
            event_tx: None,
        }
    }

    /// Routes progress events to `event_tx`.
    pub fn with_events(mut self, event_tx: mpsc::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn paths(&self) -> &DevPaths {
        &self.paths
    }

    async fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Launches `name` unless a live instance is already recorded.
    ///
    /// A server that never answers its health check is terminated again; the
    /// whole start is not retried.
    pub async fn start(&self, servers: &ServersConfig, name: &str) -> Result<StartOutcome> {
        let server = servers.get(name)?;
        let _lock = self.store.lock().await?;
        let mut records = self.store.load()?;

        if let Some(record) = records.get(name) {
            if self.supervisor.is_alive(record.pid) {
                info!(name, pid = record.pid, "already running");
                return Ok(StartOutcome::AlreadyRunning {
                    name: name.to_string(),
                    record: record.clone(),
                });
            }
            let pid = record.pid;
            records.remove(name);
            self.store.save(&records)?;
            self.emit(Event::StaleRecordDropped {
                name: name.to_string(),
                pid,
            })
            .await;
        }

        let plan = PortPlan::for_server(server, self.ports.as_ref())?;
        let command = server.render_command(plan.port(), name);
        self.paths.ensure_log_dir()?;
        self.emit(Event::Starting {
            name: name.to_string(),
            command: command.clone(),
        })
        .await;

        let pid = self.supervisor.spawn(&command, self.paths.root())?;
        self.emit(Event::Spawned {
            name: name.to_string(),
            pid,
        })
        .await;

        match self.bring_up(server, name, pid, plan, &mut records).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(name, pid, error = %err, "start failed");
                self.supervisor.terminate(pid, ProcessSignal::SigTerm);
                records.remove(name);
                self.store.save(&records)?;
                Err(err)
            }
        }
    }

    // Everything after spawn; any error here leaves `pid` for the caller to tear down.
    async fn bring_up(
        &self,
        server: &ServerDefinition,
        name: &str,
        pid: u32,
        plan: PortPlan,
        records: &mut StateMap,
    ) -> Result<StartOutcome> {
        records.insert(name.to_string(), RuntimeRecord::starting(pid, plan.port()));
        self.store.save(records)?;

        tokio::time::sleep(self.settings.startup_grace).await;
        if !self.supervisor.is_alive(pid) {
            return Err(DevError::ExitedDuringStartup {
                name: name.to_string(),
                pid,
            });
        }

        let output =
            OutputCapture::from_log_file(&self.paths.log_file(name), self.settings.capture_lines);
        if output.is_empty() {
            debug!(name, "no startup output captured");
        } else {
            debug!(name, lines = output.len(), "captured startup output");
        }
        let resolved = resolve_effective_port(
            pid,
            plan,
            &output,
            self.ports.as_ref(),
            &self.settings.announcement,
        );
        debug!(name, port = resolved.port, source = ?resolved.source, "resolved port");
        self.emit(Event::PortResolved {
            name: name.to_string(),
            resolved,
        })
        .await;

        let url = server.render_health_url(resolved.port, name);
        self.emit(Event::HealthChecking {
            name: name.to_string(),
            url: url.clone(),
        })
        .await;
        if !self.health.check(&url).await {
            self.emit(Event::Terminating {
                name: name.to_string(),
                pid,
            })
            .await;
            return Err(DevError::HealthCheckFailed {
                name: name.to_string(),
                url,
            });
        }

        let record = match records.get_mut(name) {
            Some(record) => {
                record.port = resolved.port;
                record.status = RecordStatus::Healthy;
                record.clone()
            }
            None => RuntimeRecord {
                status: RecordStatus::Healthy,
                ..RuntimeRecord::starting(pid, resolved.port)
            },
        };
        records.insert(name.to_string(), record.clone());
        self.store.save(records)?;
        info!(name, pid, port = record.port, "started");

        Ok(StartOutcome::Started {
            name: name.to_string(),
            record,
            port_source: resolved.source,
        })
    }

    /// Stops `name`, or every recorded server when `name` is `None`.
    ///
    /// Records are removed whether or not their process was still alive.
    /// Termination is fire-and-forget; exit is not awaited.
    pub async fn stop(&self, name: Option<&str>) -> Result<Vec<StopOutcome>> {
        let _lock = self.store.lock().await?;
        let mut records = self.store.load()?;
        let targets: Vec<String> = match name {
            Some(name) => vec![name.to_string()],
            None => records.keys().cloned().collect(),
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(record) = records.remove(&target) else {
                outcomes.push(StopOutcome::NotRunning { name: target });
                continue;
            };
            if self.supervisor.is_alive(record.pid) {
                self.supervisor.terminate(record.pid, ProcessSignal::SigTerm);
                outcomes.push(StopOutcome::Stopped {
                    name: target,
                    record,
                });
            } else {
                outcomes.push(StopOutcome::AlreadyDead {
                    name: target,
                    record,
                });
            }
        }

        self.store.save(&records)?;
        Ok(outcomes)
    }

    /// Lists every recorded server with its liveness; dead ones are pruned.
    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let _lock = self.store.lock().await?;
        let records = self.store.load()?;
        let entries = self.sweep(&records);
        if entries.iter().any(|entry| !entry.alive) {
            let live: StateMap = entries
                .iter()
                .filter(|entry| entry.alive)
                .map(|entry| (entry.name.clone(), entry.record.clone()))
                .collect();
            debug!(
                path = %self.store.path().display(),
                pruned = entries.len() - live.len(),
                "pruning dead records"
            );
            self.store.save(&live)?;
        }
        Ok(entries)
    }

    /// Removes stale records and returns them; live records are untouched.
    pub async fn cleanup(&self) -> Result<Vec<StatusEntry>> {
        Ok(self
            .status()
            .await?
            .into_iter()
            .filter(|entry| !entry.alive)
            .collect())
    }

    /// Live records, without rewriting the snapshot.
    pub fn running(&self) -> Result<Vec<(String, RuntimeRecord)>> {
        let records = self.store.load()?;
        Ok(self
            .sweep(&records)
            .into_iter()
            .filter(|entry| entry.alive)
            .map(|entry| (entry.name, entry.record))
            .collect())
    }

    /// Drops the record for `name` if it still points at `pid`.
    pub async fn forget(&self, name: &str, pid: u32) -> Result<()> {
        let _lock = self.store.lock().await?;
        let mut records = self.store.load()?;
        if records.get(name).is_some_and(|record| record.pid == pid) {
            records.remove(name);
            self.store.save(&records)?;
        }
        Ok(())
    }

    fn sweep(&self, records: &StateMap) -> Vec<StatusEntry> {
        records
            .iter()
            .map(|(name, record)| StatusEntry {
                name: name.clone(),
                record: record.clone(),
                alive: self.supervisor.is_alive(record.pid),
            })
            .collect()
    }
}
