//! Discovery engine: converges registry and pool on the cloud inventory
//!
//! Two reconciliation passes run on the cloud interval:
//! - cloud pass: cloud inventory -> registry (insert, refresh, evict after grace)
//! - pool pass: registry -> pool (start/stop sessions, announce upstream)
//!
//! A presence pass runs independently on its own interval and only logs
//! which pooled devices were seen on the LAN.

use chrono::{DateTime, Utc};
use fanlink_cloud::{CloudDevice, CloudInventory};
use fanlink_core::bus::{self, Upstream};
use fanlink_core::{Device, DeviceId, DeviceRegistry, IdDiff, ModelCatalog, RegistryRecord};
use fanlink_session::SessionFactory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::pool::{DevicePool, PoolEntry};
use crate::presence::{self, PresenceConfig};
use crate::DiscoveryError;

/// Shortest loop period accepted from configuration
const MIN_INTERVAL: Duration = Duration::from_secs(1);

fn ticker(period: Duration) -> tokio::time::Interval {
    if period < MIN_INTERVAL {
        warn!(period_ms = period.as_millis() as u64, "Interval too short, using 1s");
    }
    tokio::time::interval(period.max(MIN_INTERVAL))
}

/// Discovery engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upstream client id owning the device-manager topic
    pub client_id: String,
    pub id_prefix: String,
    pub cloud_interval: Duration,
    pub grace_period: Duration,
    pub presence_interval: Duration,
    pub presence: PresenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: "fanlink".to_string(),
            id_prefix: "dyson-".to_string(),
            cloud_interval: Duration::from_secs(600),
            grace_period: Duration::from_secs(86400),
            presence_interval: Duration::from_secs(240),
            presence: PresenceConfig::default(),
        }
    }
}

/// Outcome counters of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    /// Missing devices kept because their grace period is still running
    pub retained: usize,
    pub failed: usize,
}

pub struct DiscoveryEngine {
    config: EngineConfig,
    registry: DeviceRegistry,
    cloud: Arc<dyn CloudInventory>,
    upstream: Arc<dyn Upstream>,
    catalog: ModelCatalog,
    sessions: Arc<dyn SessionFactory>,
    pool: Arc<DevicePool>,
}

impl DiscoveryEngine {
    pub fn new(
        config: EngineConfig,
        registry: DeviceRegistry,
        cloud: Arc<dyn CloudInventory>,
        upstream: Arc<dyn Upstream>,
        catalog: ModelCatalog,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            cloud,
            upstream,
            catalog,
            sessions,
            pool: Arc::new(DevicePool::new()),
        }
    }

    pub fn pool(&self) -> Arc<DevicePool> {
        self.pool.clone()
    }

    fn device_topic(&self) -> String {
        bus::device_topic(&self.config.client_id)
    }

    fn device_type(&self, model: &str) -> Result<String, DiscoveryError> {
        self.catalog
            .device_type(model)
            .ok_or_else(|| DiscoveryError::UnsupportedModel(model.to_string()))
    }

    pub async fn reconcile_cloud(&self) -> Result<PassReport, DiscoveryError> {
        self.reconcile_cloud_at(Utc::now()).await
    }

    /// Bring the registry in line with the cloud inventory as of `now`
    pub async fn reconcile_cloud_at(&self, now: DateTime<Utc>) -> Result<PassReport, DiscoveryError> {
        info!("Refreshing registry from cloud inventory");
        let known: HashMap<DeviceId, RegistryRecord> = self
            .registry
            .read_all()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let listed: HashMap<DeviceId, CloudDevice> = self
            .cloud
            .list_devices()
            .await?
            .into_iter()
            .map(|d| (d.device_id(&self.config.id_prefix), d))
            .collect();

        let diff = IdDiff::between(known.keys(), listed.keys());
        let grace_secs = self.config.grace_period.as_secs() as i64;
        let mut report = PassReport::default();

        for id in &diff.new {
            info!(device = %id, "Adding registry record");
            let record = listed[id].to_record(&self.config.id_prefix, now);
            match self.registry.create(&record) {
                Ok(()) => report.added += 1,
                Err(e) => {
                    error!(device = %id, error = %e, "Adding registry record failed");
                    report.failed += 1;
                }
            }
        }

        for id in &diff.missing {
            let record = &known[id];
            if record.grace_expired(now, grace_secs) {
                info!(device = %id, "Removing registry record, grace period exceeded");
                match self.registry.delete(id) {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        error!(device = %id, error = %e, "Removing registry record failed");
                        report.failed += 1;
                    }
                }
            } else {
                info!(
                    device = %id,
                    remaining_secs = grace_secs - record.age_secs(now),
                    "Device missing from cloud, grace period running"
                );
                report.retained += 1;
            }
        }

        for id in &diff.existing {
            debug!(device = %id, "Refreshing registry record");
            let record = listed[id].to_record(&self.config.id_prefix, now);
            match self.registry.update(&record) {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    error!(device = %id, error = %e, "Updating registry record failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Bring the pool in line with the registry
    pub async fn reconcile_pool(&self) -> Result<PassReport, DiscoveryError> {
        let stored: HashMap<DeviceId, RegistryRecord> = self
            .registry
            .read_all()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let pooled = self.pool.ids().await;

        let diff = IdDiff::between(&pooled, stored.keys());
        let mut report = PassReport::default();

        for id in &diff.new {
            match self.add_device(&stored[id]).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    error!(device = %id, error = %e, "Adding device failed");
                    report.failed += 1;
                }
            }
        }

        for id in &diff.missing {
            match self.remove_device(id).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    error!(device = %id, error = %e, "Removing device failed");
                    report.failed += 1;
                }
            }
        }

        for id in &diff.existing {
            match self.update_device(&stored[id]).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(device = %id, error = %e, "Updating device failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn add_device(&self, record: &RegistryRecord) -> Result<(), DiscoveryError> {
        let capabilities = self
            .catalog
            .get(&record.model)
            .ok_or_else(|| DiscoveryError::UnsupportedModel(record.model.clone()))?;
        let device_type = self.device_type(&record.model)?;

        info!(device = %record.id, model = %record.model, "Adding device");
        let shared = Arc::new(RwLock::new(Device::from_record(record)));
        let session = self
            .sessions
            .start(shared.clone(), capabilities, device_type.clone())?;

        // Snapshot after start so a session that already came online is not
        // announced as offline
        let snapshot = shared.read().await.clone();
        if let Err(e) = self
            .upstream
            .publish(
                &self.device_topic(),
                bus::set_device_message(&snapshot, &device_type),
            )
            .await
        {
            session.stop();
            return Err(e.into());
        }

        self.pool
            .insert(
                record.id.clone(),
                PoolEntry {
                    device: shared,
                    session,
                },
            )
            .await;
        Ok(())
    }

    async fn remove_device(&self, id: &DeviceId) -> Result<(), DiscoveryError> {
        info!(device = %id, "Removing device");
        self.upstream
            .publish(&self.device_topic(), bus::delete_device_message(id))
            .await?;

        if let Some(entry) = self.pool.remove(id).await {
            entry.session.stop();
        }
        Ok(())
    }

    /// Apply name and credential changes; returns whether anything changed
    async fn update_device(&self, record: &RegistryRecord) -> Result<bool, DiscoveryError> {
        let shared = self
            .pool
            .device(&record.id)
            .await
            .ok_or_else(|| DiscoveryError::NotPooled(record.id.clone()))?;
        let mut changed = false;

        {
            let device = shared.read().await;
            if device.model_id != record.model {
                debug!(
                    device = %record.id,
                    pooled = %device.model_id,
                    stored = %record.model,
                    "Model differs from registry, keeping pooled model"
                );
            }
        }

        let renamed = {
            let mut device = shared.write().await;
            if device.name != record.name {
                let previous = std::mem::replace(&mut device.name, record.name.clone());
                Some((previous, device.clone()))
            } else {
                None
            }
        };

        if let Some((previous, snapshot)) = renamed {
            info!(device = %record.id, from = %previous, to = %record.name, "Renaming device");
            let device_type = self.device_type(&snapshot.model_id)?;
            if let Err(e) = self
                .upstream
                .publish(
                    &self.device_topic(),
                    bus::set_device_message(&snapshot, &device_type),
                )
                .await
            {
                shared.write().await.name = previous;
                return Err(e.into());
            }
            changed = true;
        }

        let mut device = shared.write().await;
        if device.local_credentials != record.local_credentials {
            debug!(device = %record.id, "Local credentials changed");
            device.local_credentials = record.local_credentials.clone();
            changed = true;
        }

        Ok(changed)
    }

    /// Announce every pooled device again, e.g. after the upstream reconnected
    pub async fn republish_all(&self) {
        for device in self.pool.snapshots().await {
            let device_type = match self.device_type(&device.model_id) {
                Ok(device_type) => device_type,
                Err(e) => {
                    warn!(device = %device.id, error = %e, "Skipping republish");
                    continue;
                }
            };
            if let Err(e) = self
                .upstream
                .publish(
                    &self.device_topic(),
                    bus::set_device_message(&device, &device_type),
                )
                .await
            {
                error!(device = %device.id, error = %e, "Republishing device failed");
            }
        }
    }

    /// One presence pass; returns the pooled devices seen on the network
    pub async fn presence_pass(&self) -> Result<Vec<(DeviceId, String)>, DiscoveryError> {
        let hits = presence::scan(&self.config.presence).await?;
        debug!(hosts = hits.len(), "Presence scan finished");

        let ids = self.pool.ids().await;
        let stopped = self.pool.stopped_ids().await;
        let matches = presence::match_devices(&ids, &self.config.id_prefix, &hits);
        for (id, hostname, hit) in &matches {
            if stopped.contains(id) {
                info!(device = %id, hostname = %hostname, ip = %hit.ip, port = hit.port, "Found device without session on network");
            } else {
                debug!(device = %id, hostname = %hostname, ip = %hit.ip, port = hit.port, "Found device on network");
            }
        }
        Ok(matches
            .into_iter()
            .map(|(id, hostname, _)| (id, hostname))
            .collect())
    }

    async fn cloud_cycle(&self) {
        match self.reconcile_cloud().await {
            Ok(report) => info!(
                added = report.added,
                removed = report.removed,
                updated = report.updated,
                retained = report.retained,
                failed = report.failed,
                "Registry refreshed"
            ),
            Err(e) => error!(error = %e, "Refreshing registry failed"),
        }
        self.pool_cycle().await;
    }

    async fn pool_cycle(&self) {
        match self.reconcile_pool().await {
            Ok(report) => debug!(
                added = report.added,
                removed = report.removed,
                updated = report.updated,
                failed = report.failed,
                "Pool refreshed"
            ),
            Err(e) => error!(error = %e, "Refreshing devices failed"),
        }
    }

    /// Reconciliation loop; returns after shutdown with every session stopped
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.cloud_interval.as_secs(),
            "Starting discovery"
        );
        self.pool_cycle().await;

        let mut ticker = ticker(self.config.cloud_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cloud_cycle().await,
                _ = shutdown.changed() => break,
            }
        }

        self.pool.stop_all().await;
        info!("Discovery stopped");
    }

    /// Presence loop, independent of the reconciliation passes
    pub async fn run_presence(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = ticker(self.config.presence_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.presence_pass().await {
                        error!(error = %e, "Presence scan failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
