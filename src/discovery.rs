//! Find IoTivity lights on the local network
//!
//! A cycle multicasts `GET /oic/res?rt=core.light` and turns every reply into
//! a [`DeviceRecord`]. Replies are independent of each other: a malformed one
//! is logged and dropped without affecting the rest of the cycle.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::DiscoveryConfig,
    datatypes::DeviceRecord,
    error::Result,
    protocol::{DefaultProtocol, Protocol},
    scheduler::{Cancellation, Scheduler, TaskHandle},
};

/// Receives discovery results on behalf of the host
pub trait DiscoveryListener: Send + Sync {
    fn device_found(&self, record: &DeviceRecord);

    /// A device was not seen again by a later scan
    fn device_removed(&self, record: &DeviceRecord) {
        let _ = record;
    }
}

impl<F> DiscoveryListener for F
where
    F: Fn(&DeviceRecord) + Send + Sync,
{
    fn device_found(&self, record: &DeviceRecord) {
        self(record)
    }
}

struct Sighting {
    record: DeviceRecord,
    seen: Instant,
}

pub struct Discovery {
    protocol: Arc<dyn Protocol>,
    listener: Arc<dyn DiscoveryListener>,
    config: DiscoveryConfig,
    known: Mutex<HashMap<String, Sighting>>,
    last_scan: Mutex<Option<Instant>>,
    background: Mutex<Option<TaskHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, listener: Arc<dyn DiscoveryListener>) -> Self {
        Self::with_protocol(config, listener, Arc::new(DefaultProtocol::new()))
    }

    pub fn with_protocol(
        config: DiscoveryConfig,
        listener: Arc<dyn DiscoveryListener>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self {
            protocol,
            listener,
            config,
            known: Mutex::new(HashMap::new()),
            last_scan: Mutex::new(None),
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Multicast once and report every usable reply
    pub fn run_discovery_cycle(&self) -> Vec<DeviceRecord> {
        let target = self.config.target();
        let replies = match self.protocol.multicast(&target, self.config.window()) {
            Ok(replies) => replies,
            Err(err) => {
                warn!("Discovery request to {} failed: {}", target, err);
                return vec![];
            }
        };

        let mut found: Vec<DeviceRecord> = vec![];
        for reply in replies {
            debug!(
                "Discovery reply from {}: {}",
                reply.source,
                String::from_utf8_lossy(&reply.payload)
            );
            match DeviceRecord::from_reply(reply.source, &reply.payload) {
                Ok(record) if found.contains(&record) => {
                    debug!("Duplicate reply for {}", record.uri);
                }
                Ok(record) => found.push(record),
                Err(err) => warn!("Dropping discovery reply from {}: {}", reply.source, err),
            }
        }

        for record in &found {
            self.remember(record);
            self.listener.device_found(record);
        }
        found
    }

    fn remember(&self, record: &DeviceRecord) {
        let previous = lock(&self.known).insert(
            record.id.clone(),
            Sighting {
                record: record.clone(),
                seen: Instant::now(),
            },
        );
        if previous.is_none() {
            info!("Found {} at {}", record.id, record.uri);
        }
    }

    /// One cycle, then drop every device it did not see again
    pub fn scan_once(&self) -> Vec<DeviceRecord> {
        let started = Instant::now();
        *lock(&self.last_scan) = Some(started);

        let found = self.run_discovery_cycle();
        self.remove_older_results(started);
        found
    }

    fn remove_older_results(&self, timestamp: Instant) {
        let removed: Vec<DeviceRecord> = {
            let mut known = lock(&self.known);
            let stale: Vec<String> = known
                .iter()
                .filter(|(_, sighting)| sighting.seen < timestamp)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| known.remove(&id))
                .map(|sighting| sighting.record)
                .collect()
        };

        for record in &removed {
            info!("Removing {} at {}, it was not seen again", record.id, record.uri);
            self.listener.device_removed(record);
        }
    }

    /// Start time of the most recent [`scan_once`](Self::scan_once)
    pub fn timestamp_of_last_scan(&self) -> Option<Instant> {
        *lock(&self.last_scan)
    }

    /// Devices reported and not removed since
    pub fn known_devices(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = lock(&self.known)
            .values()
            .map(|sighting| sighting.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Repeat the discovery cycle on `scheduler` until stopped
    pub fn start_background_discovery(
        self: &Arc<Self>,
        scheduler: &dyn Scheduler,
    ) -> Result<TaskHandle> {
        let mut background = lock(&self.background);
        if let Some(handle) = background.as_ref().filter(|h| !h.is_cancelled()) {
            debug!("Background discovery already running");
            return Ok(handle.clone());
        }

        let discovery = Arc::clone(self);
        let handle = scheduler.schedule_with_fixed_delay(
            Duration::from_secs(0),
            self.config.interval(),
            Box::new(move || {
                let _ = discovery.run_discovery_cycle();
            }),
        )?;
        *background = Some(handle.clone());
        Ok(handle)
    }

    pub fn stop_background_discovery(&self) -> Option<Cancellation> {
        lock(&self.background).take().map(|handle| handle.cancel())
    }
}

/// Run a single discovery cycle with default settings
pub fn discover() -> Vec<DeviceRecord> {
    let listener = |_: &DeviceRecord| {};
    Discovery::new(DiscoveryConfig::default(), Arc::new(listener)).run_discovery_cycle()
}
