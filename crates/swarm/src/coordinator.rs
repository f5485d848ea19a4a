//! Coordinator assembly.
//!
//! Builds every component with injectable collaborators (clock, repository,
//! catalogues) and wires them together: one event log, one projection, one
//! load index, one bus, one lock set, shared by the manager and both engines.
//! On construction any events already in the repository are replayed, so a
//! durable backend resumes exactly where it left off.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::bus::EventBus;
use crate::catalog::{
    ClaimantDirectory, InMemoryClaimantDirectory, InMemoryIssueCatalog, IssueCatalog,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CoordinatorConfig, SharedConfig};
use crate::domain::Claim;
use crate::errors::CoordResult;
use crate::event_log::EventLog;
use crate::events::EventRecord;
use crate::expiry::{ExpiryDriver, ExpiryHandle};
use crate::ids::IdGen;
use crate::load::LoadIndex;
use crate::locks::IssueLocks;
use crate::manager::ClaimManager;
use crate::rebalance::{RebalanceTimer, Rebalancer};
use crate::steal::StealEngine;
use crate::storage::{ClaimRepository, InMemoryRepository};
use crate::store::ClaimStore;
use crate::surface::ToolSurface;

/// Outcome of a consistency sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyReport {
    /// Whether the load index had to be healed from a recount
    pub load_healed: bool,
    /// Claim ids whose projection disagreed with replay (empty when sound)
    pub replay_mismatches: Vec<String>,
}

/// Builder for a [`Coordinator`] with injectable collaborators.
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: Option<CoordinatorConfig>,
    clock: Option<Arc<dyn Clock>>,
    repository: Option<Arc<dyn ClaimRepository>>,
    catalog: Option<Arc<dyn IssueCatalog>>,
    directory: Option<Arc<dyn ClaimantDirectory>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ClaimRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn IssueCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ClaimantDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Assemble the coordinator, replaying any events the repository holds.
    pub fn build(self) -> CoordResult<Coordinator> {
        let config = SharedConfig::new(self.config.unwrap_or_default());
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let repository: Arc<dyn ClaimRepository> = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRepository::new()));
        let catalog: Arc<dyn IssueCatalog> = self
            .catalog
            .unwrap_or_else(|| Arc::new(InMemoryIssueCatalog::new()));
        let directory: Arc<dyn ClaimantDirectory> = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryClaimantDirectory::new()));

        let ids = IdGen::new();
        let log = Arc::new(EventLog::new(repository.clone(), clock.clone(), ids)?);
        let store = Arc::new(ClaimStore::rebuild(repository.clone(), &log.all())?);
        let load = Arc::new(LoadIndex::new(config.clone(), directory.clone()));
        load.recount_from(&store.all());
        let bus = Arc::new(EventBus::new());
        let locks = Arc::new(IssueLocks::new());

        let manager = Arc::new(ClaimManager::new(
            store.clone(),
            log.clone(),
            load.clone(),
            bus.clone(),
            locks,
            clock.clone(),
            ids,
            config.clone(),
            catalog.clone(),
            directory.clone(),
        ));
        let steal = Arc::new(StealEngine::new(manager.clone()));
        let rebalancer = Arc::new(Rebalancer::new(manager.clone()));
        let surface = ToolSurface::new(
            manager.clone(),
            steal.clone(),
            rebalancer.clone(),
            config.clone(),
        );

        Ok(Coordinator {
            config,
            clock,
            repository,
            catalog,
            directory,
            log,
            store,
            load,
            bus,
            manager,
            steal,
            rebalancer,
            surface,
        })
    }
}

/// A fully wired coordinator instance.
pub struct Coordinator {
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn ClaimRepository>,
    catalog: Arc<dyn IssueCatalog>,
    directory: Arc<dyn ClaimantDirectory>,
    log: Arc<EventLog>,
    store: Arc<ClaimStore>,
    load: Arc<LoadIndex>,
    bus: Arc<EventBus>,
    manager: Arc<ClaimManager>,
    steal: Arc<StealEngine>,
    rebalancer: Arc<Rebalancer>,
    surface: ToolSurface,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    pub fn surface(&self) -> &ToolSurface {
        &self.surface
    }

    pub fn manager(&self) -> &Arc<ClaimManager> {
        &self.manager
    }

    pub fn steal_engine(&self) -> &Arc<StealEngine> {
        &self.steal
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn store(&self) -> &Arc<ClaimStore> {
        &self.store
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn load_index(&self) -> &Arc<LoadIndex> {
        &self.load
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn ClaimRepository> {
        &self.repository
    }

    pub fn catalog(&self) -> &Arc<dyn IssueCatalog> {
        &self.catalog
    }

    pub fn directory(&self) -> &Arc<dyn ClaimantDirectory> {
        &self.directory
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to every committed event.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        self.bus.subscribe()
    }

    /// Start the expiry scanner on its own thread.
    pub fn start_expiry_driver(&self, interval: Duration) -> ExpiryHandle {
        Arc::new(ExpiryDriver::new(self.manager.clone(), self.steal.clone())).spawn(interval)
    }

    /// One synchronous scanner pass, for embedders that drive time themselves.
    pub fn run_expiry_pass(&self) -> crate::expiry::ExpirySummary {
        ExpiryDriver::new(self.manager.clone(), self.steal.clone()).run_once()
    }

    /// Start the periodic rebalance trigger on its own thread.
    pub fn start_rebalance_timer(&self) -> RebalanceTimer {
        self.rebalancer.spawn_periodic()
    }

    /// Cross-check the derived state: recount the load index from the store
    /// and compare every claim against a replay of its event stream.
    pub fn verify_consistency(&self) -> ConsistencyReport {
        let claims = self.store.all();
        let load_healed = self.load.recount_from(&claims);

        let mut replay_mismatches = Vec::new();
        for claim in &claims {
            let records = self.log.stream(&claim.claim_id, None);
            match Claim::replay(&records) {
                Some(replayed) if replayed == *claim => {}
                _ => {
                    warn!(claim_id = %claim.claim_id, "projection diverged from replay");
                    replay_mismatches.push(claim.claim_id.clone());
                }
            }
        }
        ConsistencyReport {
            load_healed,
            replay_mismatches,
        }
    }
}


// Include property-based tests
#[cfg(test)]
#[path = "coordinator_proptests.rs"]
mod proptests;
