// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator coordinator.
//!
//! The entry point that ties together:
//! - Batch records via [`crate::ledger::BatchLedger`]
//! - Database access via [`crate::dataaccess::DataUtils`]
//! - Table copy strategies via [`crate::copy::CopierRegistry`]
//!
//! # Architecture
//!
//! One call to [`Replicator::run`] is one agent run. It dispatches on the
//! configured role:
//! 1. Master: plan one batch, then publish schema changes, capture and upload
//! 2. Slave: plan a single batch or a consolidated group, then download,
//!    apply schema changes, consolidate, apply and sync history
//!
//! Runs are meant to be scheduled externally. A failed run leaves every
//! completed stage bit in place; the next run resumes from there.

mod master;
pub(crate) mod policy;
mod slave;
mod types;

pub use master::MasterOrchestrator;
pub use slave::SlaveOrchestrator;
pub use types::{RunSummary, SkippedTable};

use crate::config::ReplicatorConfig;
use crate::copy::CopierRegistry;
use crate::dataaccess::{DataUtils, NoOpDataUtils};
use crate::error::Result;
use crate::ledger::BatchLedger;
use crate::metrics;
use crate::stage::Role;
use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};

/// The replicator agent.
///
/// # Data Access Integration
///
/// The embedding application passes in its [`DataUtils`] implementation.
/// The replicator never talks to a database directly; it only decides
/// which batch to work on, which stages to run, and records progress in
/// the ledger.
pub struct Replicator<D: DataUtils = NoOpDataUtils> {
    config: ReplicatorConfig,
    ledger: Arc<dyn BatchLedger>,
    data: Arc<D>,
    copiers: CopierRegistry,
}

impl Replicator<NoOpDataUtils> {
    /// Create a replicator with the no-op data layer (dry runs, tests).
    pub fn new(config: ReplicatorConfig, ledger: Arc<dyn BatchLedger>) -> Self {
        Self::with_data_utils(config, ledger, Arc::new(NoOpDataUtils))
    }
}

impl<D: DataUtils> Replicator<D> {
    /// Create a replicator over a real data layer, with the default copiers.
    pub fn with_data_utils(config: ReplicatorConfig, ledger: Arc<dyn BatchLedger>, data: Arc<D>) -> Self {
        Self {
            config,
            ledger,
            data,
            copiers: CopierRegistry::with_defaults(),
        }
    }

    /// Replace the copy strategy registry.
    pub fn with_copiers(mut self, copiers: CopierRegistry) -> Self {
        self.copiers = copiers;
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Run one agent cycle against the local wall clock.
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_at(chrono::Local::now().time()).await
    }

    /// Run one agent cycle with an explicit time of day. The slave ignores it.
    pub async fn run_at(&self, now: NaiveTime) -> Result<RunSummary> {
        let role = self.config.role;
        let started = Instant::now();
        info!(role = %role, "Starting replicator run");

        let result = self
            .dispatch(now)
            .instrument(info_span!("replicator_run", role = %role))
            .await;

        metrics::record_run_duration(role, started.elapsed());
        metrics::record_run_outcome(role, result.is_ok());
        match &result {
            Ok(summary) => summary.log(),
            Err(e) => error!(role = %role, error = %e, retryable = e.is_retryable(), "Replicator run failed"),
        }
        result
    }

    async fn dispatch(&self, now: NaiveTime) -> Result<RunSummary> {
        let ledger = self.ledger.as_ref();
        let data = self.data.as_ref();
        match self.config.role {
            Role::Master => {
                MasterOrchestrator::new(ledger, data, &self.copiers, &self.config)?
                    .run(now)
                    .await
            }
            Role::Slave => {
                SlaveOrchestrator::new(ledger, data, &self.copiers, &self.config)?
                    .run()
                    .await
            }
        }
    }
}
