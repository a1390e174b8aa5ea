//! Slave agent run: plan the unit of work, then hand it to the
//! [`ConsolidationEngine`](crate::consolidation::ConsolidationEngine).

use super::types::RunSummary;
use crate::config::ReplicatorConfig;
use crate::consolidation::ConsolidationEngine;
use crate::copy::CopierRegistry;
use crate::dataaccess::DataUtils;
use crate::error::{ReplicationError, Result};
use crate::ledger::BatchLedger;
use crate::planner::{SlavePlan, SlavePlanner};
use crate::stage::Role;
use tracing::info;

pub struct SlaveOrchestrator<'a> {
    ledger: &'a dyn BatchLedger,
    engine: ConsolidationEngine<'a>,
    config: &'a ReplicatorConfig,
}

impl<'a> SlaveOrchestrator<'a> {
    pub fn new(
        ledger: &'a dyn BatchLedger,
        data: &'a dyn DataUtils,
        copiers: &'a CopierRegistry,
        config: &'a ReplicatorConfig,
    ) -> Result<Self> {
        if config.role != Role::Slave {
            return Err(ReplicationError::InvalidState {
                expected: Role::Slave.to_string(),
                actual: config.role.to_string(),
            });
        }
        Ok(Self {
            ledger,
            engine: ConsolidationEngine::new(ledger, data, copiers, config)?,
            config,
        })
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Role::Slave);
        let slave = self.config.slave_config()?;

        let plan = SlavePlanner::new(self.ledger, slave).plan().await?;
        summary.path = plan.path();
        if plan == SlavePlan::NoWork {
            info!(slave = %slave.slave_identifier, "No work for this slave");
            return Ok(summary);
        }

        summary.ctids = plan.batches().iter().map(|b| b.ctid).collect();
        self.engine.run(plan.batches(), &mut summary).await?;
        Ok(summary)
    }
}
