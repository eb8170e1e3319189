//! Cycle orchestration. One `WheelEngine` owns the pipeline, the executor
//! and the opportunity store, and runs the three externally-triggered
//! cycles: scan (discover and persist), run (consume and submit), monitor
//! (close winners early). All decision inputs come from the broker or the
//! store; nothing is carried in memory between cycles.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

use crate::broker::{Broker, BrokerError, DataFeed};
use crate::config::StrategyConfig;
use crate::context::CycleContext;
use crate::executor::OrderExecutor;
use crate::metrics;
use crate::persistence::blob_store::{BlobStore, StoreError};
use crate::persistence::opportunity_store::OpportunityStore;
use crate::pipeline::PipelineEngine;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub scan_time: DateTime<Utc>,
    pub put_opportunities: usize,
    pub call_opportunities: usize,
    pub total_opportunities: usize,
    pub duration_seconds: f64,
    pub stored_for_execution: bool,
    pub blob_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub opportunities_evaluated: usize,
    pub trades_executed: usize,
    pub trades_failed: usize,
    pub duration_seconds: f64,
    #[serde(with = "rust_decimal::serde::float")]
    pub buying_power_start: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub buying_power_end: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorResponse {
    pub positions_evaluated: usize,
    pub positions_closed: usize,
    pub errors: usize,
    pub duration_seconds: f64,
}

pub struct WheelEngine {
    pipeline: Arc<PipelineEngine>,
    executor: OrderExecutor,
    store: OpportunityStore,
    cfg: StrategyConfig,
    ctx: CycleContext,
}

impl WheelEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        cfg: StrategyConfig,
        feed: DataFeed,
        ctx: CycleContext,
    ) -> Self {
        let pipeline = Arc::new(PipelineEngine::new(
            broker.clone(),
            cfg.clone(),
            feed,
            ctx.clone(),
        ));
        let executor = OrderExecutor::new(broker, pipeline.clone(), ctx.clone(), feed);
        Self {
            pipeline,
            executor,
            store: OpportunityStore::new(blobs),
            cfg,
            ctx,
        }
    }

    fn max_age(&self) -> Duration {
        Duration::minutes(self.cfg.opportunity_max_age_minutes)
    }

    /// SCAN: stages 1, 2, 3, 7 over the universe, then persist the ranked
    /// artifact. A storage failure is reported in the response, never as
    /// an error. The market data work already happened.
    pub async fn scan(&self) -> ScanResponse {
        let started = Instant::now();
        let scan_time = self.ctx.time.now();
        info!(universe = self.cfg.universe.len(), "scan cycle started");

        let summary = self.pipeline.run_scan().await;
        let put_opportunities = summary.put_count();
        let call_opportunities = summary.call_count();
        let total = summary.opportunities.len();

        let (stored, blob_path) = if summary.opportunities.is_empty() {
            (false, String::new())
        } else {
            match self
                .store
                .persist(scan_time, self.max_age(), summary.opportunities)
            {
                Ok(path) => (true, path),
                Err(e) => {
                    error!(error = %e, "artifact persist failed, scan results dropped");
                    (false, String::new())
                }
            }
        };

        info!(
            total,
            put_opportunities,
            call_opportunities,
            stored_for_execution = stored,
            "scan cycle finished"
        );

        let duration_seconds = started.elapsed().as_secs_f64();
        metrics::observe_cycle_duration("scan", duration_seconds);

        ScanResponse {
            scan_time,
            put_opportunities,
            call_opportunities,
            total_opportunities: total,
            duration_seconds,
            stored_for_execution: stored,
            blob_path,
        }
    }

    /// RUN: consume the newest valid artifact through stages 4-9. With no
    /// valid artifact the cycle completes with zero counts and touches the
    /// broker not at all.
    pub async fn run(&self) -> Result<RunResponse, CycleError> {
        let started = Instant::now();
        let now = self.ctx.time.now();

        let Some((artifact, blob_path)) = self.store.retrieve_latest_valid(now, self.max_age())?
        else {
            info!("no valid scan artifact, nothing to execute");
            return Ok(RunResponse {
                opportunities_evaluated: 0,
                trades_executed: 0,
                trades_failed: 0,
                duration_seconds: started.elapsed().as_secs_f64(),
                buying_power_start: Decimal::ZERO,
                buying_power_end: Decimal::ZERO,
            });
        };

        info!(
            blob_path = %blob_path,
            opportunities = artifact.opportunities.len(),
            "execute cycle started"
        );

        let report = self.executor.execute_batch(&artifact.opportunities).await?;

        // The artifact is consumed either way; a failed status flip is
        // logged only, since the orders are already at the broker.
        if let Err(e) = self.store.mark_executed(&blob_path) {
            error!(blob_path = %blob_path, error = %e, "failed to mark artifact executed");
        }

        info!(
            trades_executed = report.trades_executed,
            trades_failed = report.trades_failed,
            "execute cycle finished"
        );

        let duration_seconds = started.elapsed().as_secs_f64();
        metrics::observe_cycle_duration("run", duration_seconds);

        Ok(RunResponse {
            opportunities_evaluated: report.opportunities_evaluated,
            trades_executed: report.trades_executed,
            trades_failed: report.trades_failed,
            duration_seconds,
            buying_power_start: report.buying_power_start,
            buying_power_end: report.buying_power_end,
        })
    }

    /// MONITOR: close short options that hit the profit target.
    pub async fn monitor(&self) -> MonitorResponse {
        let started = Instant::now();
        let report = self.executor.run_monitor().await;

        info!(
            positions_evaluated = report.positions_evaluated,
            positions_closed = report.positions_closed,
            errors = report.errors,
            "monitor cycle finished"
        );

        let duration_seconds = started.elapsed().as_secs_f64();
        metrics::observe_cycle_duration("monitor", duration_seconds);

        MonitorResponse {
            positions_evaluated: report.positions_evaluated,
            positions_closed: report.positions_closed,
            errors: report.errors,
            duration_seconds,
        }
    }
}
