//! Bounded index compaction
//!
//! Several small merge steps instead of one unbounded optimize, yielding
//! between steps. Whatever is left when the step budget runs out is picked
//! up by the tier's next run.

use tracing::{debug, info, warn};

use super::history::CompactionSummary;
use crate::backend::SearchEngine;
use crate::config::CompactionConfig;
use crate::types::error::SyncError;
use crate::types::OptimizeOptions;

/// Summary of the steps taken, plus the error that cut the run short
#[derive(Debug)]
pub struct CompactionRun {
    pub summary: CompactionSummary,
    pub error: Option<SyncError>,
}

pub async fn compact(engine: &dyn SearchEngine, config: &CompactionConfig) -> CompactionRun {
    let options = OptimizeOptions {
        page_budget: config.page_budget,
        step_time_ms: config.step_time_ms,
        max_steps: 1,
    };
    let mut summary = CompactionSummary::default();

    for step in 0..config.max_steps {
        let report = match engine.optimize(options).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Compaction step {} failed: {}", step + 1, e);
                return CompactionRun {
                    summary,
                    error: Some(e),
                };
            }
        };

        summary.steps += report.steps.max(1);
        summary.total_changes += report.total_changes;
        summary.size_mb = report.size_mb;
        debug!(
            "Compaction step {}: {} changes, {:.1} MB",
            step + 1,
            report.total_changes,
            report.size_mb
        );

        if report.converged || report.total_changes <= config.negligible_changes {
            summary.converged = true;
            break;
        }
        tokio::task::yield_now().await;
    }

    if summary.converged {
        info!(
            "Index compaction converged after {} steps ({} changes)",
            summary.steps, summary.total_changes
        );
    } else {
        info!(
            "Index compaction paused after {} steps, resuming next run",
            summary.steps
        );
    }

    CompactionRun {
        summary,
        error: None,
    }
}
