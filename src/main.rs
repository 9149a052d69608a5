use anyhow::Result;
use chrono::Utc;
use log::{error, info};
use rayon::ThreadPoolBuilder;

use evcharge_planner::errors::OrchestratorError;
use evcharge_planner::gateway::Gateway;
use evcharge_planner::initialization::init;
use evcharge_planner::orchestrator;

/// One-shot housekeeping sweep: replans every vehicle on every known
/// account, then mails a report. Non-fatal per-vehicle failures are
/// collected rather than aborting the sweep, matching the orchestrator's
/// own partial-failure contract.
fn main() -> Result<()> {
    ThreadPoolBuilder::new().num_threads(2).build_global()?;

    // Load config and set up the gateway and mail notifier. If initialization fails
    // we are pretty much out of luck and can't even log or send notification mail.
    let (_config, mgr) = init()?;

    let now = Utc::now();
    let account_ids = mgr.gateway.list_account_ids()?;

    let mut failures: Vec<String> = Vec::new();
    let mut swept = 0usize;

    for account_id in account_ids {
        match orchestrator::refresh_account(mgr.gateway.as_ref(), account_id, now) {
            Ok(outcomes) => {
                for (vehicle_id, err) in outcomes {
                    swept += 1;
                    if let Some(e) = err {
                        failures.push(format!("vehicle {vehicle_id}: {e}"));
                    }
                }
            }
            Err(e) => {
                error!("sweep of account {account_id} failed: {e}");
                failures.push(format!("account {account_id}: {e}"));
            }
        }
    }

    info!("sweep complete: {swept} vehicles checked, {} failures", failures.len());

    if failures.is_empty() {
        mgr.mail.send_mail("Report".into(), format!("Swept {swept} vehicles, no failures"))?;
        Ok(())
    } else {
        let body = format!("Swept {swept} vehicles, {} failures:\n{}", failures.len(), failures.join("\n"));
        mgr.mail.send_mail("Error in charge planner sweep".into(), body.clone())?;
        Err(OrchestratorError::from(body.as_str()))?
    }
}
