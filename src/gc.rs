//! Per-job garbage collection.

use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::executor::RemoteExecutor;

/// Remove a job's scheduler trace and spool artifacts.
///
/// Strictly best-effort: every failure is logged and swallowed, since gc
/// runs at least once per job and a dead cluster link must not wedge the
/// caller. The removal itself is detached on the remote side so slow
/// filesystems do not hold the session open.
pub async fn collect(
    config: &ClusterConfig,
    exec: &dyn RemoteExecutor,
    name: &str,
    number: i64,
    job_id: &str,
    cancel: bool,
) {
    if cancel {
        info!("cancelling job {name}:{number} ({job_id})");
        if let Err(e) = exec.execute(&format!("scancel -f {job_id}"), None).await {
            warn!("scancel for {job_id} failed: {e}");
        }
    }

    info!("garbage collecting job {name}:{number} ({job_id})");
    let cmd = format!(
        "/bin/sh -c \"nohup rm -Rf {output} {spool} >/dev/null 2>&1 &\"",
        output = config.job_output_path(name),
        spool = config.job_spool_dir(job_id),
    );
    if let Err(e) = exec.execute(&cmd, None).await {
        warn!("garbage collection for {job_id} failed: {e}");
    }
}
