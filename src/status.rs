//! Job state translation.
//!
//! Slurm exposes job state two ways: `squeue` is fast but drops jobs
//! shortly after they end, `sacct` is slow but durable. The translator
//! tries an ordered list of views and normalizes whatever it finds into
//! a small fixed vocabulary of outcomes and an `HH:MM:SS` elapsed time.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::executor::RemoteExecutor;

/// Job name prefix marking jobs this connector submitted.
pub const JOB_NAME_PREFIX: &str = "jarvice_";

/// squeue state filter for running jobs.
pub const RUNNING_STATES: &str = "R,RH,RS,SI,ST,S,CG,SO";
/// squeue state filter for queued jobs.
pub const QUEUED_STATES: &str = "PD,RD,RF";

/// How a job left (or failed to leave) the scheduler.
///
/// `UnknownTerminal` and `Vanished` both surface exit code −9 today but
/// are kept distinct: one is an observed state outside the recognized
/// vocabulary, the other is a total observation gap: the job's trace
/// disappeared before either view could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Successful completion.
    Completed,
    /// Completed with error (failed, node failure, out of memory).
    Failed,
    /// Explicitly terminated (canceled, preempted, deadline).
    Canceled,
    /// Terminal, but in a state we do not recognize.
    UnknownTerminal(String),
    /// Absent from both the live queue and the accounting view.
    Vanished,
}

impl ExitDisposition {
    /// Exit code in upstream's vocabulary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitDisposition::Completed => 0,
            ExitDisposition::Failed => 1,
            ExitDisposition::Canceled => -15,
            ExitDisposition::UnknownTerminal(_) | ExitDisposition::Vanished => -9,
        }
    }

    /// Map a compact squeue state code.
    pub fn from_squeue_code(code: &str) -> Self {
        match code {
            "F" | "NF" | "OOM" => ExitDisposition::Failed,
            "DL" | "PR" | "CA" => ExitDisposition::Canceled,
            "CD" => ExitDisposition::Completed,
            other => ExitDisposition::UnknownTerminal(other.to_string()),
        }
    }

    /// Map a long-form sacct state word.
    pub fn from_sacct_state(state: &str) -> Self {
        match state {
            "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" => ExitDisposition::Failed,
            "DEADLINE" | "PREEMPTED" | "CANCELLED" => ExitDisposition::Canceled,
            "COMPLETED" => ExitDisposition::Completed,
            other => ExitDisposition::UnknownTerminal(other.to_string()),
        }
    }
}

/// Normalize an elapsed time into zero-padded `HH:MM:SS`.
///
/// Accepts `mm:ss`, `hh:mm:ss` and `dd-hh:mm:ss`, folding days into
/// hours. Total over its input domain and idempotent over its output.
pub fn normalize_elapsed(raw: &str) -> AdapterResult<String> {
    let bad = || AdapterError::ElapsedFormat(raw.to_string());

    let (days, clock) = match raw.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| bad())?, clock),
        None => (0, raw),
    };

    let fields: Vec<u64> = clock
        .split(':')
        .map(|f| f.parse().map_err(|_| bad()))
        .collect::<AdapterResult<_>>()?;

    let (hours, mins, secs) = match fields.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return Err(bad()),
    };

    Ok(format!("{:02}:{:02}:{:02}", hours + days * 24, mins, secs))
}

/// What a state view observed about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProbe {
    /// Native state as reported (`CD`, `COMPLETED`, ...).
    pub state: String,
    pub disposition: ExitDisposition,
    /// Normalized elapsed time.
    pub elapsed: String,
    /// Allocated nodes, when the view knows them.
    pub nodes: Vec<String>,
}

/// One way of asking the scheduler about a job. Views are tried in
/// order; a view that cannot see the job answers `None`.
#[async_trait]
pub trait StateView: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(
        &self,
        exec: &dyn RemoteExecutor,
        job_id: &str,
    ) -> AdapterResult<Option<JobProbe>>;
}

/// Fast, ephemeral live-queue view (`squeue`).
pub struct SqueueView {
    pub user: Option<String>,
}

#[async_trait]
impl StateView for SqueueView {
    fn name(&self) -> &'static str {
        "squeue"
    }

    async fn probe(
        &self,
        exec: &dyn RemoteExecutor,
        job_id: &str,
    ) -> AdapterResult<Option<JobProbe>> {
        let mut cmd = format!("squeue --noheader -o \"%t|%M|%N\" -j {job_id} -t all");
        if let Some(user) = &self.user {
            cmd.push_str(&format!(" -u \"{user}\""));
        }
        let output = exec.execute(&cmd, None).await?;

        let Some(line) = output.stdout.lines().next() else {
            return Ok(None);
        };
        let parts: Vec<&str> = line.split('|').collect();
        let [state, elapsed, nodes] = parts.as_slice() else {
            warn!("failed to fetch job info for {job_id}");
            return Ok(None);
        };

        let elapsed = match normalize_elapsed(elapsed) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!("failed to fetch job info for {job_id}: {e}");
                return Ok(None);
            }
        };

        Ok(Some(JobProbe {
            state: state.to_string(),
            disposition: ExitDisposition::from_squeue_code(state),
            elapsed,
            nodes: nodes
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
        }))
    }
}

/// Slow, durable accounting view (`sacct`).
pub struct SacctView;

#[async_trait]
impl StateView for SacctView {
    fn name(&self) -> &'static str {
        "sacct"
    }

    async fn probe(
        &self,
        exec: &dyn RemoteExecutor,
        job_id: &str,
    ) -> AdapterResult<Option<JobProbe>> {
        let cmd = format!("sacct --jobs={job_id} --format=state,elapsed | sed -n 3p | xargs");
        let output = exec.execute(&cmd, None).await?;

        // Anything on stderr, most commonly "accounting storage is
        // disabled", means this view cannot be trusted for this job.
        if !output.stderr.is_empty() {
            return Ok(None);
        }
        let mut fields = output.stdout.split_whitespace();
        let (Some(state), Some(elapsed)) = (fields.next(), fields.next()) else {
            return Ok(None);
        };

        let elapsed = match normalize_elapsed(elapsed) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!("failed to fetch accounting info for {job_id}: {e}");
                return Ok(None);
            }
        };

        Ok(Some(JobProbe {
            state: state.to_string(),
            disposition: ExitDisposition::from_sacct_state(state),
            elapsed,
            nodes: Vec::new(),
        }))
    }
}

/// Ordered fallback over state views.
pub struct StateTranslator {
    views: Vec<Box<dyn StateView>>,
}

impl StateTranslator {
    /// The standard Slurm order: live queue first, accounting second.
    pub fn slurm(user: String) -> Self {
        Self {
            views: vec![Box::new(SqueueView { user: Some(user) }), Box::new(SacctView)],
        }
    }

    /// Custom view order, for injecting fakes.
    pub fn with_views(views: Vec<Box<dyn StateView>>) -> Self {
        Self { views }
    }

    /// Ask each view in turn; the first one that sees the job wins.
    /// Transport failures degrade to "not seen" rather than propagating;
    /// a job whose trace cannot be read is reported unknown, not erred.
    pub async fn probe(&self, exec: &dyn RemoteExecutor, job_id: &str) -> Option<JobProbe> {
        for view in &self.views {
            debug!("querying {} for {job_id}", view.name());
            match view.probe(exec, job_id).await {
                Ok(Some(probe)) => return Some(probe),
                Ok(None) => continue,
                Err(e) => {
                    warn!("{} query for {job_id} failed: {e}", view.name());
                    continue;
                }
            }
        }
        None
    }
}

/// List jobs via squeue, filtered to this connector's name prefix.
/// Returns `(name, job_id)` pairs with the prefix stripped.
pub async fn squeue_list(
    exec: &dyn RemoteExecutor,
    user: &str,
    states: &str,
) -> AdapterResult<Vec<(String, String)>> {
    let cmd = format!("squeue --noheader -u \"{user}\" -t \"{states}\" -o \"%j|%A\"");
    let output = exec.execute(&cmd, None).await?;

    let mut queue = Vec::new();
    for line in output.stdout.lines() {
        if let Some(rest) = line.strip_prefix(JOB_NAME_PREFIX) {
            if let Some((name, job_id)) = rest.split_once('|') {
                queue.push((name.to_string(), job_id.to_string()));
            }
        }
    }
    Ok(queue)
}
