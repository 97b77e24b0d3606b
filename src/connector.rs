//! The connector facade tying the pipeline together.
//!
//! One [`SlurmConnector`] serves a whole cluster. Every operation is
//! independent and may run concurrently with any other; there is no
//! in-process job table. The remote scheduler is the single source of
//! truth for job state.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::dispatch::{self, JobPath, QueryString, SubResponse};
use crate::error::{AdapterError, AdapterResult};
use crate::executor::RemoteExecutor;
use crate::gc;
use crate::images;
use crate::jobspec::{JobSpec, SbatchDirectives};
use crate::script::synth;
use crate::ssh::SshExecutor;
use crate::status::{
    self, JobProbe, SqueueView, StateTranslator, StateView,
};
use crate::submit::{self, SubmitPayload};
use crate::users::UserMapper;

/// How much of a job's output file is returned with its exit status.
const LOG_TAIL_LINES: u32 = 10_000;

/// What submission hands back to the caller.
#[derive(Debug, Clone)]
pub struct NativeJobHandle {
    /// The scheduler's own id for the job.
    pub job_id: String,
    /// The submitted script, credential exports removed.
    pub script: String,
}

/// Live status of a running job, for callers that poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub nodes: Vec<String>,
    pub elapsed: String,
    /// Opaque sub-request address for this job, `{name}/{number}/{id}`.
    pub address: String,
}

pub struct SlurmConnector {
    config: ClusterConfig,
    users: UserMapper,
    executor: Arc<dyn RemoteExecutor>,
    translator: StateTranslator,
}

impl SlurmConnector {
    /// Build a connector over an already-constructed executor.
    pub fn new(
        config: ClusterConfig,
        users: UserMapper,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let translator = StateTranslator::slurm(config.ssh.user.clone());
        Self {
            config,
            users,
            executor,
            translator,
        }
    }

    /// Build a connector with the standard SSH transport.
    pub fn with_ssh(config: ClusterConfig, users: UserMapper) -> Self {
        let executor = Arc::new(SshExecutor::new(config.ssh.clone()));
        Self::new(config, users, executor)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Log the startup report and probe both cluster channels.
    ///
    /// Probe failures are warnings, not errors; the cluster may simply
    /// not be up yet when the connector starts.
    pub async fn preflight(&self) {
        info!("executor: {}", self.config.executor);
        info!(
            "ssh target: {}@{}:{}",
            self.config.ssh.user, self.config.ssh.host, self.config.ssh.port
        );
        info!(
            "slurmrestd target: {}:{} ({})",
            self.config.slurmrestd.host,
            self.config.slurmrestd.port,
            self.config.slurmrestd.api_version
        );
        info!("scratch dir: {}", self.config.scratch_dir);

        info!("testing connectivity to target cluster...");
        match self.executor.execute("/bin/true", None).await {
            Ok(_) => info!("cluster ssh reachable"),
            Err(e) => {
                warn!("could not connect to remote cluster: {e}");
                warn!("please check ssh parameters");
            }
        }

        info!("testing connectivity to target cluster slurmrestd...");
        let probe = format!(
            "curl {}:{}/",
            self.config.slurmrestd.host, self.config.slurmrestd.port
        );
        match self.executor.execute(&probe, None).await {
            // An unauthenticated poke is expected to be turned away; a
            // rejection proves the daemon is listening.
            Ok(out)
                if out.stdout.contains("Authentication failure")
                    || out.stderr.contains("Authentication failure") =>
            {
                info!("slurmrestd reachable")
            }
            Ok(_) => warn!("could ssh to cluster but could not reach slurmrestd"),
            Err(e) => warn!("could not connect to remote cluster: {e}"),
        }
    }

    /// Liveness check: true when the cluster answers a trivial command.
    pub async fn liveness(&self) -> bool {
        self.executor.execute("/bin/true", None).await.is_ok()
    }

    /// Jobs currently running on the cluster, as `(name, job_id)`.
    pub async fn running(&self) -> AdapterResult<Vec<(String, String)>> {
        status::squeue_list(
            self.executor.as_ref(),
            &self.config.ssh.user,
            status::RUNNING_STATES,
        )
        .await
    }

    /// Jobs waiting in the queue, as `(name, job_id)`.
    pub async fn queued(&self) -> AdapterResult<Vec<(String, String)>> {
        status::squeue_list(
            self.executor.as_ref(),
            &self.config.ssh.user,
            status::QUEUED_STATES,
        )
        .await
    }

    /// Submit a job for scheduling.
    ///
    /// `scripts` maps executor names to base64-encoded script templates;
    /// only the entry for the configured executor is used. All
    /// validation happens before the first remote command, so a rejected
    /// submission leaves nothing behind on the cluster.
    pub async fn submit(
        &self,
        name: &str,
        number: i64,
        nodes: i64,
        scripts: &FxHashMap<String, String>,
        bearer: &str,
        held: bool,
    ) -> AdapterResult<NativeJobHandle> {
        info!("job submission request for {name}:{number}");

        let encoded = scripts
            .get(&self.config.executor)
            .ok_or_else(|| AdapterError::MissingExecutorScript(self.config.executor.clone()))?;
        let template = String::from_utf8(BASE64.decode(encoded)?)
            .map_err(|_| AdapterError::ScriptNotUtf8)?;

        let spec = JobSpec::parse(&template)?;
        let local_user = self.users.local_user(&spec.user)?;

        let mut directives =
            SbatchDirectives::from_devices(&spec.devices, self.config.singularity.overlay_size)?;
        directives.enforce_exclusive(spec.interactive, spec.gpus);

        let images = images::resolve(&self.config.images, &spec);
        let script = synth::synthesize(
            &self.config,
            &spec,
            &images,
            directives.overlay_size,
            &local_user,
            &template,
        )?;
        debug!("synthesized script for {name}:{number}:\n{}", script.redacted);

        let payload = SubmitPayload::build(
            &self.config,
            &spec,
            &directives,
            name,
            nodes,
            &script.submitted,
            held,
        );
        let job_id = submit::submit(
            self.executor.as_ref(),
            &self.config,
            &payload,
            &local_user,
            bearer,
        )
        .await?;

        Ok(NativeJobHandle {
            job_id,
            script: script.redacted,
        })
    }

    /// Exit status of a completed job: `(exit_code, elapsed, logs)`.
    ///
    /// Garbage collection runs on every path through here, found or
    /// vanished, so a job whose trace disappeared still gets its spool
    /// artifacts removed. Collection is idempotent, so the occasional
    /// double run is harmless.
    pub async fn exit_status(
        &self,
        name: &str,
        number: i64,
        job_id: &str,
    ) -> (i32, String, Vec<String>) {
        let probe = self.translator.probe(self.executor.as_ref(), job_id).await;

        let Some(probe) = probe else {
            // Job probably never ran, or accounting lost it.
            debug!("no view could see job {job_id}; reporting unknown");
            gc::collect(&self.config, self.executor.as_ref(), name, number, job_id, false)
                .await;
            return (
                status::ExitDisposition::Vanished.exit_code(),
                "00:00:00".to_string(),
                Vec::new(),
            );
        };

        let tail = format!(
            "tail -{LOG_TAIL_LINES} {}",
            self.config.job_output_path(name)
        );
        let stdout = match self.executor.execute(&tail, None).await {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!("could not fetch output for {job_id}: {e}");
                String::new()
            }
        };
        let logs = vec![
            stdout,
            format!(
                "<< termination state: {} -- see STDOUT for job errors >>",
                probe.state
            ),
        ];

        gc::collect(&self.config, self.executor.as_ref(), name, number, job_id, false).await;

        (probe.disposition.exit_code(), probe.elapsed, logs)
    }

    /// Live status of a single job; `None` once it leaves the queue.
    pub async fn run_status(
        &self,
        name: &str,
        number: i64,
        job_id: &str,
    ) -> Option<RunStatus> {
        let view = SqueueView {
            user: Some(self.config.ssh.user.clone()),
        };
        let probe: JobProbe = view
            .probe(self.executor.as_ref(), job_id)
            .await
            .ok()
            .flatten()?;
        Some(RunStatus {
            nodes: probe.nodes,
            elapsed: probe.elapsed,
            address: format!("{name}/{number}/{job_id}"),
        })
    }

    /// Terminate a job. Best effort; scancel's own failures are logged
    /// and swallowed.
    pub async fn terminate(&self, name: &str, number: Option<i64>, job_id: &str, _force: bool) {
        // SIGTERM does not reliably reach containerized jobs, so kill
        // outright whether or not force was asked.
        info!(
            "terminating job {name}:{} ({job_id})",
            number.map(|n| n.to_string()).unwrap_or_default()
        );
        if let Err(e) = self
            .executor
            .execute(&format!("scancel -f {job_id}"), None)
            .await
        {
            warn!("scancel for {job_id} failed: {e}");
        }
    }

    /// Release a held job. Best effort.
    pub async fn release(&self, name: &str, number: i64, job_id: &str) {
        debug!("releasing job {name}:{number} ({job_id})");
        match self
            .executor
            .execute(&format!("scontrol release {job_id}"), None)
            .await
        {
            Ok(out) if !out.stderr.is_empty() => {
                warn!("releasing job {job_id} failed: {}", out.stderr)
            }
            Ok(_) => {}
            Err(e) => warn!("releasing job {job_id} failed: {e}"),
        }
    }

    /// Admin-facing event text for a job. Not strictly events, but the
    /// scontrol dump shows what is happening with a job.
    pub async fn events(&self, job_id: &str) -> AdapterResult<String> {
        let out = self
            .executor
            .execute(&format!("scontrol show job {job_id}"), None)
            .await?;
        if out.stdout.is_empty() {
            return Err(AdapterError::Transport(format!(
                "scontrol show job failed: {}",
                out.stderr
            )));
        }
        Ok(out.stdout)
    }

    /// Set a node online or offline. Legacy; placement is the
    /// scheduler's job here, so this acknowledges without acting.
    pub fn online(&self, _host: &str, status: bool, _comment: &str) -> bool {
        status
    }

    /// Garbage collect one job's artifacts, optionally cancelling it.
    pub async fn collect(&self, name: &str, number: i64, job_id: &str, cancel: bool) {
        gc::collect(
            &self.config,
            self.executor.as_ref(),
            name,
            number,
            job_id,
            cancel,
        )
        .await
    }

    /// Handle an arbitrary sub-request addressed by path.
    pub async fn request(&self, path: &str, qs: &QueryString) -> SubResponse {
        // Fixed-name branch first: a filesystem listing with no job
        // context.
        if path.trim_matches('/') == "pvcls" {
            let cmd = dispatch::pvcls_command(qs);
            return match self.executor.execute(&cmd, None).await {
                Ok(out) if !out.stdout.is_empty() => SubResponse::text(200, out.stdout),
                Ok(out) => SubResponse::text(401, out.stderr),
                Err(e) => SubResponse::text(500, e.to_string()),
            };
        }

        let job = match JobPath::parse(path) {
            Ok(job) => job,
            Err(e) => {
                debug!("path decode failed: {e}");
                return SubResponse::status(400);
            }
        };
        debug!(
            "sub-request {} for {}:{} ({})",
            job.method, job.name, job.number, job.job_id
        );

        match job.method.as_str() {
            "ping" | "connect" => SubResponse::status(200),
            "shutdown" | "abort" => {
                self.terminate(&job.name, None, &job.job_id, job.method == "abort")
                    .await;
                SubResponse::status(200)
            }
            "info" => SubResponse::json(
                200,
                &dispatch::info_body(self.config.jobs_domain.as_deref(), &job.name),
            ),
            "tail" => {
                let cmd = format!(
                    "tail -{} {}",
                    dispatch::tail_lines(qs),
                    self.config.job_output_path(&job.name)
                );
                match self.executor.execute(&cmd, None).await {
                    Ok(out) if !out.stdout.is_empty() => SubResponse::text(200, out.stdout),
                    Ok(_) => SubResponse::status(404),
                    Err(e) => SubResponse::text(500, e.to_string()),
                }
            }
            "screenshot" => SubResponse::status(404),
            _ => SubResponse::status(400),
        }
    }
}
