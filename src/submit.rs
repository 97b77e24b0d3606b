//! Typed slurmrestd submission payload and the submit call itself.
//!
//! The payload is built from structured fields and serialized with serde;
//! the script travels base64-encoded inside it, and the whole body is fed
//! to curl on stdin so no job-controlled text is ever spliced into the
//! command line.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::executor::RemoteExecutor;
use crate::jobspec::{JobSpec, SbatchDirectives};
use crate::status::{JOB_NAME_PREFIX, normalize_elapsed};

/// slurmrestd's tri-state number encoding.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NumberSpec {
    pub number: i64,
    pub set: bool,
    pub infinite: bool,
}

impl NumberSpec {
    pub fn fixed(number: i64) -> Self {
        Self {
            number,
            set: true,
            infinite: false,
        }
    }
}

/// The `job` object of a submission body.
#[derive(Debug, Clone, Serialize)]
pub struct JobParams {
    pub name: String,
    /// Node count, as a string per the API schema.
    pub nodes: String,
    /// Total task slots to allocate. The script's own srun narrows this
    /// back down to one task per node.
    pub tasks: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    pub exclusive: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<NumberSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_per_node: Option<NumberSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tres_per_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub licenses: Option<String>,
    pub current_working_directory: String,
    pub standard_output: String,
    pub standard_error: String,
    pub environment: Vec<String>,
    pub hold: bool,
}

/// Complete submission body.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitPayload {
    /// Outer wrapper script; the real script rides inside, base64-encoded.
    pub script: String,
    pub job: JobParams,
}

/// Subset of the slurmrestd submission response we care about.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: i64,
}

/// Convert an `HH:MM:SS`-style walltime into whole minutes, rounded up.
/// An unparseable walltime means no limit is set.
fn time_limit_minutes(walltime: &str) -> Option<i64> {
    let normalized = normalize_elapsed(walltime).ok()?;
    let mut fields = normalized.split(':');
    let hours: i64 = fields.next()?.parse().ok()?;
    let mins: i64 = fields.next()?.parse().ok()?;
    let secs: i64 = fields.next()?.parse().ok()?;
    Some(hours * 60 + mins + i64::from(secs > 0))
}

/// Wrap the synthesized script for the `script` field: passthrough
/// `#SBATCH` flags first, then a base64 bounce through bash so the inner
/// script needs no quoting at all.
fn wrap_script(inner: &str, directives: &SbatchDirectives) -> String {
    let encoded = BASE64.encode(inner);
    format!(
        "#!/bin/bash\n{}echo '{}' | base64 -d | /bin/bash",
        directives.sbatch_header(),
        encoded
    )
}

impl SubmitPayload {
    /// Assemble the full submission body for one job.
    pub fn build(
        config: &ClusterConfig,
        spec: &JobSpec,
        directives: &SbatchDirectives,
        name: &str,
        nodes: i64,
        script: &str,
        held: bool,
    ) -> Self {
        let job = JobParams {
            name: format!("{JOB_NAME_PREFIX}{name}"),
            nodes: nodes.to_string(),
            tasks: spec.cores * nodes,
            partition: directives.partition.clone(),
            exclusive: if directives.exclusive {
                vec!["true".to_string(), "true".to_string()]
            } else {
                Vec::new()
            },
            time_limit: spec
                .walltime
                .as_deref()
                .and_then(time_limit_minutes)
                .map(NumberSpec::fixed),
            memory_per_node: (spec.ram_mb > 0).then(|| NumberSpec::fixed(spec.ram_mb)),
            tres_per_node: (spec.gpus > 0).then(|| format!("gres/gpu={}", spec.gpus)),
            licenses: spec.licenses.clone(),
            current_working_directory: config.spool_dir(),
            standard_output: config.job_output_path(name),
            standard_error: config.job_output_path(name),
            environment: vec!["JARVICE=true".to_string()],
            hold: held,
        };

        Self {
            script: wrap_script(script, directives),
            job,
        }
    }
}

/// POST the payload to slurmrestd through the login node and return the
/// native job id.
///
/// The bearer token authorizes the request as the mapped local user.
/// An empty response body means the submission did not happen, whatever
/// curl's exit status says.
pub async fn submit(
    exec: &dyn RemoteExecutor,
    config: &ClusterConfig,
    payload: &SubmitPayload,
    local_user: &str,
    bearer: &str,
) -> AdapterResult<String> {
    let body = serde_json::to_string(payload)?;
    let cmd = format!(
        "mkdir -p \"{spool}\" && \
         curl -s -X POST {host}:{port}/slurm/{api}/job/submit \
         -H \"X-SLURM-USER-NAME:{local_user}\" \
         -H \"X-SLURM-USER-TOKEN:{bearer}\" \
         -H \"Content-Type: application/json\" \
         -d @-",
        spool = config.spool_dir(),
        host = config.slurmrestd.host,
        port = config.slurmrestd.port,
        api = config.slurmrestd.api_version,
    );
    debug!("submitting {} to slurmrestd as {local_user}", payload.job.name);

    let output = exec.execute(&cmd, Some(&body)).await?;
    if output.stdout.is_empty() {
        return Err(AdapterError::Submit(output.stderr.replace('\n', " -- ")));
    }

    let response: SubmitResponse = serde_json::from_str(&output.stdout)
        .map_err(|e| AdapterError::Submit(format!("garbled slurmrestd response: {e}")))?;
    info!("job {} submitted as slurm job {}", payload.job.name, response.job_id);
    Ok(response.job_id.to_string())
}
