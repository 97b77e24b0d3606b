//! Parsed job descriptor and pseudo-device directives.

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::script::extract::{KeyLookup, find_key};

/// Per-job docker registry secret carried in the descriptor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DockerSecret {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// The abstract job, parsed out of the embedded `KEY=value` lines of the
/// downstream script template.
///
/// Owned exclusively by the submission that created it; nothing here is
/// shared across submissions or persisted.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Interactive flag; anything but the literal `False` counts as true.
    pub interactive: bool,
    /// Application definition version; v2+ is required downstream.
    pub appdef_version: i64,
    pub arch: Option<String>,
    /// Application name, used for local-cache image references.
    pub app_name: Option<String>,
    /// Container repo reference for the app image.
    pub repo: String,
    /// Registry secrets blob (base64 JSON), resolved best-effort later.
    pub container_secret: Option<String>,
    /// Upstream identity of the submitting user.
    pub user: String,
    pub docker_secret: Option<DockerSecret>,
    /// Pseudo-device strings, `key=value` each.
    pub devices: Vec<String>,
    pub gpus: i64,
    pub ram_mb: i64,
    pub licenses: Option<String>,
    pub walltime: Option<String>,
    pub cores: i64,
    /// Final command line run by instance 0.
    pub command: String,
}

fn required(script: &str, key: &'static str) -> AdapterResult<String> {
    find_key(script, key)
        .value()
        .ok_or(AdapterError::MissingField(key))
}

fn required_int(script: &str, key: &'static str) -> AdapterResult<i64> {
    let value = required(script, key)?;
    value
        .parse()
        .map_err(|_| AdapterError::BadInteger { field: key, value })
}

fn optional_int(script: &str, key: &'static str) -> AdapterResult<i64> {
    match find_key(script, key) {
        KeyLookup::Found(value) => value
            .parse()
            .map_err(|_| AdapterError::BadInteger { field: key, value }),
        KeyLookup::Empty | KeyLookup::Missing => Ok(0),
    }
}

impl JobSpec {
    /// Parse and validate a job spec from the decoded script template.
    ///
    /// Fails fast on missing or malformed required fields and on an
    /// unsupported appdef version, before any remote command is issued.
    /// Secret and device blobs that fail to decode degrade to empty with
    /// a warning; credential resolution is best-effort by design.
    pub fn parse(script: &str) -> AdapterResult<Self> {
        let appdef_version = required_int(script, "JOBOBJ_APPDEFVERSION")?;
        if appdef_version < 2 {
            return Err(AdapterError::UnsupportedAppdef(appdef_version));
        }

        // Upstream sends the literal strings "True"/"False" here.
        let interactive = find_key(script, "JOBOBJ_INTERACTIVE")
            .value()
            .map(|v| v != "False")
            .unwrap_or(true);

        let docker_secret = find_key(script, "JOBOBJ_DOCKER_SECRET")
            .value()
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(secret) => Some(secret),
                Err(e) => {
                    warn!("failed to parse job docker secret: {e}");
                    None
                }
            });

        let devices = find_key(script, "JOBOBJ_DEVICES")
            .value()
            .map(|raw| match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("failed to parse job devices: {e}");
                    Vec::new()
                }
            })
            .unwrap_or_default();

        Ok(Self {
            interactive,
            appdef_version,
            arch: find_key(script, "JOBOBJ_ARCH").value(),
            app_name: find_key(script, "JOBOBJ_NAE").value(),
            repo: required(script, "JOBOBJ_REPO")?,
            container_secret: find_key(script, "JOBOBJ_CTRSECRET").value(),
            user: required(script, "JOBOBJ_USER")?,
            docker_secret,
            devices,
            gpus: optional_int(script, "JOBOBJ_GPUS")?,
            ram_mb: optional_int(script, "JOBOBJ_RAM")?,
            licenses: find_key(script, "JOBOBJ_LICENSES").value(),
            walltime: find_key(script, "JOBOBJ_WALLTIME").value(),
            cores: required_int(script, "JARVICE_CPU_CORES")?,
            command: required(script, "JARVICE_CMD")?,
        })
    }
}

/// Scheduler submission directives distilled from pseudo-devices.
///
/// Pseudo-devices are not devices on a Slurm cluster; the token list is
/// repurposed for container configuration and scheduler parameters. A
/// malformed or unrecognized token fails the submission so erroneous jobs
/// do not run unintentionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatchDirectives {
    /// Singularity overlay size in MB.
    pub overlay_size: u64,
    pub partition: Option<String>,
    /// Exclusive node allocation; defaults to true.
    pub exclusive: bool,
    /// Native flags passed through verbatim, e.g. `--mail-type=END`.
    pub extra_flags: Vec<String>,
}

impl SbatchDirectives {
    /// Translate the device list, starting from the configured overlay
    /// default.
    pub fn from_devices(devices: &[String], default_overlay: u64) -> AdapterResult<Self> {
        let mut directives = Self {
            overlay_size: default_overlay,
            partition: None,
            exclusive: true,
            extra_flags: Vec::new(),
        };

        for device in devices {
            let (key, value) = device
                .split_once('=')
                .ok_or_else(|| AdapterError::MalformedDevice(device.clone()))?;
            let key = key.trim();
            let value = value.trim();

            if key == "overlay" {
                directives.overlay_size = value
                    .parse()
                    .map_err(|_| AdapterError::InvalidOverlay(value.to_string()))?;
            } else if key == "partition" {
                directives.partition = Some(value.to_string());
            } else if key == "exclusive" {
                if value == "False" {
                    directives.exclusive = false;
                }
            } else if let Some(flag) = key.strip_prefix("sbatch_") {
                directives.extra_flags.push(format!("--{flag}={value}"));
            } else {
                return Err(AdapterError::UnknownDevice(key.to_string()));
            }
        }

        Ok(directives)
    }

    /// Force exclusive allocation for interactive and GPU jobs, which
    /// pin host ports and devices.
    pub fn enforce_exclusive(&mut self, interactive: bool, gpus: i64) {
        if (interactive || gpus > 0) && !self.exclusive {
            info!("interactive or GPU job forcing the use of node exclusivity!");
            self.exclusive = true;
        }
    }

    /// Render passthrough flags as `#SBATCH` header lines.
    pub fn sbatch_header(&self) -> String {
        self.extra_flags
            .iter()
            .map(|flag| format!("#SBATCH {flag}\n"))
            .collect()
    }
}
