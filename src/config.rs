//! Cluster configuration.
//!
//! All environment-sourced parameters are read once at process start into
//! an explicit [`ClusterConfig`] and passed by reference into the
//! components; nothing in the crate reads ambient process state after
//! construction.

use std::fmt;

use crate::error::{AdapterError, AdapterResult};

/// SSH endpoint and credentials for the cluster login node.
#[derive(Clone)]
pub struct SshConfig {
    /// Cluster login host.
    pub host: String,
    /// SSH port (default 22).
    pub port: u16,
    /// Remote user all jobs are submitted as.
    pub user: String,
    /// Private key material (PEM or OpenSSH format).
    pub private_key: String,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// slurmrestd HTTP endpoint, reached from the login node.
#[derive(Debug, Clone)]
pub struct SlurmRestdConfig {
    pub host: String,
    pub port: String,
    /// API version path segment, e.g. `v0.0.38`.
    pub api_version: String,
}

/// Container registry and image naming parameters.
#[derive(Clone)]
pub struct ImageConfig {
    /// Registry holding the init images.
    pub system_registry: String,
    /// Repository base under the system registry.
    pub system_base: String,
    /// Local cache registry, when deployed in caching mode.
    pub local_registry: Option<String>,
    /// Repository base under the local cache registry.
    pub local_base: Option<String>,
    /// Pull-through registry proxy port on the compute nodes.
    pub proxy_port: Option<String>,
    /// Repo prefixes that should be rewritten through the proxy.
    pub proxy_repos: Vec<String>,
    /// Base image tag; degraded per-architecture at resolution time.
    pub images_tag: String,
    /// Credentials for the system registry, base64-encoded.
    pub docker_username: String,
    pub docker_password: String,
}

impl fmt::Debug for ImageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageConfig")
            .field("system_registry", &self.system_registry)
            .field("system_base", &self.system_base)
            .field("local_registry", &self.local_registry)
            .field("local_base", &self.local_base)
            .field("proxy_port", &self.proxy_port)
            .field("proxy_repos", &self.proxy_repos)
            .field("images_tag", &self.images_tag)
            .field("docker_username", &"[REDACTED]")
            .field("docker_password", &"[REDACTED]")
            .finish()
    }
}

/// Proxy environment forwarded into job scripts.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

/// Singularity runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct SingularityConfig {
    /// Enable verbose step logging inside job scripts.
    pub verbose: bool,
    /// Cache/work directory; must be large for huge apps.
    pub tmpdir: String,
    /// Default overlay size in MB, overridable per job.
    pub overlay_size: u64,
}

impl Default for SingularityConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            tmpdir: "/tmp".to_string(),
            overlay_size: 600,
        }
    }
}

/// Full connector configuration, constructed once at process start.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Name of the executor whose script to pick out of a submission.
    pub executor: String,
    pub ssh: SshConfig,
    pub slurmrestd: SlurmRestdConfig,
    /// Scratch directory; empty, or normalized to end with `/`.
    pub scratch_dir: String,
    pub images: ImageConfig,
    pub proxy: ProxyConfig,
    pub singularity: SingularityConfig,
    /// DNS domain for interactive job URLs; `None` means the cluster
    /// does not support interactive jobs.
    pub jobs_domain: Option<String>,
}

fn require(name: &'static str) -> AdapterResult<String> {
    std::env::var(name).map_err(|_| AdapterError::Config(format!("{name} is not set")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Ensure a non-empty path ends with exactly one `/`.
fn normalize_scratch(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

impl ClusterConfig {
    /// Load the configuration from the environment.
    ///
    /// Required variables missing from the environment yield a
    /// [`AdapterError::Config`]; everything else falls back to the same
    /// defaults the upstream deployment charts assume.
    pub fn from_env() -> AdapterResult<Self> {
        let local_registry = optional("JARVICE_LOCAL_REGISTRY");
        let local_base = optional("JARVICE_LOCAL_REPO_BASE");
        if local_registry.is_some() && local_base.is_none() {
            return Err(AdapterError::Config(
                "JARVICE_LOCAL_REGISTRY specified without JARVICE_LOCAL_REPO_BASE".to_string(),
            ));
        }

        let proxy_port = optional("JARVICE_REGISTRY_PROXY_PORT");
        let proxy_repos = match (&proxy_port, optional("JARVICE_REGISTRY_PROXY_REPOS")) {
            (Some(_), Some(repos)) => repos.split(',').map(str::to_string).collect(),
            (Some(_), None) => {
                tracing::warn!(
                    "JARVICE_REGISTRY_PROXY_PORT specified without JARVICE_REGISTRY_PROXY_REPOS"
                );
                Vec::new()
            }
            _ => Vec::new(),
        };

        Ok(Self {
            executor: require("JARVICE_BAREMETAL_EXECUTOR")?,
            ssh: SshConfig {
                host: require("JARVICE_SLURM_CLUSTER_ADDR")?,
                port: optional("JARVICE_SLURM_CLUSTER_PORT")
                    .map(|p| {
                        p.parse()
                            .map_err(|_| AdapterError::Config(format!("bad SSH port: {p}")))
                    })
                    .transpose()?
                    .unwrap_or(22),
                user: require("JARVICE_SLURM_SSH_USER")?,
                private_key: require("JARVICE_SLURM_SSH_PKEY")?,
            },
            slurmrestd: SlurmRestdConfig {
                host: require("JARVICE_SLURMRESTD_ADDR")?,
                port: require("JARVICE_SLURMRESTD_PORT")?,
                api_version: require("JARVICE_SLURMRESTD_API_VERSION")?,
            },
            scratch_dir: normalize_scratch(
                &optional("JARVICE_BAREMETAL_SCRATCH_DIR").unwrap_or_default(),
            ),
            images: ImageConfig {
                system_registry: require("JARVICE_SYSTEM_REGISTRY")?,
                system_base: require("JARVICE_SYSTEM_REPO_BASE")?,
                local_registry,
                local_base,
                proxy_port,
                proxy_repos,
                images_tag: optional("JARVICE_IMAGES_TAG").unwrap_or_else(|| "latest".to_string()),
                docker_username: optional("JARVICE_DOCKER_USERNAME").unwrap_or_default(),
                docker_password: optional("JARVICE_DOCKER_PASSWORD").unwrap_or_default(),
            },
            proxy: ProxyConfig {
                http_proxy: optional("JARVICE_BAREMETAL_HTTP_PROXY").unwrap_or_default(),
                https_proxy: optional("JARVICE_BAREMETAL_HTTPS_PROXY").unwrap_or_default(),
                no_proxy: optional("JARVICE_BAREMETAL_NO_PROXY").unwrap_or_default(),
            },
            singularity: SingularityConfig {
                verbose: optional("JARVICE_SINGULARITY_VERBOSE")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                tmpdir: optional("JARVICE_SINGULARITY_TMPDIR")
                    .unwrap_or_else(|| "/tmp".to_string()),
                overlay_size: optional("JARVICE_SINGULARITY_OVERLAY_SIZE")
                    .map(|v| {
                        v.parse()
                            .map_err(|_| AdapterError::Config(format!("bad overlay size: {v}")))
                    })
                    .transpose()?
                    .unwrap_or(600),
            },
            jobs_domain: optional("JARVICE_JOBS_DOMAIN"),
        })
    }

    /// Bookkeeping directory under scratch, with trailing slash.
    pub fn spool_dir(&self) -> String {
        format!("{}.jarvice/", self.scratch_dir)
    }

    /// Captured-output file for a job, derived from its name.
    pub fn job_output_path(&self, name: &str) -> String {
        format!("{}{}.out", self.spool_dir(), name)
    }

    /// Scheduler bookkeeping directory for a native job id.
    pub fn job_spool_dir(&self, job_id: &str) -> String {
        format!("{}jobs/{}", self.spool_dir(), job_id)
    }
}
