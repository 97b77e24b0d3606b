//! Slurm baremetal connector
//!
//! This crate adapts an unmodified Slurm cluster, reached over SSH and
//! slurmrestd, to an upstream job-lifecycle protocol: submit, poll,
//! terminate, tail, garbage collect.
//!
//! # Overview
//!
//! A submission arrives as a script template with embedded `KEY=value`
//! descriptor lines. The pipeline runs:
//! 1. **Extraction**: parse the descriptor into a [`jobspec::JobSpec`]
//! 2. **Resolution**: pick container images and registry credentials
//! 3. **Synthesis**: wrap the template with an srun preamble and a
//!    sentinel-based exit-code recovery postamble
//! 4. **Submission**: POST a typed payload to slurmrestd and keep the
//!    returned native job id
//!
//! Job state is read through two views with an ordered fallback:
//! `squeue` (fast, ephemeral) then `sacct` (slow, durable). A job both
//! views miss is reported unknown, never crashed on.
//!
//! All cluster I/O flows through the [`executor::RemoteExecutor`] trait;
//! tests drive the full pipeline with a scripted double instead of a
//! cluster.
//!
//! # Example
//!
//! ```ignore
//! use slurmgate::{ClusterConfig, SlurmConnector, UserMapper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::from_env()?;
//!     let users = UserMapper::load("users_mapping.yaml")?;
//!     let connector = SlurmConnector::with_ssh(config, users);
//!     connector.preflight().await;
//!     // hand `connector` to the HTTP front door
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod gc;
pub mod images;
pub mod jobspec;
pub mod script;
pub mod ssh;
pub mod status;
pub mod submit;
pub mod users;

pub use config::ClusterConfig;
pub use connector::{NativeJobHandle, RunStatus, SlurmConnector};
pub use dispatch::{QueryString, SubResponse};
pub use error::{AdapterError, AdapterResult};
pub use executor::{CommandOutput, RemoteExecutor};
pub use status::{ExitDisposition, JobProbe, StateTranslator};
pub use users::UserMapper;
