//! Container image and registry credential resolution.
//!
//! Credential resolution is best-effort by design: a malformed secret
//! blob degrades to empty credentials and submission proceeds; a private
//! image will then fail at pull time, which is the expected failure mode.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::ImageConfig;
use crate::jobspec::JobSpec;

/// Registry credentials; empty when none could be resolved.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Resolved image references and the credentials to pull them with.
#[derive(Debug, Clone)]
pub struct ResolvedImages {
    /// Init container image, `docker://` form.
    pub init_image: String,
    pub init_credentials: RegistryAuth,
    /// Application image, `docker://` form.
    pub app_image: String,
    pub app_credentials: RegistryAuth,
}

/// Go architecture name for a system architecture; `None` asks for the
/// current node's.
pub fn goarch(arch: Option<&str>) -> String {
    let arch = arch.unwrap_or(std::env::consts::ARCH);
    match arch {
        "x86_64" => "amd64".to_string(),
        other => other.to_string(),
    }
}

/// Rewrite a container image tag for a desired architecture.
///
/// If the configured tag ends with the current node's architecture name
/// (single-arch tag convention, e.g. `3.21-amd64`), the suffix is swapped
/// for the target architecture; a multi-arch tag is returned unchanged.
pub fn image_tag(base_tag: &str, target_arch: &str) -> String {
    let this_arch = goarch(None);
    if base_tag.len() > this_arch.len() + 1 && base_tag.ends_with(this_arch.as_str()) {
        format!(
            "{}{}",
            &base_tag[..base_tag.len() - this_arch.len()],
            target_arch
        )
    } else {
        base_tag.to_string()
    }
}

/// Registry host (with port, if any) of an image or server reference.
///
/// Accepts both URL forms (`https://index.docker.io/v1/`) and bare hosts.
pub fn registry_host(reference: &str) -> String {
    if let Ok(url) = Url::parse(reference) {
        if let Some(host) = url.host_str() {
            return match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
        }
    }
    reference.to_string()
}

/// Registry host a repo reference pulls from; short references without a
/// registry part default to Docker Hub.
pub fn repo_registry(repo: &str) -> String {
    let parts: Vec<&str> = repo.split('/').collect();
    if parts.len() > 2 {
        registry_host(parts[0])
    } else {
        "index.docker.io".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct AuthsBlob {
    #[serde(default)]
    auths: FxHashMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Decode the base64 JSON container-secret blob into its auths map.
fn decode_auths(container_secret: Option<&str>) -> FxHashMap<String, AuthEntry> {
    let Some(blob) = container_secret else {
        return FxHashMap::default();
    };
    let decoded = match BASE64.decode(blob) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to decode container secret: {e}");
            return FxHashMap::default();
        }
    };
    match serde_json::from_slice::<AuthsBlob>(&decoded) {
        Ok(parsed) => parsed.auths,
        Err(e) => {
            warn!("failed to parse container secret: {e}");
            FxHashMap::default()
        }
    }
}

/// Find credentials for `registry` in an auths map. The `auth` field is
/// base64 `user:password`.
fn auths_lookup(auths: &FxHashMap<String, AuthEntry>, registry: &str) -> RegistryAuth {
    for (server, entry) in auths {
        if registry_host(server) != registry {
            continue;
        }
        let Some(auth) = entry.auth.as_deref() else {
            continue;
        };
        let decoded = match BASE64.decode(auth).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            _ => {
                warn!("failed to parse docker secret for {server}");
                continue;
            }
        };
        if let Some((username, password)) = decoded.split_once(':') {
            debug!("using system/user docker secret for {registry}");
            return RegistryAuth {
                username: username.to_string(),
                password: password.to_string(),
            };
        }
        warn!("failed to parse docker secret for {server}");
    }
    RegistryAuth::default()
}

fn decode_b64_best_effort(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    match BASE64.decode(value).map(String::from_utf8) {
        Ok(Ok(text)) => text,
        _ => {
            warn!("failed to decode configured registry credential");
            String::new()
        }
    }
}

/// Resolve init and app image references plus pull credentials.
pub fn resolve(config: &ImageConfig, spec: &JobSpec) -> ResolvedImages {
    // Init image lives in the system registry, versioned by appdef.
    let target_arch = goarch(spec.arch.as_deref());
    let init_image = format!(
        "docker://{}/{}/initv{}:{}",
        config.system_registry,
        config.system_base,
        spec.appdef_version,
        image_tag(&config.images_tag, &target_arch)
    );
    let init_credentials = RegistryAuth {
        username: decode_b64_best_effort(&config.docker_username),
        password: decode_b64_best_effort(&config.docker_password),
    };

    // App image: local cache registry wins, then the pull-through proxy,
    // then the repo as declared.
    let app_image = if let (Some(registry), Some(base)) =
        (&config.local_registry, &config.local_base)
    {
        let app_name = spec.app_name.as_deref().unwrap_or(&spec.repo);
        format!("{registry}/{base}/{app_name}:latest")
    } else if let Some(port) = &config.proxy_port {
        let mut image = spec.repo.clone();
        for prefix in &config.proxy_repos {
            if spec.repo.starts_with(prefix.as_str()) {
                let head = prefix.split('/').next().unwrap_or(prefix);
                image = spec.repo.replacen(head, &format!("localhost:{port}"), 1);
                break;
            }
        }
        image
    } else {
        spec.repo.clone()
    };
    let app_image = format!("docker://{app_image}");

    let auths = decode_auths(spec.container_secret.as_deref());
    debug!(
        "docker registry secrets available for: {:?}",
        auths.keys().collect::<Vec<_>>()
    );

    let registry = repo_registry(&spec.repo);
    let app_credentials = match &spec.docker_secret {
        Some(secret) if registry_host(&secret.server) == registry => {
            debug!("using job/app-specific docker secret for {registry}");
            RegistryAuth {
                username: secret.username.clone(),
                password: secret.password.clone(),
            }
        }
        _ => auths_lookup(&auths, &registry),
    };

    ResolvedImages {
        init_image,
        init_credentials,
        app_image,
        app_credentials,
    }
}
