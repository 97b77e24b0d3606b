//! Full-pipeline tests against a scripted remote executor.
//!
//! No cluster is involved: the executor double replays canned command
//! output and records every command (and stdin body) it is given, so the
//! tests can assert both what the connector concluded and exactly what
//! it would have run over SSH.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rustc_hash::FxHashMap;
use serde_json::Value;

use slurmgate::config::{
    ClusterConfig, ImageConfig, ProxyConfig, SingularityConfig, SlurmRestdConfig, SshConfig,
};
use slurmgate::{
    AdapterError, AdapterResult, CommandOutput, RemoteExecutor, SlurmConnector, UserMapper,
};

/// Replays canned responses and records everything it is asked to run.
#[derive(Default)]
struct ScriptedExecutor {
    responses: Mutex<Vec<CommandOutput>>,
    commands: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedExecutor {
    fn new(responses: Vec<CommandOutput>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    fn stdin_of(&self, index: usize) -> Option<String> {
        self.commands.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, cmd: &str, stdin: Option<&str>) -> AdapterResult<CommandOutput> {
        self.commands
            .lock()
            .unwrap()
            .push((cmd.to_string(), stdin.map(str::to_string)));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(CommandOutput::default());
        }
        Ok(responses.remove(0))
    }
}

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        executor: "slurm".to_string(),
        ssh: SshConfig {
            host: "login.cluster.example.com".to_string(),
            port: 22,
            user: "jarvice".to_string(),
            private_key: String::new(),
        },
        slurmrestd: SlurmRestdConfig {
            host: "127.0.0.1".to_string(),
            port: "6820".to_string(),
            api_version: "v0.0.38".to_string(),
        },
        scratch_dir: "/scratch/".to_string(),
        images: ImageConfig {
            system_registry: "registry.example.com".to_string(),
            system_base: "jarvice".to_string(),
            local_registry: None,
            local_base: None,
            proxy_port: None,
            proxy_repos: Vec::new(),
            images_tag: "jarvice-master".to_string(),
            docker_username: String::new(),
            docker_password: String::new(),
        },
        proxy: ProxyConfig::default(),
        singularity: SingularityConfig::default(),
        jobs_domain: None,
    }
}

fn users() -> UserMapper {
    UserMapper::from_yaml_str(
        "users_mapping:\n  - mail: user@example.com\n    local_user: lu0001\n",
    )
    .unwrap()
}

fn connector(exec: Arc<ScriptedExecutor>) -> SlurmConnector {
    SlurmConnector::new(cluster_config(), users(), exec)
}

fn template(appdef_version: i64) -> String {
    [
        "#!/bin/bash".to_string(),
        "JOBOBJ_INTERACTIVE=False".to_string(),
        format!("JOBOBJ_APPDEFVERSION={appdef_version}"),
        "JOBOBJ_ARCH=x86_64".to_string(),
        "JOBOBJ_NAE=abaqus".to_string(),
        "JOBOBJ_REPO=registry.example.com/apps/abaqus".to_string(),
        "JOBOBJ_USER=user@example.com".to_string(),
        "JOBOBJ_GPUS=0".to_string(),
        "JOBOBJ_RAM=0".to_string(),
        "JARVICE_CPU_CORES=4".to_string(),
        "JARVICE_CMD=/bin/date".to_string(),
        "{DOWNSTREAM_PARAMETERS}".to_string(),
        "run-the-app".to_string(),
    ]
    .join("\n")
}

fn scripts(appdef_version: i64) -> FxHashMap<String, String> {
    let mut map = FxHashMap::default();
    map.insert("slurm".to_string(), BASE64.encode(template(appdef_version)));
    map
}

#[tokio::test]
async fn submit_rejects_appdef_v1_before_any_remote_command() {
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());

    let err = connector
        .submit("job1", 1, 1, &scripts(1), "token", false)
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::UnsupportedAppdef(1)));
    assert_eq!(err.http_status(), 400);
    assert!(exec.commands().is_empty(), "no remote command may be issued");
}

#[tokio::test]
async fn submit_rejects_unmapped_user_before_any_remote_command() {
    let exec = ScriptedExecutor::new(Vec::new());
    let mut map = FxHashMap::default();
    map.insert(
        "slurm".to_string(),
        BASE64.encode(template(2).replace("user@example.com", "stranger@example.com")),
    );
    let connector = connector(exec.clone());

    let err = connector
        .submit("job1", 1, 1, &map, "token", false)
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::UnmappedUser(_)));
    assert!(exec.commands().is_empty());
}

#[tokio::test]
async fn submit_end_to_end() {
    let exec = ScriptedExecutor::new(vec![CommandOutput::new(r#"{"job_id": 4242}"#, "")]);
    let connector = connector(exec.clone());

    let handle = connector
        .submit("job1", 7, 2, &scripts(2), "jwt-token", false)
        .await
        .unwrap();

    assert_eq!(handle.job_id, "4242");

    // Exactly one curl submission went out, authorized as the mapped
    // local user with the caller's bearer.
    let commands = exec.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("/slurm/v0.0.38/job/submit"));
    assert!(commands[0].contains("X-SLURM-USER-NAME:lu0001"));
    assert!(commands[0].contains("X-SLURM-USER-TOKEN:jwt-token"));

    // The payload travelled on stdin as JSON, not spliced into the
    // command line.
    let body: Value = serde_json::from_str(&exec.stdin_of(0).unwrap()).unwrap();
    assert_eq!(body["job"]["name"], "jarvice_job1");
    assert_eq!(body["job"]["nodes"], "2");
    assert_eq!(body["job"]["tasks"], 8);
    assert_eq!(body["job"]["hold"], false);
    assert!(body["script"].as_str().unwrap().starts_with("#!/bin/bash\n"));

    // The returned script is expanded and carries exactly one sentinel
    // success check.
    assert!(handle.script.contains("export JARVICE_CMD=/bin/date"));
    assert!(handle.script.contains("run-the-app"));
    assert!(!handle.script.contains("{DOWNSTREAM_PARAMETERS}"));
    assert_eq!(
        handle.script.matches("grep --quiet 'JARVICE_CMD_SUCCESS'").count(),
        1
    );
    // Credential exports never come back to the caller.
    assert!(!handle.script.contains("export JARVICE_DOCKER_PASSWORD="));
}

#[tokio::test]
async fn submit_surfaces_empty_slurmrestd_response() {
    let exec = ScriptedExecutor::new(vec![CommandOutput::new(
        "",
        "curl: (7) Failed to connect\nConnection refused",
    )]);
    let connector = connector(exec.clone());

    let err = connector
        .submit("job1", 1, 1, &scripts(2), "token", false)
        .await
        .unwrap_err();

    match err {
        AdapterError::Submit(msg) => {
            assert!(msg.contains("Failed to connect -- Connection refused"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn exit_status_completed_job() {
    let exec = ScriptedExecutor::new(vec![
        CommandOutput::new("CD|01:02:03|n1", ""), // squeue
        CommandOutput::new("job output here", ""), // tail
        CommandOutput::default(),                  // gc rm
    ]);
    let connector = connector(exec.clone());

    let (code, elapsed, logs) = connector.exit_status("job1", 7, "4242").await;

    assert_eq!(code, 0);
    assert_eq!(elapsed, "01:02:03");
    assert_eq!(
        logs,
        vec![
            "job output here".to_string(),
            "<< termination state: CD -- see STDOUT for job errors >>".to_string(),
        ]
    );

    let commands = exec.commands();
    assert!(commands[0].contains("squeue"));
    assert!(commands[1].starts_with("tail -10000 "));
    assert_eq!(
        commands.iter().filter(|c| c.contains("rm -Rf")).count(),
        1,
        "exactly one garbage collection"
    );
}

#[tokio::test]
async fn exit_status_falls_back_to_sacct() {
    let exec = ScriptedExecutor::new(vec![
        CommandOutput::default(),                         // squeue: gone
        CommandOutput::new("CANCELLED 00:10:00", ""),     // sacct
        CommandOutput::new("partial output", ""),         // tail
        CommandOutput::default(),                         // gc rm
    ]);
    let connector = connector(exec.clone());

    let (code, elapsed, logs) = connector.exit_status("job1", 7, "4242").await;

    assert_eq!(code, -15);
    assert_eq!(elapsed, "00:10:00");
    assert!(logs[1].contains("termination state: CANCELLED"));
}

#[tokio::test]
async fn exit_status_vanished_job_reports_unknown_and_collects() {
    // Both views blind.
    let exec = ScriptedExecutor::new(vec![CommandOutput::default(), CommandOutput::default()]);
    let connector = connector(exec.clone());

    let (code, elapsed, logs) = connector.exit_status("job1", 7, "4242").await;

    assert_eq!(code, -9);
    assert_eq!(elapsed, "00:00:00");
    assert!(logs.is_empty());
    // The spool still gets cleaned up.
    assert_eq!(exec.commands().iter().filter(|c| c.contains("rm -Rf")).count(), 1);
}

#[tokio::test]
async fn collect_is_idempotent() {
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());

    connector.collect("job1", 7, "4242", false).await;
    connector.collect("job1", 7, "4242", false).await;

    // Second collection of an already-removed spool is a no-op remotely
    // (rm -Rf on a missing path) and must not error here.
    assert_eq!(exec.commands().iter().filter(|c| c.contains("rm -Rf")).count(), 2);
}

#[tokio::test]
async fn running_and_queued_listings() {
    let exec = ScriptedExecutor::new(vec![
        CommandOutput::new("jarvice_job1|100\nsomeone_else|101", ""),
        CommandOutput::new("jarvice_job2|102", ""),
    ]);
    let connector = connector(exec.clone());

    let running = connector.running().await.unwrap();
    assert_eq!(running, vec![("job1".to_string(), "100".to_string())]);

    let queued = connector.queued().await.unwrap();
    assert_eq!(queued, vec![("job2".to_string(), "102".to_string())]);

    let commands = exec.commands();
    assert!(commands[0].contains("-t \"R,RH,RS,SI,ST,S,CG,SO\""));
    assert!(commands[1].contains("-t \"PD,RD,RF\""));
}

#[tokio::test]
async fn run_status_for_live_job() {
    let exec = ScriptedExecutor::new(vec![CommandOutput::new("R|05:00|n1,n2", "")]);
    let connector = connector(exec.clone());

    let status = connector.run_status("job1", 7, "4242").await.unwrap();
    assert_eq!(status.nodes, vec!["n1".to_string(), "n2".to_string()]);
    assert_eq!(status.elapsed, "00:05:00");
    assert_eq!(status.address, "job1/7/4242");
}

#[tokio::test]
async fn dispatcher_paths_and_methods() {
    let qs = slurmgate::QueryString::default();

    // Malformed path.
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());
    assert_eq!(connector.request("/not/enough", &qs).await.code, 400);
    assert!(exec.commands().is_empty());

    // No-op methods.
    assert_eq!(connector.request("/job1/7/4242/ping", &qs).await.code, 200);
    assert_eq!(connector.request("/job1/7/4242/connect", &qs).await.code, 200);

    // Unknown method and unsupported screenshot.
    assert_eq!(connector.request("/job1/7/4242/bogus", &qs).await.code, 400);
    assert_eq!(connector.request("/job1/7/4242/screenshot", &qs).await.code, 404);
}

#[tokio::test]
async fn dispatcher_tail_and_info() {
    let exec = ScriptedExecutor::new(vec![
        CommandOutput::new("last lines", ""),
        CommandOutput::default(),
    ]);
    let connector = connector(exec.clone());
    let qs = slurmgate::QueryString::default();

    let rsp = connector.request("/job1/7/4242/tail", &qs).await;
    assert_eq!(rsp.code, 200);
    assert_eq!(rsp.body.as_deref(), Some("last lines"));
    assert!(exec.commands()[0].starts_with("tail -100 "));

    // An empty output file is a 404, not an empty 200.
    let rsp = connector.request("/job1/7/4242/tail", &qs).await;
    assert_eq!(rsp.code, 404);

    // info carries no URL without an interactive jobs domain.
    let rsp = connector.request("/job1/7/4242/info", &qs).await;
    assert_eq!(rsp.code, 200);
    let body: Value = serde_json::from_str(rsp.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["url"], "");
}

#[tokio::test]
async fn dispatcher_rejects_hostile_path_segments() {
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());
    let qs = slurmgate::QueryString::default();

    // Each of these would splice shell syntax into scancel or tail if
    // the path segments reached a command.
    for path in [
        "/job1/7/4242;touch pwned/abort",
        "/job1$(id)/7/4242/tail",
        "/job`id`/7/4242/shutdown",
        "/job1/7/4242 && true/ping",
    ] {
        let rsp = connector.request(path, &qs).await;
        assert_eq!(rsp.code, 400, "{path:?}");
    }
    assert!(
        exec.commands().is_empty(),
        "no remote command may be issued for a malformed path"
    );
}

#[tokio::test]
async fn dispatcher_shutdown_cancels_job() {
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());
    let qs = slurmgate::QueryString::default();

    let rsp = connector.request("/job1/7/4242/shutdown", &qs).await;
    assert_eq!(rsp.code, 200);
    assert_eq!(exec.commands(), vec!["scancel -f 4242".to_string()]);
}

#[tokio::test]
async fn dispatcher_pvcls_listing() {
    let exec = ScriptedExecutor::new(vec![CommandOutput::new("/data/scratch/a/\n/data/scratch/b", "")]);
    let connector = connector(exec.clone());

    let mut qs = slurmgate::QueryString::default();
    qs.insert("path".to_string(), vec!["/scratch".to_string()]);

    let rsp = connector.request("/pvcls", &qs).await;
    assert_eq!(rsp.code, 200);
    assert!(rsp.body.unwrap().contains("/data/scratch/a/"));
    assert!(exec.commands()[0].contains("/usr/bin/find /scratch -type d"));
}

#[tokio::test]
async fn interactive_submission_needs_jobs_domain() {
    let exec = ScriptedExecutor::new(Vec::new());
    let connector = connector(exec.clone());

    let mut map = FxHashMap::default();
    map.insert(
        "slurm".to_string(),
        BASE64.encode(template(2).replace("JOBOBJ_INTERACTIVE=False", "JOBOBJ_INTERACTIVE=True")),
    );

    let err = connector
        .submit("job1", 1, 1, &map, "token", false)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::InteractiveUnsupported));
    assert!(exec.commands().is_empty());
}
