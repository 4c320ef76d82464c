//! Drive the cluster daemons: format-if-first-time, start, stop, restart, and the advisory
//! status/health checks.
//!
//! The controller runs on the master as the service account; the installed `start-*`/`stop-*`
//! scripts do the actual daemon management (including reaching the workers over the trust
//! channel). Formatting is destructive and therefore guarded: `start` formats only when the
//! NameNode `current/VERSION` marker is absent, and never again afterwards. Only the explicit
//! `format` action reformats unconditionally.

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use clap::{clap_app, ArgMatches};

use crate::common::output::RunLog;
use crate::common::{run_local, try_run_local};
use crate::config::ClusterConfig;
use crate::nodes::ClusterNodes;

/// Connect timeout for the advisory port/worker probes; the only timeout in the system.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemons expected on the master when the cluster is up, as they appear in `jps` output.
const MASTER_DAEMONS: &[&str] = &[
    "NameNode",
    "ResourceManager",
    "JobHistoryServer",
    "HistoryServer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    NotInstalled,
    InstalledUnformatted,
    Stopped,
    Running,
    /// Some expected daemons are up, some are not; advisory only.
    PartiallyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStep {
    FormatNameNode,
    StartHdfs,
    StartYarn,
    StartJobHistory,
    StartSparkHistory,
}

impl StartStep {
    fn command(self) -> &'static str {
        match self {
            StartStep::FormatNameNode => "hdfs namenode -format -nonInteractive",
            StartStep::StartHdfs => "start-dfs.sh",
            StartStep::StartYarn => "start-yarn.sh",
            StartStep::StartJobHistory => "mapred --daemon start historyserver",
            StartStep::StartSparkHistory => "start-history-server.sh",
        }
    }
}

/// Stop commands, reverse of the start order. Every one is best-effort.
const STOP_COMMANDS: &[&str] = &[
    "stop-history-server.sh",
    "mapred --daemon stop historyserver",
    "stop-yarn.sh",
    "stop-dfs.sh",
];

pub fn cli_options() -> Vec<clap::App<'static, 'static>> {
    vec![
        clap_app! { start =>
            (about: "Start the cluster daemons (HDFS, YARN, history servers), formatting the \
                     NameNode first if it has never been formatted.")
        },
        clap_app! { stop =>
            (about: "Stop the cluster daemons in reverse order. Individual stop failures are \
                     tolerated.")
        },
        clap_app! { restart =>
            (about: "Stop then start the cluster daemons.")
        },
        clap_app! { format =>
            (about: "DESTRUCTIVE: unconditionally reformat the NameNode metadata, destroying \
                     all HDFS contents.")
        },
        clap_app! { status =>
            (about: "Report the derived cluster state and daemon list. Read-only.")
        },
        clap_app! { health =>
            (about: "Run the advisory health checks (daemons, ports, directories, worker \
                     reachability). Read-only; never fails the run.")
        },
    ]
}

pub fn run(
    action: &str,
    _sub_m: &ArgMatches<'_>,
    cfg: &ClusterConfig,
    log: &RunLog,
) -> Result<(), failure::Error> {
    match action {
        "start" => start(cfg, log),
        "stop" => {
            stop(log);
            Ok(())
        }
        "restart" => {
            stop(log);
            start(cfg, log)
        }
        "format" => {
            log.note("explicit format: destroying and reformatting NameNode metadata");
            run_local(
                "hdfs namenode -format",
                &mut login_shell("hdfs namenode -format -force -nonInteractive"),
            )?;
            Ok(())
        }
        "status" => {
            status(cfg, log);
            Ok(())
        }
        "health" => {
            health(cfg, log);
            Ok(())
        }
        _ => unreachable!(),
    }
}

/// The fixed start sequence, with the one-time format step prepended when the NameNode has
/// never been formatted.
pub fn plan_start(formatted: bool) -> Vec<StartStep> {
    let mut plan = Vec::new();
    if !formatted {
        plan.push(StartStep::FormatNameNode);
    }
    plan.extend_from_slice(&[
        StartStep::StartHdfs,
        StartStep::StartYarn,
        StartStep::StartJobHistory,
        StartStep::StartSparkHistory,
    ]);
    plan
}

/// The NameNode writes `current/VERSION` when formatted; its presence is the proof of prior
/// formatting that keeps `start` from ever formatting twice.
pub fn namenode_formatted(namenode_dir: &Path) -> bool {
    namenode_dir.join("current/VERSION").exists()
}

fn start(cfg: &ClusterConfig, log: &RunLog) -> Result<(), failure::Error> {
    let formatted = namenode_formatted(&cfg.namenode_dir);
    if !formatted {
        log.note("NameNode has never been formatted; formatting first");
    }

    for step in plan_start(formatted) {
        log.note(&format!("start: {}", step.command()));
        run_local(step.command(), &mut login_shell(step.command()))?;
    }

    // Start issues the commands and returns; liveness is checked separately by status/health.
    log.note("start commands issued (run `status` or `health` to verify)");
    Ok(())
}

fn stop(log: &RunLog) {
    for command in STOP_COMMANDS {
        log.note(&format!("stop: {}", command));
        try_run_local(command, &mut login_shell(command));
    }
}

/// Run a command through a login shell so the profile snippet supplies JAVA_HOME and PATH.
fn login_shell(command: &str) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-lc").arg(command);
    cmd
}

fn status(cfg: &ClusterConfig, log: &RunLog) {
    let installed = cfg.hadoop_home().exists();
    let formatted = namenode_formatted(&cfg.namenode_dir);

    let jps = try_run_local("jps", &mut login_shell("jps"))
        .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
        .unwrap_or_default();
    let running = running_daemons(&jps);

    let state = derive_state(installed, formatted, running.len(), MASTER_DAEMONS.len());
    log.note(&format!("cluster state: {:?}", state));
    log.note(&format!(
        "master daemons up: {}",
        if running.is_empty() {
            "(none)".to_owned()
        } else {
            running.join(", ")
        }
    ));
}

fn health(cfg: &ClusterConfig, log: &RunLog) {
    status(cfg, log);

    // Port probe: is the NameNode RPC port listening?
    let addr = SocketAddr::from((cfg.master.ip, cfg.namenode_port));
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => log.note(&format!("namenode port {} is listening", cfg.namenode_port)),
        Err(err) => log.note(&format!(
            "namenode port {} not reachable: {} (advisory)",
            cfg.namenode_port, err
        )),
    }

    // NameNode metadata directory listing.
    match std::fs::read_dir(&cfg.namenode_dir) {
        Ok(entries) => log.note(&format!(
            "namenode dir {} has {} entries",
            cfg.namenode_dir.display(),
            entries.count()
        )),
        Err(err) => log.note(&format!(
            "namenode dir {} unreadable: {} (advisory)",
            cfg.namenode_dir.display(),
            err
        )),
    }

    // Best-effort worker reachability over the trust channel.
    let nodes = ClusterNodes::from_config(cfg);
    for worker in &nodes.workers {
        let reachable = try_run_local(
            "worker probe",
            Command::new("ssh")
                .arg("-p")
                .arg(cfg.ssh_port.to_string())
                .arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg(format!("ConnectTimeout={}", PROBE_TIMEOUT.as_secs()))
                .arg(format!("{}@{}", cfg.cluster_user, worker.hostname))
                .arg("true"),
        )
        .is_some();

        log.note(&format!(
            "{}: {}",
            worker.hostname,
            if reachable { "reachable" } else { "NOT reachable (advisory)" }
        ));
    }
}

/// Filter `jps` output down to the expected master daemons.
fn running_daemons(jps: &str) -> Vec<String> {
    jps.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|name| MASTER_DAEMONS.contains(name))
        .map(|name| name.to_owned())
        .collect()
}

fn derive_state(installed: bool, formatted: bool, running: usize, expected: usize) -> ClusterState {
    if !installed {
        ClusterState::NotInstalled
    } else if !formatted {
        ClusterState::InstalledUnformatted
    } else if running == 0 {
        ClusterState::Stopped
    } else if running == expected {
        ClusterState::Running
    } else {
        ClusterState::PartiallyRunning
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unformatted_start_formats_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let namenode_dir = dir.path().join("namenode");
        std::fs::create_dir_all(&namenode_dir).unwrap();

        assert!(!namenode_formatted(&namenode_dir));
        let plan = plan_start(namenode_formatted(&namenode_dir));
        assert_eq!(plan[0], StartStep::FormatNameNode);

        // Formatting leaves the version marker behind; a second start must not format again.
        std::fs::create_dir_all(namenode_dir.join("current")).unwrap();
        std::fs::write(namenode_dir.join("current/VERSION"), "namespaceID=1\n").unwrap();

        assert!(namenode_formatted(&namenode_dir));
        let plan = plan_start(namenode_formatted(&namenode_dir));
        assert!(!plan.contains(&StartStep::FormatNameNode));
        assert_eq!(plan[0], StartStep::StartHdfs);
    }

    #[test]
    fn start_order_is_hdfs_then_yarn_then_history() {
        let plan = plan_start(true);
        assert_eq!(
            plan,
            vec![
                StartStep::StartHdfs,
                StartStep::StartYarn,
                StartStep::StartJobHistory,
                StartStep::StartSparkHistory,
            ]
        );
    }

    #[test]
    fn stop_order_reverses_start_order() {
        assert_eq!(STOP_COMMANDS[0], "stop-history-server.sh");
        assert_eq!(STOP_COMMANDS[STOP_COMMANDS.len() - 1], "stop-dfs.sh");
    }

    #[test]
    fn state_derivation() {
        assert_eq!(derive_state(false, false, 0, 4), ClusterState::NotInstalled);
        assert_eq!(
            derive_state(true, false, 0, 4),
            ClusterState::InstalledUnformatted
        );
        assert_eq!(derive_state(true, true, 0, 4), ClusterState::Stopped);
        assert_eq!(derive_state(true, true, 4, 4), ClusterState::Running);
        assert_eq!(derive_state(true, true, 2, 4), ClusterState::PartiallyRunning);
    }

    #[test]
    fn running_daemons_filters_jps_noise() {
        let jps = "1234 NameNode\n2345 Jps\n3456 ResourceManager\n4567 SomethingElse\n";
        assert_eq!(running_daemons(jps), vec!["NameNode", "ResourceManager"]);
    }
}
