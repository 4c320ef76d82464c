//! Establish passwordless SSH from the master's service account to every worker.
//!
//! A trust relation is considered established once our public key is in the worker account's
//! authorized_keys and the worker's host key is in our known_hosts. Re-running is idempotent:
//! `ssh-copy-id` de-duplicates authorized_keys entries, and the known_hosts file is only
//! appended to when the host key is genuinely absent.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use clap::{clap_app, ArgMatches};
use failure_derive::Fail;

use crate::common::output::RunLog;
use crate::common::{run_local, run_local_interactive};
use crate::config::{ClusterConfig, SshMode};
use crate::nodes::{ClusterNodes, Node};

#[derive(Debug, Fail)]
pub enum TrustError {
    #[fail(display = "cannot locate the service account home directory (HOME is unset)")]
    NoHome,

    #[fail(
        display = "passwordless SSH to {}@{} still fails after key propagation",
        user, host
    )]
    VerifyFailed { user: String, host: String },
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { trust =>
        (about: "Generate the service account SSH keypair (if needed) and propagate the public \
                 key to every worker. With SSH_MODE=copy-id you will be prompted for each \
                 worker's password; SSH_MODE=sshpass runs unattended.")
    }
}

pub fn run(
    _sub_m: &ArgMatches<'_>,
    cfg: &ClusterConfig,
    log: &RunLog,
) -> Result<(), failure::Error> {
    let nodes = ClusterNodes::from_config(cfg);
    nodes.check_resolvable(cfg.ssh_port)?;

    let ssh_dir = ssh_dir()?;
    let key = ensure_keypair(&ssh_dir, log)?;

    for worker in &nodes.workers {
        log.note(&format!("establishing trust with {}", worker.hostname));

        ensure_known_host(&ssh_dir, cfg, worker)?;
        propagate_key(cfg, worker, &key)?;
        verify(cfg, worker)?;

        log.note(&format!("trust established with {}", worker.hostname));
    }

    Ok(())
}

fn ssh_dir() -> Result<PathBuf, failure::Error> {
    let home = std::env::var("HOME").map_err(|_| TrustError::NoHome)?;
    Ok(PathBuf::from(home).join(".ssh"))
}

/// Generate an RSA keypair for the service account if one does not exist yet.
fn ensure_keypair(ssh_dir: &PathBuf, log: &RunLog) -> Result<PathBuf, failure::Error> {
    std::fs::create_dir_all(ssh_dir)?;

    let key = ssh_dir.join("id_rsa");
    if key.exists() {
        return Ok(key);
    }

    log.note("generating service account keypair");
    run_local(
        "ssh-keygen",
        Command::new("ssh-keygen")
            .arg("-t")
            .arg("rsa")
            .arg("-b")
            .arg("4096")
            .arg("-N")
            .arg("")
            .arg("-q")
            .arg("-f")
            .arg(&key),
    )?;

    Ok(key)
}

/// Make sure the worker's host key is in known_hosts, scanning it only when absent so repeated
/// runs don't accumulate duplicates.
fn ensure_known_host(
    ssh_dir: &PathBuf,
    cfg: &ClusterConfig,
    worker: &Node,
) -> Result<(), failure::Error> {
    let known_hosts = ssh_dir.join("known_hosts");

    let lookup = known_hosts_name(&worker.hostname, cfg.ssh_port);
    let present = Command::new("ssh-keygen")
        .arg("-f")
        .arg(&known_hosts)
        .arg("-F")
        .arg(&lookup)
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    let scanned = run_local(
        "ssh-keyscan",
        Command::new("ssh-keyscan")
            .arg("-p")
            .arg(cfg.ssh_port.to_string())
            .arg("-H")
            .arg(&worker.hostname),
    )?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&known_hosts)?;
    file.write_all(&scanned.stdout)?;

    Ok(())
}

/// The name `ssh-keygen -F` expects: bare hostname for port 22, `[host]:port` otherwise.
fn known_hosts_name(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_owned()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

fn propagate_key(
    cfg: &ClusterConfig,
    worker: &Node,
    key: &PathBuf,
) -> Result<(), failure::Error> {
    let dest = format!("{}@{}", cfg.cluster_user, worker.hostname);

    match &cfg.ssh_mode {
        SshMode::CopyId => {
            // The operator answers the worker's password prompt.
            run_local_interactive(
                "ssh-copy-id",
                Command::new("ssh-copy-id")
                    .arg("-i")
                    .arg(key)
                    .arg("-p")
                    .arg(cfg.ssh_port.to_string())
                    .arg(&dest),
            )
        }
        SshMode::Sshpass { password } => run_local(
            "sshpass ssh-copy-id",
            Command::new("sshpass")
                .arg("-p")
                .arg(password)
                .arg("ssh-copy-id")
                .arg("-i")
                .arg(key)
                .arg("-p")
                .arg(cfg.ssh_port.to_string())
                .arg("-o")
                .arg("StrictHostKeyChecking=accept-new")
                .arg(&dest),
        )
        .map(|_| ()),
    }
}

/// The relation only counts as established once a batch-mode (no prompts allowed) probe works.
fn verify(cfg: &ClusterConfig, worker: &Node) -> Result<(), failure::Error> {
    let status = Command::new("ssh")
        .arg("-p")
        .arg(cfg.ssh_port.to_string())
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(format!("{}@{}", cfg.cluster_user, worker.hostname))
        .arg("true")
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(TrustError::VerifyFailed {
            user: cfg.cluster_user.clone(),
            host: worker.hostname.clone(),
        }
        .into())
    }
}

#[cfg(test)]
mod test {
    use super::known_hosts_name;

    #[test]
    fn known_hosts_lookup_names() {
        assert_eq!(known_hosts_name("worker1", 22), "worker1");
        assert_eq!(known_hosts_name("worker1", 2222), "[worker1]:2222");
    }
}
