//! Push the installed software and its environment to every worker.
//!
//! Workers are processed strictly one at a time, in configuration order; the first failure
//! aborts the remaining workers (fail-fast -- there is no per-worker retry or partial-success
//! continuation). Each worker gets the install trees mirrored into a staging directory under
//! the service account's home over the trust channel, then a remote sudo step moves the staged
//! trees into their final system paths. Daemons must not be running during distribution: the
//! delete-then-recreate of the target directory is not an atomic swap.

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::{clap_app, ArgMatches};
use failure_derive::Fail;
use log::warn;
use spurs::{cmd, Execute, SshShell};

use crate::common;
use crate::common::output::RunLog;
use crate::config::ClusterConfig;
use crate::nodes::{ClusterNodes, Node};
use crate::remote::{remote_run, remote_sudo, sh_quote, try_remote_sudo, RemoteCmd};

#[derive(Debug, Fail)]
#[fail(display = "{} is not installed locally (run `install` first)", name)]
pub struct NotInstalled {
    name: String,
}

const ARTIFACT_NAMES: &[&str] = &["jdk", "hadoop", "spark"];

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { distribute =>
        (about: "Mirror the installed JDK/Hadoop/Spark trees and the environment snippet to \
                 every worker and move them into place under remote sudo. Workers are handled \
                 one at a time; the first failure aborts the rest.")
    }
}

pub fn run(
    _sub_m: &ArgMatches<'_>,
    cfg: &ClusterConfig,
    log: &RunLog,
) -> Result<(), failure::Error> {
    let nodes = ClusterNodes::from_config(cfg);
    nodes.check_resolvable(cfg.ssh_port)?;

    // Resolve the active versions up front so a missing install fails before any worker is
    // touched.
    let mut targets = Vec::new();
    for name in ARTIFACT_NAMES {
        targets.push((*name, active_version(cfg, name)?));
    }

    for_each_worker(&nodes.workers, |worker| {
        log.note(&format!("distributing to {}", worker.hostname));
        distribute_to(cfg, &nodes, worker, &targets)?;
        log.note(&format!("{}: distribution complete", worker.hostname));
        Ok(())
    })
}

/// Apply `f` to each worker in fixed order, aborting on the first failure.
fn for_each_worker<F>(workers: &[Node], mut f: F) -> Result<(), failure::Error>
where
    F: FnMut(&Node) -> Result<(), failure::Error>,
{
    for worker in workers {
        f(worker)?;
    }
    Ok(())
}

/// The versioned directory the stable symlink currently points at.
fn active_version(cfg: &ClusterConfig, name: &str) -> Result<PathBuf, failure::Error> {
    let symlink = cfg.install_base.join(name);
    std::fs::read_link(&symlink).map_err(|_| NotInstalled { name: name.into() }.into())
}

fn distribute_to(
    cfg: &ClusterConfig,
    nodes: &ClusterNodes,
    worker: &Node,
    targets: &[(&str, PathBuf)],
) -> Result<(), failure::Error> {
    let shell = common::connect_worker(cfg, worker)?;

    let home = common::get_user_home_dir(&shell)?;
    let stage = format!("{}/{}", home, common::STAGING_DIR_NAME);
    remote_run(&shell, &RemoteCmd::new("mkdir").arg("-p").arg(&stage))?;

    // Stage: mirror each install tree and the environment snippet into the worker's home.
    for (name, target) in targets {
        let dirname = versioned_dirname(target)?;
        let remote_dir = format!("{}/{}", stage, dirname);
        common::run_local(
            &format!("rsync {}", name),
            Command::new("rsync").args(rsync_args(
                cfg.ssh_port,
                &format!("{}/", target.display()),
                &format!("{}@{}:{}/", cfg.cluster_user, worker.hostname, remote_dir),
            )),
        )?;
    }

    common::run_local(
        "rsync env snippet",
        Command::new("rsync").args(rsync_args(
            cfg.ssh_port,
            common::PROFILE_SNIPPET_PATH,
            &format!("{}@{}:{}/", cfg.cluster_user, worker.hostname, stage),
        )),
    )?;

    // Promote: under remote sudo, recreate each target from its staged copy and repoint the
    // stable symlink.
    for (name, target) in targets {
        let dirname = versioned_dirname(target)?;
        remote_sudo(
            &shell,
            &cfg.sudo_mode,
            &RemoteCmd::shell(promote_script(
                &stage,
                &dirname,
                &cfg.install_base,
                name,
            )),
        )?;
    }

    // Environment snippet into the system profile directory.
    remote_sudo(
        &shell,
        &cfg.sudo_mode,
        &RemoteCmd::new("install")
            .arg("-m")
            .arg("0644")
            .arg(format!("{}/{}", stage, common::profile_snippet_name()))
            .arg(common::PROFILE_SNIPPET_PATH),
    )?;

    // Service account and data directories. The `useradd` arm only fires on a worker that was
    // reached through a different admin account.
    remote_sudo(
        &shell,
        &cfg.sudo_mode,
        &RemoteCmd::shell(format!(
            "id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}",
            user = sh_quote(&cfg.cluster_user)
        )),
    )?;

    let data_dirs = format!(
        "{} {} {} {}",
        sh_quote(&cfg.namenode_dir.display().to_string()),
        sh_quote(&cfg.datanode_dir.display().to_string()),
        sh_quote(&cfg.hadoop_tmp_dir.display().to_string()),
        sh_quote(&cfg.spark_eventlog_dir.display().to_string()),
    );
    remote_sudo(
        &shell,
        &cfg.sudo_mode,
        &RemoteCmd::shell(format!(
            "mkdir -p {dirs} && chown -R {user}:{user} {dirs}",
            dirs = data_dirs,
            user = sh_quote(&cfg.cluster_user)
        )),
    )?;

    for (_, target) in targets {
        let dirname = versioned_dirname(target)?;
        remote_sudo(
            &shell,
            &cfg.sudo_mode,
            &RemoteCmd::new("chown")
                .arg("-R")
                .arg(format!("{0}:{0}", cfg.cluster_user))
                .arg(format!("{}/{}", cfg.install_base.display(), dirname)),
        )?;
    }

    // Cluster hosts block, same markers as the master's /etc/hosts.
    remote_sudo(
        &shell,
        &cfg.sudo_mode,
        &RemoteCmd::shell(hosts_block_script(common::HOSTS_FILE, &nodes.hosts_block())),
    )?;

    // Advisory validation: a login shell must see the expected executables on PATH. Failures
    // are logged, not fatal -- the install itself already succeeded.
    validate(&shell, cfg, worker);

    Ok(())
}

fn versioned_dirname(target: &Path) -> Result<String, failure::Error> {
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            NotInstalled {
                name: target.display().to_string(),
            }
            .into()
        })
}

fn rsync_args(port: u16, src: &str, dest: &str) -> Vec<String> {
    vec![
        "-a".to_owned(),
        "--delete".to_owned(),
        "-e".to_owned(),
        format!("ssh -p {}", port),
        src.to_owned(),
        dest.to_owned(),
    ]
}

/// Recreate the versioned install directory from its staged copy and repoint the stable
/// symlink. Delete-then-recreate, not a swap; the daemons are down during distribution.
fn promote_script(stage: &str, dirname: &str, install_base: &Path, name: &str) -> String {
    let staged = sh_quote(&format!("{}/{}", stage, dirname));
    let target = sh_quote(&format!("{}/{}", install_base.display(), dirname));
    let symlink = sh_quote(&format!("{}/{}", install_base.display(), name));

    format!(
        "rm -rf {target} && cp -a {staged} {target} && rm -f {symlink} && ln -s {target} {symlink}",
        staged = staged,
        target = target,
        symlink = symlink,
    )
}

/// Replace the managed hosts block on the worker: drop the old region, append the new one.
/// A begin marker with no matching end marker aborts before the delete -- the sed range would
/// otherwise run to end-of-file and take operator content with it. The local writer treats the
/// same situation as fatal.
fn hosts_block_script(hosts_file: &str, block: &str) -> String {
    format!(
        "if grep -qxF {begin_q} {file} && ! grep -qxF {end_q} {file}; then exit 1; fi && \
         sed -i '/^{begin}$/,/^{end}$/d' {file} && printf '%s' {content} >> {file}",
        file = sh_quote(hosts_file),
        begin_q = sh_quote(common::HOSTS_BEGIN_MARKER),
        end_q = sh_quote(common::HOSTS_END_MARKER),
        begin = common::HOSTS_BEGIN_MARKER.replace('/', r"\/"),
        end = common::HOSTS_END_MARKER.replace('/', r"\/"),
        content = sh_quote(&format!(
            "{}\n{}{}\n",
            common::HOSTS_BEGIN_MARKER,
            block,
            common::HOSTS_END_MARKER
        )),
    )
}

fn validate(shell: &SshShell, cfg: &ClusterConfig, worker: &Node) {
    let probe = "command -v java && command -v hdfs && command -v spark-submit";
    match shell.run(cmd!("bash -lc {}", sh_quote(probe))) {
        Ok(_) => {}
        Err(err) => warn!(
            "(tolerated) {}: environment validation failed: {}",
            worker.hostname, err
        ),
    }

    let _ = try_remote_sudo(
        shell,
        &cfg.sudo_mode,
        &RemoteCmd::new("ls").arg(cfg.install_base.display().to_string()),
    );
}
