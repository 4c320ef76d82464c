//! A library of routines shared by all of the cluster bootstrap actions.

pub mod output;

use std::process::{Command, Stdio};

use failure_derive::Fail;
use log::{debug, warn};
use spurs::{cmd, Execute, SshShell};

use crate::config::ClusterConfig;
use crate::nodes::Node;

/// Path of the wholly-generated environment snippet installed on every node.
pub const PROFILE_SNIPPET_PATH: &str = "/etc/profile.d/hadoop-cluster.sh";

/// The snippet's basename, as it appears inside a worker's staging directory.
pub fn profile_snippet_name() -> &'static str {
    std::path::Path::new(PROFILE_SNIPPET_PATH)
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or(PROFILE_SNIPPET_PATH)
}

/// The system hosts file patched with the managed cluster block.
pub const HOSTS_FILE: &str = "/etc/hosts";

/// Markers delimiting the managed block in the system hosts file.
pub const HOSTS_BEGIN_MARKER: &str = "# BEGIN clusterup hosts";
pub const HOSTS_END_MARKER: &str = "# END clusterup hosts";

/// Markers delimiting the managed worker list in the Hadoop `workers` file.
pub const WORKERS_BEGIN_MARKER: &str = "# BEGIN clusterup workers";
pub const WORKERS_END_MARKER: &str = "# END clusterup workers";

/// Markers delimiting the managed block in `spark-defaults.conf`.
pub const SPARK_BEGIN_MARKER: &str = "# BEGIN clusterup spark defaults";
pub const SPARK_END_MARKER: &str = "# END clusterup spark defaults";

/// Markers delimiting the managed block in `hadoop-env.sh`.
pub const HADOOP_ENV_BEGIN_MARKER: &str = "# BEGIN clusterup hadoop env";
pub const HADOOP_ENV_END_MARKER: &str = "# END clusterup hadoop env";

/// Name of the staging directory created under the worker service account's home.
pub const STAGING_DIR_NAME: &str = "clusterup-stage";

#[derive(Debug, Fail)]
pub enum LocalCmdError {
    #[fail(display = "`{}` exited with {}: {}", desc, status, stderr)]
    Failed {
        desc: String,
        status: i32,
        stderr: String,
    },

    #[fail(display = "`{}` was killed by a signal", desc)]
    Killed { desc: String },
}

#[derive(Debug, Fail)]
#[fail(display = "this action mutates system paths and must run as root (try sudo)")]
pub struct NotRoot;

/// Abort early if we are not root. `install` writes under the install base, `/etc/profile.d`,
/// and the hosts file, so there is no point starting without privilege.
pub fn ensure_root() -> Result<(), failure::Error> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(NotRoot.into());
    }
    Ok(())
}

/// Run a local command, capturing output. Any non-zero exit is an error; call sites that want to
/// tolerate failure use `try_run_local` instead.
pub fn run_local(desc: &str, cmd: &mut Command) -> Result<std::process::Output, failure::Error> {
    debug!("local: {:?}", cmd);

    let out = cmd.output()?;

    if out.status.success() {
        Ok(out)
    } else {
        match out.status.code() {
            Some(code) => Err(LocalCmdError::Failed {
                desc: desc.into(),
                status: code,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }
            .into()),
            None => Err(LocalCmdError::Killed { desc: desc.into() }.into()),
        }
    }
}

/// Run a local command with inherited stdio, for commands that prompt the operator (e.g.
/// `ssh-copy-id` asking for a password).
pub fn run_local_interactive(desc: &str, cmd: &mut Command) -> Result<(), failure::Error> {
    debug!("local (interactive): {:?}", cmd);

    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(LocalCmdError::Failed {
                desc: desc.into(),
                status: code,
                stderr: String::new(),
            }
            .into()),
            None => Err(LocalCmdError::Killed { desc: desc.into() }.into()),
        }
    }
}

/// The log-and-continue variant of `run_local`: failures are observed but never escalated.
pub fn try_run_local(desc: &str, cmd: &mut Command) -> Option<std::process::Output> {
    match run_local(desc, cmd) {
        Ok(out) => Some(out),
        Err(err) => {
            warn!("(tolerated) {}", err);
            None
        }
    }
}

/// Open a shell to the given worker as the cluster service account over the trust channel.
pub fn connect_worker(cfg: &ClusterConfig, node: &Node) -> Result<SshShell, failure::Error> {
    debug!(
        "connecting to {}@{}:{}",
        cfg.cluster_user, node.hostname, cfg.ssh_port
    );
    let shell = SshShell::with_default_key(
        &cfg.cluster_user,
        (node.hostname.as_str(), cfg.ssh_port),
    )?;
    Ok(shell)
}

/// Get the path of the remote user's home directory.
pub fn get_user_home_dir(shell: &SshShell) -> Result<String, failure::Error> {
    let user_home = shell.run(cmd!("echo $HOME").use_bash())?;
    Ok(user_home.stdout.trim().to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snippet_name_is_the_path_basename() {
        assert_eq!(profile_snippet_name(), "hadoop-cluster.sh");
        assert!(PROFILE_SNIPPET_PATH.ends_with(profile_snippet_name()));
    }
}
