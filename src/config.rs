//! Loading and validation of the cluster configuration file.
//!
//! The configuration is a flat shell-style `KEY=value` file. It is parsed and validated exactly
//! once at startup into a `ClusterConfig`, which is then passed by reference to every routine.
//! Nothing in the rest of the program consults ambient state.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use failure_derive::Fail;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "cannot read configuration file {}: {}", path, reason)]
    Unreadable { path: String, reason: String },

    #[fail(display = "missing required configuration key `{}`", key)]
    MissingKey { key: String },

    #[fail(display = "invalid value for `{}`: {}", key, reason)]
    InvalidValue { key: String, reason: String },
}

/// One cluster member: a hostname and the IPv4 address it must resolve to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSpec {
    pub hostname: String,
    pub ip: Ipv4Addr,
}

/// How the service account's public key is propagated to the workers.
#[derive(Debug, Clone)]
pub enum SshMode {
    /// `ssh-copy-id`; the operator types each worker password.
    CopyId,
    /// `sshpass -p <password> ssh-copy-id`; fully unattended.
    Sshpass { password: String },
}

/// How privilege is escalated on the workers.
///
/// `Scripted` pipes the configured plaintext password to `sudo -S` on the remote side. Storing
/// that password in the configuration file is a deliberate tradeoff for unattended runs and is
/// the single largest security liability in this tool. Prefer `Interactive` for supervised use.
#[derive(Debug, Clone)]
pub enum SudoMode {
    Interactive,
    Scripted { password: String },
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_user: String,
    pub master: HostSpec,
    pub workers: Vec<HostSpec>,

    pub ssh_port: u16,
    pub ssh_mode: SshMode,
    pub sudo_mode: SudoMode,

    pub jdk_url: String,
    pub hadoop_url: String,
    pub spark_url: String,

    pub cache_dir: PathBuf,
    pub install_base: PathBuf,
    pub log_dir: PathBuf,

    pub dfs_replication: u32,
    pub namenode_port: u16,
    pub namenode_dir: PathBuf,
    pub datanode_dir: PathBuf,
    pub hadoop_tmp_dir: PathBuf,
    pub spark_eventlog_dir: PathBuf,

    pub extra_core_site: Vec<(String, String)>,
    pub extra_hdfs_site: Vec<(String, String)>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, failure::Error> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_str(&text)
    }

    fn from_str(text: &str) -> Result<Self, failure::Error> {
        let raw = Raw(parse_kv(text));

        let master = HostSpec {
            hostname: raw.required("MASTER_HOSTNAME")?.to_owned(),
            ip: raw.parse_ip("MASTER_IP")?,
        };

        let workers = raw.workers()?;

        let ssh_mode = match raw.get_or("SSH_MODE", "copy-id") {
            "copy-id" => SshMode::CopyId,
            "sshpass" => SshMode::Sshpass {
                password: raw.required("SSH_PASSWORD")?.to_owned(),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "SSH_MODE".into(),
                    reason: format!("expected `copy-id` or `sshpass`, got `{}`", other),
                }
                .into());
            }
        };

        let sudo_mode = match raw.get_or("SUDO_MODE", "interactive") {
            "interactive" => SudoMode::Interactive,
            "scripted" => SudoMode::Scripted {
                password: raw.required("SUDO_PASSWORD")?.to_owned(),
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "SUDO_MODE".into(),
                    reason: format!("expected `interactive` or `scripted`, got `{}`", other),
                }
                .into());
            }
        };

        Ok(ClusterConfig {
            cluster_user: raw.required("CLUSTER_USER")?.to_owned(),
            master,
            workers,

            ssh_port: raw.parse_u16_or("SSH_PORT", 22)?,
            ssh_mode,
            sudo_mode,

            jdk_url: raw.required("JDK_URL")?.to_owned(),
            hadoop_url: raw.required("HADOOP_URL")?.to_owned(),
            spark_url: raw.required("SPARK_URL")?.to_owned(),

            cache_dir: raw.path_or("CACHE_DIR", "/var/cache/clusterup"),
            install_base: raw.path_or("INSTALL_BASE", "/opt"),
            log_dir: raw.path_or("LOG_DIR", "/var/log/clusterup"),

            dfs_replication: raw.parse_u32_or("DFS_REPLICATION", 2)?,
            namenode_port: raw.parse_u16_or("NAMENODE_PORT", 9000)?,
            namenode_dir: raw.path_or("NAMENODE_DIR", "/var/lib/hadoop/namenode"),
            datanode_dir: raw.path_or("DATANODE_DIR", "/var/lib/hadoop/datanode"),
            hadoop_tmp_dir: raw.path_or("HADOOP_TMP_DIR", "/var/lib/hadoop/tmp"),
            spark_eventlog_dir: raw.path_or("SPARK_EVENTLOG_DIR", "/var/log/spark-events"),

            extra_core_site: raw.parse_pairs("EXTRA_CORE_SITE")?,
            extra_hdfs_site: raw.parse_pairs("EXTRA_HDFS_SITE")?,
        })
    }

    /// A JSON snapshot of the loaded configuration for the run log. Passwords are redacted.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "cluster_user": self.cluster_user,
            "master": self.master,
            "workers": self.workers,
            "ssh_port": self.ssh_port,
            "ssh_mode": match self.ssh_mode {
                SshMode::CopyId => "copy-id",
                SshMode::Sshpass { .. } => "sshpass",
            },
            "sudo_mode": match self.sudo_mode {
                SudoMode::Interactive => "interactive",
                SudoMode::Scripted { .. } => "scripted",
            },
            "jdk_url": self.jdk_url,
            "hadoop_url": self.hadoop_url,
            "spark_url": self.spark_url,
            "cache_dir": self.cache_dir,
            "install_base": self.install_base,
            "log_dir": self.log_dir,
            "dfs_replication": self.dfs_replication,
            "namenode_port": self.namenode_port,
            "namenode_dir": self.namenode_dir,
            "datanode_dir": self.datanode_dir,
            "hadoop_tmp_dir": self.hadoop_tmp_dir,
            "spark_eventlog_dir": self.spark_eventlog_dir,
            "extra_core_site": self.extra_core_site,
            "extra_hdfs_site": self.extra_hdfs_site,
        })
    }

    // Derived paths. The stable symlinks live directly under the install base; everything else
    // references the version-independent location.

    pub fn jdk_home(&self) -> PathBuf {
        self.install_base.join("jdk")
    }

    pub fn hadoop_home(&self) -> PathBuf {
        self.install_base.join("hadoop")
    }

    pub fn spark_home(&self) -> PathBuf {
        self.install_base.join("spark")
    }

    pub fn hadoop_conf_dir(&self) -> PathBuf {
        self.hadoop_home().join("etc/hadoop")
    }

    pub fn spark_conf_dir(&self) -> PathBuf {
        self.spark_home().join("conf")
    }
}

/// Parse the `KEY=value` lines into a map. Later assignments override earlier ones. A leading
/// `export ` is tolerated so the same file can still be sourced by a shell.
fn parse_kv(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_owned(), unquote(value.trim()).to_owned());
        }
    }

    map
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

struct Raw(BTreeMap<String, String>);

impl Raw {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn get_or<'s>(&'s self, key: &str, default: &'s str) -> &'s str {
        self.get(key).unwrap_or(default)
    }

    fn required(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            key: key.to_owned(),
        })
    }

    fn path_or(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get_or(key, default))
    }

    fn parse_ip(&self, key: &str) -> Result<Ipv4Addr, ConfigError> {
        self.required(key)?
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                reason: format!("not an IPv4 address: `{}`", self.get(key).unwrap()),
            })
    }

    fn parse_u16_or(&self, key: &str, default: u16) -> Result<u16, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                reason: format!("not a port number: `{}`", v),
            }),
        }
    }

    fn parse_u32_or(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                reason: format!("not a number: `{}`", v),
            }),
        }
    }

    /// Parse a list-of-pair value: whitespace-separated `name=value` items.
    fn parse_pairs(&self, key: &str) -> Result<Vec<(String, String)>, ConfigError> {
        let mut pairs = Vec::new();

        if let Some(v) = self.get(key) {
            for item in v.split_whitespace() {
                match item.split_once('=') {
                    Some((name, value)) if !name.is_empty() => {
                        pairs.push((name.to_owned(), value.to_owned()));
                    }
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_owned(),
                            reason: format!("expected `name=value` items, got `{}`", item),
                        });
                    }
                }
            }
        }

        Ok(pairs)
    }

    /// Collect `WORKER<N>_HOSTNAME`/`WORKER<N>_IP` for N = 1.. The numbering must be contiguous
    /// and at least one worker must be declared.
    fn workers(&self) -> Result<Vec<HostSpec>, ConfigError> {
        let mut workers = Vec::new();

        for n in 1.. {
            let host_key = format!("WORKER{}_HOSTNAME", n);
            let ip_key = format!("WORKER{}_IP", n);

            match self.get(&host_key) {
                Some(hostname) => {
                    workers.push(HostSpec {
                        hostname: hostname.to_owned(),
                        ip: self.parse_ip(&ip_key)?,
                    });
                }
                None => {
                    if self.get(&ip_key).is_some() {
                        return Err(ConfigError::MissingKey { key: host_key });
                    }
                    break;
                }
            }
        }

        if workers.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "WORKER1_HOSTNAME".into(),
            });
        }

        // A gap in the numbering would silently drop the workers above it.
        let next = workers.len() + 1;
        if let Some(stray) = self
            .0
            .keys()
            .find(|k| is_stray_worker_key(k, next))
        {
            return Err(ConfigError::InvalidValue {
                key: stray.clone(),
                reason: format!("worker numbering is not contiguous (expected WORKER{})", next),
            });
        }

        Ok(workers)
    }
}

fn is_stray_worker_key(key: &str, next: usize) -> bool {
    let rest = match key.strip_prefix("WORKER") {
        Some(rest) => rest,
        None => return false,
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<usize>() {
        Ok(n) => n > next,
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
        # cluster identity
        CLUSTER_USER=hadoop
        MASTER_HOSTNAME=master
        MASTER_IP=192.168.10.10
        WORKER1_HOSTNAME=worker1
        WORKER1_IP=192.168.10.11
        WORKER2_HOSTNAME="worker2"
        WORKER2_IP=192.168.10.12

        export JDK_URL=https://example.com/jdk-17.0.2_linux-x64_bin.tar.gz
        HADOOP_URL=https://example.com/hadoop-3.3.6.tar.gz
        SPARK_URL=https://example.com/spark-3.5.1-bin-hadoop3.tgz
    "#;

    #[test]
    fn minimal_config_with_defaults() {
        let cfg = ClusterConfig::from_str(MINIMAL).unwrap();

        assert_eq!(cfg.cluster_user, "hadoop");
        assert_eq!(cfg.master.hostname, "master");
        assert_eq!(cfg.master.ip, "192.168.10.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.workers[1].hostname, "worker2"); // quotes stripped

        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.dfs_replication, 2);
        assert!(matches!(cfg.ssh_mode, SshMode::CopyId));
        assert!(matches!(cfg.sudo_mode, SudoMode::Interactive));
        assert_eq!(cfg.install_base, PathBuf::from("/opt"));
        assert_eq!(cfg.hadoop_conf_dir(), PathBuf::from("/opt/hadoop/etc/hadoop"));
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let text = MINIMAL.replace("CLUSTER_USER=hadoop", "");
        let err = ClusterConfig::from_str(&text).unwrap_err();
        let err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(
            err,
            ConfigError::MissingKey { key } if key == "CLUSTER_USER"
        ));
    }

    #[test]
    fn sshpass_mode_requires_password() {
        let text = format!("{}\nSSH_MODE=sshpass\n", MINIMAL);
        let err = ClusterConfig::from_str(&text).unwrap_err();
        let err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(
            err,
            ConfigError::MissingKey { key } if key == "SSH_PASSWORD"
        ));

        let text = format!("{}\nSSH_MODE=sshpass\nSSH_PASSWORD=hunter2\n", MINIMAL);
        let cfg = ClusterConfig::from_str(&text).unwrap();
        assert!(matches!(cfg.ssh_mode, SshMode::Sshpass { ref password } if password == "hunter2"));
    }

    #[test]
    fn bad_ip_is_invalid_value() {
        let text = MINIMAL.replace("192.168.10.11", "not-an-ip");
        let err = ClusterConfig::from_str(&text).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn non_contiguous_workers_rejected() {
        let text = format!(
            "{}\nWORKER5_HOSTNAME=worker5\nWORKER5_IP=192.168.10.15\n",
            MINIMAL
        );
        let err = ClusterConfig::from_str(&text).unwrap_err();
        let err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn extra_property_pairs() {
        let text = format!(
            "{}\nEXTRA_CORE_SITE='io.file.buffer.size=131072 hadoop.proxyuser.hue.hosts=*'\n",
            MINIMAL
        );
        let cfg = ClusterConfig::from_str(&text).unwrap();
        assert_eq!(
            cfg.extra_core_site,
            vec![
                ("io.file.buffer.size".to_owned(), "131072".to_owned()),
                ("hadoop.proxyuser.hue.hosts".to_owned(), "*".to_owned()),
            ]
        );
    }

    #[test]
    fn snapshot_redacts_secrets() {
        let text = format!(
            "{}\nSSH_MODE=sshpass\nSSH_PASSWORD=hunter2\nSUDO_MODE=scripted\nSUDO_PASSWORD=hunter3\n",
            MINIMAL
        );
        let cfg = ClusterConfig::from_str(&text).unwrap();
        let snapshot = cfg.snapshot().to_string();
        assert!(!snapshot.contains("hunter2"));
        assert!(!snapshot.contains("hunter3"));
        assert!(snapshot.contains("sshpass"));
        assert!(snapshot.contains("scripted"));
    }

    #[test]
    fn snapshot_records_every_setting() {
        let text = format!("{}\nEXTRA_CORE_SITE='io.file.buffer.size=131072'\n", MINIMAL);
        let cfg = ClusterConfig::from_str(&text).unwrap();
        let snapshot = cfg.snapshot();

        for key in &[
            "cluster_user",
            "master",
            "workers",
            "ssh_port",
            "ssh_mode",
            "sudo_mode",
            "jdk_url",
            "hadoop_url",
            "spark_url",
            "cache_dir",
            "install_base",
            "log_dir",
            "dfs_replication",
            "namenode_port",
            "namenode_dir",
            "datanode_dir",
            "hadoop_tmp_dir",
            "spark_eventlog_dir",
            "extra_core_site",
            "extra_hdfs_site",
        ] {
            assert!(snapshot.get(key).is_some(), "snapshot missing `{}`", key);
        }

        assert_eq!(snapshot["extra_core_site"][0][0], "io.file.buffer.size");
        assert_eq!(snapshot["extra_core_site"][0][1], "131072");
    }
}
