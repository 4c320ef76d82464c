//! Role to hostname/IP mapping for the cluster members, and the resolvability check that gates
//! every remote operation.

use std::net::ToSocketAddrs;

use failure_derive::Fail;

use crate::config::ClusterConfig;

#[derive(Debug, Fail)]
pub enum NodesError {
    #[fail(
        display = "hostname `{}` ({}) does not resolve; fix DNS or run `install --module hosts` first",
        hostname, role
    )]
    Unresolvable { role: NodeRole, hostname: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Worker(usize),
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker(n) => write!(f, "worker{}", n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub role: NodeRole,
    pub hostname: String,
    pub ip: std::net::Ipv4Addr,
}

/// The full set of cluster members. Each role maps to exactly one hostname and one address.
#[derive(Debug, Clone)]
pub struct ClusterNodes {
    pub master: Node,
    pub workers: Vec<Node>,
}

impl ClusterNodes {
    pub fn from_config(cfg: &ClusterConfig) -> Self {
        ClusterNodes {
            master: Node {
                role: NodeRole::Master,
                hostname: cfg.master.hostname.clone(),
                ip: cfg.master.ip,
            },
            workers: cfg
                .workers
                .iter()
                .enumerate()
                .map(|(i, w)| Node {
                    role: NodeRole::Worker(i + 1),
                    hostname: w.hostname.clone(),
                    ip: w.ip,
                })
                .collect(),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.master).chain(self.workers.iter())
    }

    /// Verify that every member hostname resolves. Called before any remote operation; a single
    /// unresolvable member is fatal.
    pub fn check_resolvable(&self, port: u16) -> Result<(), failure::Error> {
        for node in self.all() {
            if (node.hostname.as_str(), port).to_socket_addrs().is_err() {
                return Err(NodesError::Unresolvable {
                    role: node.role,
                    hostname: node.hostname.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// The managed block for the system hosts file: one `ip<TAB>hostname` line per member.
    pub fn hosts_block(&self) -> String {
        let mut block = String::new();
        for node in self.all() {
            block.push_str(&format!("{}\t{}\n", node.ip, node.hostname));
        }
        block
    }

    /// The managed block for the Hadoop `workers` file: one worker hostname per line.
    pub fn workers_block(&self) -> String {
        let mut block = String::new();
        for node in &self.workers {
            block.push_str(&node.hostname);
            block.push('\n');
        }
        block
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::HostSpec;

    fn nodes() -> ClusterNodes {
        let cfg = ClusterConfig {
            cluster_user: "hadoop".into(),
            master: HostSpec {
                hostname: "master".into(),
                ip: "192.168.10.10".parse().unwrap(),
            },
            workers: vec![
                HostSpec {
                    hostname: "worker1".into(),
                    ip: "192.168.10.11".parse().unwrap(),
                },
                HostSpec {
                    hostname: "worker2".into(),
                    ip: "192.168.10.12".parse().unwrap(),
                },
            ],
            ssh_port: 22,
            ssh_mode: crate::config::SshMode::CopyId,
            sudo_mode: crate::config::SudoMode::Interactive,
            jdk_url: String::new(),
            hadoop_url: String::new(),
            spark_url: String::new(),
            cache_dir: "/var/cache/clusterup".into(),
            install_base: "/opt".into(),
            log_dir: "/var/log/clusterup".into(),
            dfs_replication: 2,
            namenode_port: 9000,
            namenode_dir: "/var/lib/hadoop/namenode".into(),
            datanode_dir: "/var/lib/hadoop/datanode".into(),
            hadoop_tmp_dir: "/var/lib/hadoop/tmp".into(),
            spark_eventlog_dir: "/var/log/spark-events".into(),
            extra_core_site: vec![],
            extra_hdfs_site: vec![],
        };
        ClusterNodes::from_config(&cfg)
    }

    #[test]
    fn roles_map_one_to_one() {
        let nodes = nodes();
        assert_eq!(nodes.master.role, NodeRole::Master);
        assert_eq!(nodes.workers[0].role, NodeRole::Worker(1));
        assert_eq!(nodes.workers[1].role, NodeRole::Worker(2));
        assert_eq!(nodes.all().count(), 3);
    }

    #[test]
    fn hosts_block_lists_every_member() {
        let block = nodes().hosts_block();
        assert_eq!(
            block,
            "192.168.10.10\tmaster\n192.168.10.11\tworker1\n192.168.10.12\tworker2\n"
        );
    }

    #[test]
    fn workers_block_lists_workers_only() {
        assert_eq!(nodes().workers_block(), "worker1\nworker2\n");
    }

    #[test]
    fn localhost_resolves() {
        let mut nodes = nodes();
        nodes.master.hostname = "localhost".into();
        nodes.workers.clear();
        nodes.check_resolvable(22).unwrap();
    }

    #[test]
    fn bogus_hostname_does_not_resolve() {
        let mut nodes = nodes();
        nodes.workers[0].hostname = "no-such-host.invalid.".into();
        let err = nodes.check_resolvable(22).unwrap_err();
        assert!(err.downcast_ref::<NodesError>().is_some());
    }
}
