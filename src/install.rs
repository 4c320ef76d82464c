//! Install the JDK/Hadoop/Spark tarballs on the master and write the managed configuration.
//!
//! Running twice with the same configuration is a no-op: artifact installs are skipped when the
//! versioned directory already exists, and the template writers only touch files whose managed
//! content actually changed.

use std::path::Path;
use std::process::Command;

use clap::{clap_app, ArgMatches};
use failure_derive::Fail;

use crate::artifact::{ensure_installed, ArtifactSpec, InstallOutcome};
use crate::common;
use crate::common::output::RunLog;
use crate::config::ClusterConfig;
use crate::nodes::ClusterNodes;
use crate::template;

#[derive(Debug, Fail)]
#[fail(
    display = "unknown install module `{}` (expected hosts|jdk|hadoop|spark|config)",
    module
)]
pub struct UnknownModule {
    module: String,
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { install =>
        (about: "Download and install the JDK/Hadoop/Spark tarballs on this (master) node and \
                 write the managed configuration files. Requires root.")
        (@arg FORCE: --force
         "Reinstall artifacts even if the versioned install directory already exists.")
        (@arg MODULE: --module +takes_value
         "Run only one module of the flow: hosts|jdk|hadoop|spark|config.")
    }
}

pub fn run(
    sub_m: &ArgMatches<'_>,
    cfg: &ClusterConfig,
    log: &RunLog,
) -> Result<(), failure::Error> {
    let force = sub_m.is_present("FORCE");
    let module = sub_m.value_of("MODULE");

    if let Some(module) = module {
        if !["hosts", "jdk", "hadoop", "spark", "config"].contains(&module) {
            return Err(UnknownModule {
                module: module.into(),
            }
            .into());
        }
    }

    common::ensure_root()?;

    let nodes = ClusterNodes::from_config(cfg);
    let selected = |name: &str| module.map_or(true, |m| m == name);

    if selected("hosts") {
        patch_hosts_file(&nodes, log)?;
    }

    // With the hosts block in place (or already present from an earlier run), every member must
    // resolve before anything else references the cluster hostnames.
    nodes.check_resolvable(cfg.ssh_port)?;

    for (name, url, marker_exe) in &[
        ("jdk", &cfg.jdk_url, "bin/java"),
        ("hadoop", &cfg.hadoop_url, "bin/hdfs"),
        ("spark", &cfg.spark_url, "bin/spark-submit"),
    ] {
        if selected(name) {
            install_artifact(cfg, name, url, marker_exe, force, log)?;
        }
    }

    if selected("config") {
        write_cluster_config(cfg, &nodes, log)?;
    }

    Ok(())
}

fn install_artifact(
    cfg: &ClusterConfig,
    name: &str,
    url: &str,
    marker_exe: &str,
    force: bool,
    log: &RunLog,
) -> Result<(), failure::Error> {
    let spec = ArtifactSpec {
        name: name.into(),
        url: url.into(),
        install_base: cfg.install_base.clone(),
        symlink: cfg.install_base.join(name),
        marker_exe: marker_exe.into(),
    };

    match ensure_installed(&spec, &cfg.cache_dir, force)? {
        InstallOutcome::Installed(target) => {
            log.note(&format!("{}: installed at {}", name, target.display()));
        }
        InstallOutcome::SkippedExisting(target) => {
            log.note(&format!(
                "{}: already installed at {}, skipped",
                name,
                target.display()
            ));
        }
    }

    Ok(())
}

/// Patch the managed block of the system hosts file so every member resolves locally.
fn patch_hosts_file(nodes: &ClusterNodes, log: &RunLog) -> Result<(), failure::Error> {
    let changed = template::upsert_marker_block(
        Path::new(common::HOSTS_FILE),
        common::HOSTS_BEGIN_MARKER,
        common::HOSTS_END_MARKER,
        &nodes.hosts_block(),
    )?;

    if changed {
        log.note("hosts: updated managed block in /etc/hosts");
    } else {
        log.note("hosts: /etc/hosts already up to date");
    }

    Ok(())
}

/// Write every managed configuration file through the targeted writers.
fn write_cluster_config(
    cfg: &ClusterConfig,
    nodes: &ClusterNodes,
    log: &RunLog,
) -> Result<(), failure::Error> {
    let conf = cfg.hadoop_conf_dir();
    let master = &cfg.master.hostname;

    // core-site.xml
    let core_site = conf.join("core-site.xml");
    template::upsert_property(
        &core_site,
        "fs.defaultFS",
        &format!("hdfs://{}:{}", master, cfg.namenode_port),
    )?;
    template::upsert_property(
        &core_site,
        "hadoop.tmp.dir",
        &cfg.hadoop_tmp_dir.display().to_string(),
    )?;
    for (name, value) in &cfg.extra_core_site {
        template::upsert_property(&core_site, name, value)?;
    }

    // hdfs-site.xml
    let hdfs_site = conf.join("hdfs-site.xml");
    template::upsert_property(&hdfs_site, "dfs.replication", &cfg.dfs_replication.to_string())?;
    template::upsert_property(
        &hdfs_site,
        "dfs.namenode.name.dir",
        &format!("file://{}", cfg.namenode_dir.display()),
    )?;
    template::upsert_property(
        &hdfs_site,
        "dfs.datanode.data.dir",
        &format!("file://{}", cfg.datanode_dir.display()),
    )?;
    for (name, value) in &cfg.extra_hdfs_site {
        template::upsert_property(&hdfs_site, name, value)?;
    }

    // yarn-site.xml
    let yarn_site = conf.join("yarn-site.xml");
    template::upsert_property(&yarn_site, "yarn.resourcemanager.hostname", master)?;
    template::upsert_property(
        &yarn_site,
        "yarn.nodemanager.aux-services",
        "mapreduce_shuffle",
    )?;

    // mapred-site.xml
    let mapred_site = conf.join("mapred-site.xml");
    template::upsert_property(&mapred_site, "mapreduce.framework.name", "yarn")?;
    template::upsert_property(
        &mapred_site,
        "mapreduce.jobhistory.address",
        &format!("{}:10020", master),
    )?;

    // Worker list (managed block; operator lines outside the block survive).
    template::upsert_marker_block(
        &conf.join("workers"),
        common::WORKERS_BEGIN_MARKER,
        common::WORKERS_END_MARKER,
        &nodes.workers_block(),
    )?;

    // hadoop-env.sh needs JAVA_HOME even for non-login invocations.
    template::upsert_marker_block(
        &conf.join("hadoop-env.sh"),
        common::HADOOP_ENV_BEGIN_MARKER,
        common::HADOOP_ENV_END_MARKER,
        &format!("export JAVA_HOME={}\n", cfg.jdk_home().display()),
    )?;

    // spark-defaults.conf
    template::upsert_marker_block(
        &cfg.spark_conf_dir().join("spark-defaults.conf"),
        common::SPARK_BEGIN_MARKER,
        common::SPARK_END_MARKER,
        &spark_defaults_block(cfg),
    )?;

    // System-wide environment snippet (wholly generated).
    template::write_generated_file(
        Path::new(common::PROFILE_SNIPPET_PATH),
        &profile_snippet(cfg),
    )?;

    // Daemon data directories, owned by the service account.
    for dir in &[
        &cfg.namenode_dir,
        &cfg.datanode_dir,
        &cfg.hadoop_tmp_dir,
        &cfg.spark_eventlog_dir,
    ] {
        std::fs::create_dir_all(dir)?;
        common::run_local(
            "chown data dir",
            Command::new("chown")
                .arg("-R")
                .arg(format!("{0}:{0}", cfg.cluster_user))
                .arg(dir),
        )?;
    }

    log.note("config: managed configuration files are up to date");
    Ok(())
}

fn spark_defaults_block(cfg: &ClusterConfig) -> String {
    format!(
        "spark.master yarn\n\
         spark.eventLog.enabled true\n\
         spark.eventLog.dir file://{0}\n\
         spark.history.fs.logDirectory file://{0}\n",
        cfg.spark_eventlog_dir.display()
    )
}

fn profile_snippet(cfg: &ClusterConfig) -> String {
    format!(
        "# {marker} -- do not edit, changes are overwritten\n\
         export JAVA_HOME={jdk}\n\
         export HADOOP_HOME={hadoop}\n\
         export HADOOP_CONF_DIR={conf}\n\
         export SPARK_HOME={spark}\n\
         export PATH=\"$PATH:$JAVA_HOME/bin:$HADOOP_HOME/bin:$HADOOP_HOME/sbin:$SPARK_HOME/bin:$SPARK_HOME/sbin\"\n",
        marker = template::OWNERSHIP_MARKER,
        jdk = cfg.jdk_home().display(),
        hadoop = cfg.hadoop_home().display(),
        conf = cfg.hadoop_conf_dir().display(),
        spark = cfg.spark_home().display(),
    )
}
