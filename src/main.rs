//! `clusterup` bootstraps a small Hadoop/Spark cluster from the master node: it establishes SSH
//! trust with the workers, installs the JDK/Hadoop/Spark tarballs, templates the cluster
//! configuration files, pushes everything to the workers, and drives the daemon lifecycle.
//!
//! Which routine runs is chosen by the subcommand. All routines read the same cluster
//! configuration file (`--conf`).

// Useful common routines
mod common;

// Core components
mod artifact;
mod config;
mod nodes;
mod remote;
mod template;

// Action routines
mod distribute;
mod install;
mod lifecycle;
mod trust;

use std::io::Write;
use std::path::Path;

use crate::common::output::RunLog;
use crate::config::ClusterConfig;

const DEFAULT_CONF: &str = "cluster.conf";

const ACTIONS: &[&str] = &[
    "trust",
    "install",
    "distribute",
    "start",
    "stop",
    "restart",
    "format",
    "status",
    "health",
];

fn run() -> Result<(), failure::Error> {
    let matches = clap::App::new("clusterup")
        .about(
            "Bootstraps a Hadoop/Spark cluster from the master node. Which routine is chosen by \
             passing different subcommands. All routines read the cluster configuration file.",
        )
        .arg(
            clap::Arg::with_name("CONF")
                .long("conf")
                .takes_value(true)
                .help("Path of the cluster configuration file (default: ./cluster.conf)"),
        )
        .subcommand(trust::cli_options())
        .subcommand(install::cli_options())
        .subcommand(distribute::cli_options())
        .subcommands(lifecycle::cli_options())
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    let conf_path = matches.value_of("CONF").unwrap_or(DEFAULT_CONF);
    let cfg = ClusterConfig::load(Path::new(conf_path))?;

    // Without a subcommand, fall back to an interactive numbered menu.
    let chosen;
    let default_matches = clap::ArgMatches::default();
    let (action, sub_m) = match matches.subcommand() {
        (action, Some(sub_m)) if !action.is_empty() => (action, sub_m),
        _ => {
            chosen = prompt_action()?;
            (chosen.as_str(), &default_matches)
        }
    };

    // Every routine appends to a fixed per-action log file and mirrors to stderr. The log starts
    // with a JSON snapshot of the loaded configuration (secrets redacted).
    let log = RunLog::open(&cfg.log_dir, action, &cfg.snapshot())?;

    let result = match action {
        "trust" => trust::run(sub_m, &cfg, &log),
        "install" => install::run(sub_m, &cfg, &log),
        "distribute" => distribute::run(sub_m, &cfg, &log),
        "start" | "stop" | "restart" | "format" | "status" | "health" => {
            lifecycle::run(action, sub_m, &cfg, &log)
        }
        _ => unreachable!(),
    };

    if let Err(ref err) = result {
        log.error(&format!("{} failed: {}", action, err));
    }

    result
}

/// Present the numbered action menu and read the operator's choice from stdin.
fn prompt_action() -> Result<String, failure::Error> {
    println!("Choose an action:");
    for (i, action) in ACTIONS.iter().enumerate() {
        println!("  {}) {}", i + 1, action);
    }
    print!("> ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    let choice = line
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| ACTIONS.get(i))
        .ok_or_else(|| failure::format_err!("invalid choice `{}`", line.trim()))?;

    Ok((*choice).to_owned())
}

fn main() {
    use console::style;

    env_logger::init();

    // Always get backtraces. The performance penalty doesn't matter here, and the debugging
    // improvement is massive when a remote step fails.
    std::env::set_var("RUST_BACKTRACE", "1");

    if let Err(err) = run() {
        const MESSAGE: &str = r#"== ERROR ==================================================================================
`clusterup` encountered an error. The command log above may offer clues. If the error pertains
to SSH, you may be able to get useful information by setting the RUST_LOG=debug environment
variable. The cluster is left in whatever state the last completed step produced; re-running the
same action after fixing the cause is safe -- every routine is idempotent."#;

        println!("{}", style(MESSAGE).red().bold());

        // Errors from SSH commands
        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        println!(
            "`clusterup` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}
