//! VDA - command line front end
//!
//! `daemon` runs the archival poll loop, `add`/`remove`/`status`/`retrieve`
//! administer the archive, and `simulate` runs the volunteer-host simulator.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use vda::daemon::{ExternalCoder, MemoryStore};
use vda::simulation::scenarios::{run_scenario, Scenario};
use vda::{logging, Daemon, DaemonConfig, Policy, Result, SimConfig, Simulation, TerminalUI, VdaError};

fn cli() -> Command {
    let store_args = [
        Arg::new("store")
            .long("store")
            .value_name("PATH")
            .help("JSON state file")
            .default_value("vda_state.json"),
        Arg::new("archive_dir")
            .long("archive_dir")
            .value_name("DIR")
            .help("Directory holding archived files")
            .default_value("vda_files"),
        Arg::new("encoder")
            .long("encoder")
            .value_name("PROGRAM")
            .help("Erasure encoder executable")
            .default_value("vda_encoder"),
        Arg::new("decoder")
            .long("decoder")
            .value_name("PROGRAM")
            .help("Erasure decoder executable")
            .default_value("vda_decoder"),
    ];

    Command::new("vda")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Archival storage on volunteer hosts")
        .subcommand_required(true)
        .arg(
            Arg::new("debug_level")
                .short('d')
                .long("debug_level")
                .value_name("N")
                .help("0 = errors only, 4 = trace")
                .default_value("2")
                .global(true),
        )
        .subcommand(
            Command::new("daemon")
                .about("Run the archival daemon")
                .args(store_args.clone())
                .arg(
                    Arg::new("poll_interval")
                        .long("poll_interval")
                        .value_name("SECONDS")
                        .help("Sleep between idle polls")
                        .default_value("5"),
                )
                .arg(
                    Arg::new("host_timeout")
                        .long("host_timeout")
                        .value_name("SECONDS")
                        .help("Silence after which a host is dead")
                        .default_value("345600"),
                )
                .arg(
                    Arg::new("allow_colocated")
                        .long("allow_colocated")
                        .help("Place several chunks of a file on one host when needed")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("add")
                .about("Archive a file")
                .args(store_args.clone())
                .arg(Arg::new("name").required(true).help("Archive name"))
                .arg(Arg::new("payload").required(true).help("File to archive"))
                .arg(
                    Arg::new("policy")
                        .long("policy")
                        .value_name("PATH")
                        .required(true)
                        .help("Coding policy file"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Stop archiving a file")
                .args(store_args.clone())
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("status")
                .about("Show the recovery state of an archived file")
                .args(store_args.clone())
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("retrieve")
                .about("Bring a file back to the server")
                .args(store_args)
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(simulate_command())
}

fn simulate_command() -> Command {
    let numeric = |name: &'static str, help: &'static str, default: &'static str| {
        Arg::new(name)
            .long(name)
            .value_name("N")
            .help(help)
            .default_value(default)
    };

    Command::new("simulate")
        .about("Simulate archival on a churning host population")
        .arg(
            Arg::new("policy")
                .long("policy")
                .value_name("PATH")
                .help("Coding policy file (default: 2 1 10 6 12)"),
        )
        .arg(numeric(
            "host_life_mean",
            "Mean host lifetime in seconds, 0 disables churn",
            "8640000",
        ))
        .arg(numeric(
            "connect_interval",
            "Seconds between host contacts",
            "86400",
        ))
        .arg(numeric(
            "mean_xfer_rate",
            "Mean host transfer rate in bytes/sec",
            "1e6",
        ))
        .arg(numeric("file_size", "Bytes per archived file", "1e12"))
        .arg(numeric("num_hosts", "Initial host population", "1000"))
        .arg(numeric("num_files", "Files archived at start", "1"))
        .arg(numeric("duration", "Simulated seconds", "86400000"))
        .arg(numeric("seed", "Random seed", "0"))
        .arg(
            Arg::new("output_dir")
                .long("output_dir")
                .value_name("DIR")
                .help("Write summary.txt and .dat series here"),
        )
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .value_name("NAME")
                .help("Run a scripted scenario: convergence, single-failure, reconstruction, all"),
        )
        .arg(
            Arg::new("tui")
                .long("tui")
                .help("Show the live terminal dashboard")
                .action(ArgAction::SetTrue),
        )
}

/// Parse a defaulted argument
fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| VdaError::Config(format!("missing --{}", name)))?;
    raw.parse()
        .map_err(|e| VdaError::Config(format!("invalid --{} '{}': {}", name, raw, e)))
}

fn seconds_arg(matches: &ArgMatches, name: &str) -> Result<Duration> {
    let secs: f64 = parse_arg(matches, name)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| VdaError::Config(format!("invalid --{}: {}", name, e)))
}

fn path_arg(matches: &ArgMatches, name: &str) -> Result<PathBuf> {
    parse_arg(matches, name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let debug_level: u8 = parse_arg(&matches, "debug_level")?;
    logging::init(logging::level_for_debug(debug_level))?;

    match matches.subcommand() {
        Some(("daemon", sub)) => run_daemon(sub).await,
        Some(("simulate", sub)) => run_simulation(sub).await,
        Some((admin, sub)) => run_admin(admin, sub),
        None => Err(VdaError::Config("no command given".into())),
    }
}

fn open_daemon(
    matches: &ArgMatches,
    config: DaemonConfig,
) -> Result<Daemon<MemoryStore, ExternalCoder>> {
    let store_path = path_arg(matches, "store")?;
    let config = config
        .with_store_path(&store_path)
        .with_archive_dir(&path_arg(matches, "archive_dir")?);
    let coder = ExternalCoder::new(
        &path_arg(matches, "encoder")?,
        &path_arg(matches, "decoder")?,
    );
    let store = MemoryStore::open(&store_path)?;
    Daemon::new(config, store, coder)
}

async fn run_daemon(matches: &ArgMatches) -> Result<()> {
    let config = DaemonConfig {
        poll_interval: seconds_arg(matches, "poll_interval")?,
        host_timeout: parse_arg(matches, "host_timeout")?,
        allow_colocated: matches.get_flag("allow_colocated"),
        ..DaemonConfig::default()
    };
    let mut daemon = open_daemon(matches, config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(shutdown_rx).await
}

fn run_admin(command: &str, matches: &ArgMatches) -> Result<()> {
    let mut daemon = open_daemon(matches, DaemonConfig::default())?;
    let name: String = parse_arg(matches, "name")?;

    match command {
        "add" => {
            let payload = path_arg(matches, "payload")?;
            let policy = path_arg(matches, "policy")?;
            let id = daemon.add_file(&name, &payload, &policy)?;
            println!("Added {} as file {}", name, id);
        }
        "remove" => {
            daemon.remove_file(&name)?;
            println!("Removed {}", name);
        }
        "status" => {
            for line in daemon.file_status(&name)? {
                println!("{}", line);
            }
        }
        "retrieve" => {
            daemon.retrieve(&name)?;
            println!("Retrieval of {} requested", name);
        }
        other => return Err(VdaError::Config(format!("unknown command '{}'", other))),
    }
    Ok(())
}

fn sim_config(matches: &ArgMatches) -> Result<SimConfig> {
    let policy = match matches.get_one::<String>("policy") {
        Some(path) => Policy::from_file(Path::new(path))?,
        None => Policy::default(),
    };
    let host_life_mean: f64 = parse_arg(matches, "host_life_mean")?;
    let config = SimConfig {
        policy,
        host_life_mean: if host_life_mean == 0.0 {
            f64::INFINITY
        } else {
            host_life_mean
        },
        connect_interval: parse_arg(matches, "connect_interval")?,
        mean_xfer_rate: parse_arg(matches, "mean_xfer_rate")?,
        file_size: parse_arg(matches, "file_size")?,
        num_hosts: parse_arg(matches, "num_hosts")?,
        num_files: parse_arg(matches, "num_files")?,
        duration: parse_arg(matches, "duration")?,
        seed: parse_arg(matches, "seed")?,
        output_dir: matches.get_one::<String>("output_dir").map(PathBuf::from),
    };
    config.validate()?;
    Ok(config)
}

async fn run_simulation(matches: &ArgMatches) -> Result<()> {
    let config = sim_config(matches)?;

    if let Some(name) = matches.get_one::<String>("scenario") {
        let scenarios = if name == "all" {
            Scenario::ALL.to_vec()
        } else {
            vec![Scenario::from_str(name).map_err(VdaError::Config)?]
        };
        let mut failed = 0;
        for scenario in scenarios {
            let outcome = run_scenario(scenario, &config)?;
            for line in &outcome.log {
                println!("{}", line);
            }
            println!();
            if !outcome.passed {
                error!(scenario = scenario.name(), "scenario failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(VdaError::Config(format!("{} scenario(s) failed", failed)));
        }
        return Ok(());
    }

    let output_dir = config.output_dir.clone();
    let mut sim = Simulation::new(config)?;

    if matches.get_flag("tui") {
        let mut ui = TerminalUI::new()?;
        ui.run(sim).await?;
        return Ok(());
    }

    let events = sim.run();
    let status = sim.status();
    println!(
        "Simulated {:.1} days, {} events",
        status.now / 86400.0,
        events
    );
    println!(
        "Hosts: {} alive, {} arrived, {} departed",
        status.hosts_alive, status.host_arrivals, status.host_departures
    );
    println!(
        "Files: {} ({} lost), health {}",
        status.files,
        status.files_lost,
        status.health_description()
    );
    for file in sim.files() {
        for stat in [
            &file.stats.disk_usage,
            &file.stats.upload_rate,
            &file.stats.download_rate,
            &file.stats.fault_tolerance,
        ] {
            println!("  {}: {}", file.name, stat.describe(status.now));
        }
    }

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(&dir)?;
        sim.write_reports(&dir)?;
        info!(dir = %dir.display(), "reports written");
    }
    Ok(())
}
