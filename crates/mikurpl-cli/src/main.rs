use anyhow::{bail, Context, Result};
use clap::Parser;
use mikurpl_cli::cli::{Cli, Command, DaemonMode, RplmsArgs};
use mikurpl_cli::{commands, Formatter, MySqlClient, OutputFormat};
use mikurpl_common::RplConfig;
use mikurpl_core::DatabaseClient;
use mikurpl_daemon::process::process_alive;
use mikurpl_daemon::{daemonize, init_logging, read_pid, Forked, PidFile};
use std::sync::Arc;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match cli.config {
        Some(ref path) => RplConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => RplConfig::default(),
    };
    if let Some(ref level) = cli.log_level {
        config.log.level = level.clone();
    } else if cli.verbose >= 2 {
        config.log.level = "debug".to_string();
    }

    let out = Formatter::new(OutputFormat::parse(&cli.format), !cli.no_color, cli.verbose);
    let client: Arc<dyn DatabaseClient> = Arc::new(MySqlClient::new());

    match cli.command {
        Command::Replicate(ref args) => {
            init_logging(&config.log)?;
            runtime()?.block_on(commands::replicate(client, args, &config, &out))
        }
        Command::Skiptrx(ref args) => {
            init_logging(&config.log)?;
            runtime()?.block_on(commands::skiptrx(client, args, &config, &out))
        }
        Command::Rplms(ref args) => {
            args.apply(&mut config);
            config.validate()?;
            rplms(args, config, client, &out)
        }
    }
}

fn rplms(args: &RplmsArgs, config: RplConfig, client: Arc<dyn DatabaseClient>, out: &Formatter) -> Result<()> {
    let pidfile = config.daemon.pidfile.clone();
    match args.daemon {
        Some(DaemonMode::Stop) => {
            init_logging(&config.log)?;
            runtime()?.block_on(commands::stop_daemon(&pidfile))
        }
        Some(DaemonMode::Restart) => {
            init_logging(&config.log)?;
            commands::restart_daemon(&pidfile)
        }
        Some(DaemonMode::Start) => {
            let topology = commands::topology(args)?;
            if let Some(pid) = read_pid(&pidfile)? {
                if process_alive(pid) {
                    bail!("daemon already running with pid {} ({})", pid, pidfile.display());
                }
            }
            if config.log.file.is_none() {
                eprintln!("WARNING: no --log given, the detached daemon will not write a log");
            }
            // fork 必须发生在创建运行时之前
            match daemonize()? {
                Forked::Parent(pid) => {
                    println!("# Daemon started (pid {}, pid file {})", pid, pidfile.display());
                    Ok(())
                }
                Forked::Child => {
                    init_logging(&config.log)?;
                    let _pidfile = PidFile::create(&pidfile)?;
                    runtime()?.block_on(commands::run_daemon(client, topology, &config, out))
                }
            }
        }
        Some(DaemonMode::Nodetach) | None => {
            let topology = commands::topology(args)?;
            init_logging(&config.log)?;
            runtime()?.block_on(commands::run_daemon(client, topology, &config, out))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")
}
