use std::{path::PathBuf, thread};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info};
use nix::sys::signal::{SigSet, Signal};

use hawser::{
    cli::{Cli, Commands},
    client::{auth::AuthManager, ApiClient},
    datastore::DataStore,
    device::Device,
    engine::{Daemon, StateContext, WaitSignal},
    standalone, ExitKind,
};
use hawser_api::{config::Config, constants::DEFAULT_CONFIG_PATH};

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbosity)
        .format_timestamp_secs()
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    info!("hawser {} running '{}'", hawser::HAWSER_VERSION, cli.command);
    match run(cli.command, config) {
        Ok(ExitKind::Done) => {}
        Ok(ExitKind::Fatal) => std::process::exit(2),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    }
}

fn run(command: Commands, config: Config) -> Result<ExitKind, Error> {
    match command {
        Commands::Daemon => {
            let ctx = StateContext::new(config).context("Failed to initialize")?;
            register_shutdown_signals(ctx.wait.clone())?;
            let mut daemon = Daemon::new(ctx);
            Ok(daemon.run())
        }
        Commands::Install { artifact } => {
            standalone::install(&config, &artifact)?;
            Ok(ExitKind::Done)
        }
        Commands::Commit => {
            standalone::commit(&config)?;
            Ok(ExitKind::Done)
        }
        Commands::Rollback => {
            standalone::rollback(&config)?;
            Ok(ExitKind::Done)
        }
        Commands::CheckUpdate => check_update(config),
        Commands::SendInventory => send_inventory(config),
        Commands::ShowArtifact => {
            let store = DataStore::open(&config.datastore_path)?;
            println!("{}", Device::new(&config).artifact_name(&store)?);
            Ok(ExitKind::Done)
        }
        Commands::ShowProvides => {
            let store = DataStore::open(&config.datastore_path)?;
            let device = Device::new(&config);
            let mut provides: Vec<_> = device.provides(&store)?.into_iter().collect();
            provides.sort();
            for (key, value) in provides {
                println!("{key}={value}");
            }
            Ok(ExitKind::Done)
        }
    }
}

/// Builds an authorized API client for the one-shot server commands.
fn authorized_client(config: &Config) -> Result<(ApiClient, Device, DataStore), Error> {
    let store = DataStore::open(&config.datastore_path)?;
    let device = Device::new(config);
    let device_type = device.device_type()?;

    let auth = AuthManager::spawn(config, &device_type)?;
    let mut api = ApiClient::new(config)?;
    api.set_token(Some(auth.fetch_token().context("Authorization failed")?));
    Ok((api, device, store))
}

fn check_update(config: Config) -> Result<ExitKind, Error> {
    let (api, device, store) = authorized_client(&config)?;
    let response = api
        .check_update(&device.device_type()?, &device.artifact_name(&store)?)
        .context("Update check failed")?;

    match response {
        Some(response) => {
            println!(
                "Deployment '{}' offers artifact '{}'",
                response.update.id, response.update.artifact.name
            );
        }
        None => println!("No update available"),
    }
    Ok(ExitKind::Done)
}

fn send_inventory(config: Config) -> Result<ExitKind, Error> {
    let (api, device, store) = authorized_client(&config)?;
    let attributes = hawser::client::inventory::gather_attributes(
        &device.device_type()?,
        &device.artifact_name(&store)?,
    );
    api.submit_inventory(&attributes)
        .context("Inventory submission failed")?;
    info!("Inventory submitted ({} attributes)", attributes.len());
    Ok(ExitKind::Done)
}

/// Routes SIGTERM/SIGINT into the cooperative cancellation signal so the
/// driver finishes its current state and exits cleanly.
fn register_shutdown_signals(wait: WaitSignal) -> Result<(), Error> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGINT);
    signals
        .thread_block()
        .context("Failed to block shutdown signals")?;

    thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            if let Ok(signal) = signals.wait() {
                info!("Received {signal}, shutting down after the current state");
                wait.shutdown();
            }
        })
        .context("Failed to spawn signal handler")?;
    Ok(())
}
