//! rvpngw gateway binary
//!
//! Loads the configuration, brings up the shared TUN/TAP device and serves
//! AnyConnect-compatible clients until SIGINT/SIGTERM. SIGHUP or SIGUSR2
//! reloads the configuration file.

use log::{error, info, warn};
use rvpngw::{
    config::Config,
    crypto::{hash_password, tls::load_acceptor},
    device::open_tun,
    error::Result,
    gateway::{Collaborators, Gateway},
};
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const DEFAULT_CONFIG: &str = "/etc/rvpngw/gateway.toml";
const PASSWORD_ITERATIONS: u32 = 100_000;

enum Command {
    Serve { config_path: String },
    HashPassword { password: String },
    Help,
}

fn parse_args(args: &[String]) -> Command {
    match args.get(1).map(String::as_str) {
        Some("hash-password") => match args.get(2) {
            Some(password) => Command::HashPassword {
                password: password.clone(),
            },
            None => Command::Help,
        },
        Some("--config") | Some("-c") => match args.get(2) {
            Some(path) => Command::Serve {
                config_path: path.clone(),
            },
            None => Command::Help,
        },
        Some("--help") | Some("-h") => Command::Help,
        Some(path) if !path.starts_with('-') => Command::Serve {
            config_path: path.to_string(),
        },
        Some(_) => Command::Help,
        None => Command::Serve {
            config_path: DEFAULT_CONFIG.to_string(),
        },
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let config_path = match parse_args(&args) {
        Command::Serve { config_path } => config_path,
        Command::HashPassword { password } => match hash_password(&password, PASSWORD_ITERATIONS) {
            Ok(encoded) => {
                println!("{encoded}");
                return;
            }
            Err(e) => {
                eprintln!("Failed to hash password: {e}");
                process::exit(1);
            }
        },
        Command::Help => {
            print_usage();
            return;
        }
    };

    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {config_path}: {e}");
            process::exit(1);
        }
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting {} v{}", rvpngw::NAME, rvpngw::VERSION);
    info!("Loaded configuration from: {config_path}");

    if let Err(e) = run(config, &config_path).await {
        error!("Gateway stopped: {e}");
        process::exit(if e.is_fatal() { 2 } else { 1 });
    }
}

async fn run(config: Config, config_path: &str) -> Result<()> {
    let acceptor = load_acceptor(&config.tls)?;
    let (reader, writer) = open_tun(&config.device, config.device_address()?)?;
    let grace = Duration::from_secs(u64::from(config.router.shutdown_grace));

    let (collaborators, local) = Collaborators::local(&config);
    let gateway = Gateway::start(config, collaborators, reader, writer)?;

    let signals = {
        let gateway = Arc::clone(&gateway);
        let config_path = config_path.to_string();
        tokio::spawn(async move {
            handle_signals(gateway, local, config_path, grace).await;
        })
    };

    match gateway.serve(acceptor).await {
        Ok(()) => {
            // The signal task is still closing sessions
            let _ = signals.await;
            info!("Gateway shut down cleanly");
            Ok(())
        }
        Err(e) => {
            signals.abort();
            Err(e)
        }
    }
}

/// Reload on SIGHUP/SIGUSR2, shut down on SIGINT/SIGTERM
async fn handle_signals(
    gateway: Arc<Gateway>,
    local: rvpngw::gateway::LocalHandles,
    config_path: String,
    grace: Duration,
) {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        let (mut hangup, mut user2, mut terminate) = match (
            unix_signal(SignalKind::hangup()),
            unix_signal(SignalKind::user_defined2()),
            unix_signal(SignalKind::terminate()),
        ) {
            (Ok(hangup), Ok(user2), Ok(terminate)) => (hangup, user2, terminate),
            _ => {
                warn!("Failed to install signal handlers, only Ctrl+C is handled");
                let _ = signal::ctrl_c().await;
                gateway.shutdown(grace).await;
                return;
            }
        };
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => break,
                _ = terminate.recv() => break,
                _ = hangup.recv() => reload(&gateway, &local, &config_path),
                _ = user2.recv() => reload(&gateway, &local, &config_path),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (&local, &config_path);
        let _ = signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    gateway.shutdown(grace).await;
}

fn reload(gateway: &Gateway, local: &rvpngw::gateway::LocalHandles, config_path: &str) {
    info!("Reloading configuration from {config_path}");
    let applied = Config::from_file(config_path).and_then(|config| {
        gateway.reload(config.clone())?;
        local.reload(&config);
        Ok(())
    });
    if let Err(e) = applied {
        warn!("Reload failed, keeping the running configuration: {e}");
    }
}

/// Print usage information
fn print_usage() {
    println!("{} v{}", rvpngw::NAME, rvpngw::VERSION);
    println!("SSL-VPN gateway for AnyConnect-compatible clients");
    println!();
    println!("USAGE:");
    println!("    rvpngw-gateway [--config] [CONFIG_FILE]");
    println!("    rvpngw-gateway hash-password PASSWORD");
    println!();
    println!("ARGS:");
    println!("    CONFIG_FILE    Path to configuration file (default: {DEFAULT_CONFIG})");
    println!();
    println!("SIGNALS:");
    println!("    SIGHUP/USR2    Reload users, groups and timers");
    println!("    SIGINT/TERM    Close all sessions and exit");
    println!();
    println!("PRIVILEGES:");
    println!("    Creating the TUN/TAP device requires root or CAP_NET_ADMIN.");
}
