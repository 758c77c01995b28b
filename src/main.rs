use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wifi_direct_go::config::AUTO_INTERFACE;
use wifi_direct_go::redact::RedactingMakeWriter;
use wifi_direct_go::{Config, Engine, LineChannel, Role, enroller};

#[derive(Parser)]
#[command(
    name = "wifi-direct-go",
    about = "Wi-Fi Direct group owner and WPS enrolment daemon driving a \
             wpa_cli control client"
)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, env = "WIFI_DIRECT_GO_CFG")]
    config: Option<PathBuf>,

    /// Control-client interface name (overrides the configuration).
    #[arg(short, long)]
    interface: Option<String>,

    /// External hook program run on lifecycle transitions.
    #[arg(long)]
    run_program: Option<String>,

    /// Static WPS PIN for keypad enrolment.
    #[arg(long)]
    pin: Option<String>,

    /// Friendly name allowed to enroll via PBC (repeatable).
    #[arg(long = "white-list", value_name = "NAME")]
    pbc_white_list: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Internal: per-group enrolment child, re-executed by the core.
    #[command(hide = true)]
    Enroller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "wifi_direct_go=info".into()),
        )
        .with_writer(RedactingMakeWriter(std::io::stderr))
        .init();

    let args = Args::parse();
    if matches!(args.command, Some(Command::Enroller)) {
        return enroller::child_main().await.context("enroller failed");
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(run_program) = args.run_program {
        config.run_program = Some(run_program);
    }
    if let Some(pin) = args.pin {
        config.pin = pin;
    }
    if !args.pbc_white_list.is_empty() {
        config.pbc_white_list = args.pbc_white_list;
    }
    config.validate()?;

    let interface = match config.interface.as_str() {
        AUTO_INTERFACE => None,
        name => Some(name.to_string()),
    };
    let channel = LineChannel::spawn(&config.p2p_client, interface.as_deref())
        .context("cannot start the control client")?;
    let mut engine = Engine::new(config, args.config, channel, Role::Core);

    let control = engine.control();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
        let mut sighup = signal(SignalKind::hangup()).expect("signal handler");
        loop {
            tokio::select! {
                _ = sigterm.recv() => control.terminate().await,
                _ = sigint.recv() => control.terminate().await,
                _ = sighup.recv() => control.reload().await,
            }
        }
    });

    engine.run().await?;
    Ok(())
}
