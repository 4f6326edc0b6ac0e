mod mailer;
mod monitor;
mod settings;
mod sink;
mod status;
mod tracker;
mod ups;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use mailer::{Mailer, MailerSettings, Notifier};
use monitor::{CycleOutcome, Monitor};
use settings::Settings;
use ups::UPS;

const LOG_ENV: &str = "UPSINFO_LOG";

/// Polls a SmartUPS battery pack over serial and keeps its status in a file.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Settings file, merged over the built-in defaults.
    #[clap(short, long, default_value = "upsinfo.toml")]
    config: PathBuf,

    /// SMTP settings; alerts are off when the file does not exist.
    #[clap(long, default_value = "mailer.toml")]
    mailer_config: PathBuf,

    /// Serial device the UPS is attached to.
    #[clap(short, long)]
    device: Option<String>,

    /// File the latest status line is written to.
    #[clap(short, long)]
    status_file: Option<PathBuf>,

    /// Poll once and exit.
    #[clap(long)]
    once: bool,
}

// UPSINFO_LOG wins over RUST_LOG; stdout is left for the status mirror.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to read ups config {}.", cli.config.display()))?;
    if let Some(device) = cli.device {
        settings.device = device;
    }
    if let Some(status_file) = cli.status_file {
        settings.status_file = status_file;
    }
    debug!(?settings, "loaded settings");

    let notifier: Option<Box<dyn Notifier>> = match MailerSettings::load(&cli.mailer_config)
        .context("Failed to read smtp config.")?
    {
        Some(mailer_settings) => Some(Box::new(
            Mailer::new(mailer_settings).context("Failed to set up mailer.")?,
        )),
        None => {
            debug!(path = %cli.mailer_config.display(), "no mailer config, alerts disabled");
            None
        }
    };

    let ups = monitor::bring_up(UPS::open(&settings), &settings).with_context(|| {
        format!(
            "Failed to bring up UPS on {}. The UPS might not be online.",
            settings.device
        )
    })?;

    info!(
        device = %settings.device,
        status_file = %settings.status_file.display(),
        "UPS monitor running and connected!"
    );

    let mut monitor = Monitor::new(ups, &settings, notifier);
    if cli.once {
        return match monitor.run_cycle() {
            Ok(CycleOutcome::Published(_)) => Ok(()),
            Ok(CycleOutcome::Skipped { reason, .. }) => bail!("No status this cycle: {}", reason),
            Err(e) => {
                error!(error = %e, "UPS monitor stopping");
                monitor.record_failure(&e);
                Err(e.into())
            }
        };
    }

    monitor.run()?;
    Ok(())
}
