//! polar_daq - run one camera of the polarimeter.
//!
//! Start the slave first, then the master:
//!
//! ```text
//! polar_daq --simulate --role slave  config/polar_daq.toml
//! polar_daq --simulate --role master config/polar_daq.toml
//! ```
//!
//! Exit status is 0 after a complete observation and 1 after any failure.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use polar_daq::config::Settings;
use polar_daq::hardware::MockCameraSdk;
use polar_daq::orchestrator;
use polar_daq::sync::Role;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    /// Drive the rotator and camera 1
    Master,
    /// Follow the master with camera 2
    Slave,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Master => Role::Master,
            RoleArg::Slave => Role::Slave,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "polar_daq")]
#[command(about = "Polarimeter camera and rotator acquisition", long_about = None)]
struct Args {
    /// Settings file (TOML); missing values take defaults
    #[arg(default_value = "config/polar_daq.toml")]
    config: PathBuf,

    /// Process role
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Run a single camera without a peer process
    #[arg(short, long)]
    single: bool,

    /// Camera USB index (default: 0 for master, 1 for slave)
    #[arg(short, long)]
    camera: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for frame files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run against the simulated camera (required: no camera library binding in this build)
    #[arg(long)]
    simulate: bool,
}

/// Refuse to start unless the simulated camera was asked for.
fn require_simulation(args: &Args) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.simulate,
        "this build has no camera library binding; pass --simulate to run the simulated camera"
    );
    Ok(())
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_figment(Settings::figment(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(role) = args.role {
        settings.process.role = role.into();
    }
    if args.single {
        settings.process.single_camera = true;
    }
    if args.camera.is_some() {
        settings.process.camera_index = args.camera;
    }
    if let Some(level) = &args.log_level {
        settings.logging.level.clone_from(level);
    }
    if let Some(dir) = &args.output {
        settings.storage.output_dir.clone_from(dir);
    }
    settings.validate().context("command line overrides")?;
    Ok(settings)
}

#[cfg(feature = "instrument_serial")]
fn rotator_link(settings: &Settings) -> polar_daq::hardware::GcsSerialLink {
    polar_daq::hardware::GcsSerialLink::new(
        &settings.rotator.port,
        settings.rotator.baud_rate,
        std::time::Duration::from_millis(settings.rotator.reply_timeout_ms),
    )
}

#[cfg(not(feature = "instrument_serial"))]
fn rotator_link(_settings: &Settings) -> polar_daq::hardware::MockGcsLink {
    warn!("built without instrument_serial, using the simulated rotator");
    polar_daq::hardware::MockGcsLink::new()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("polar_daq: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = polar_daq::logging::init(&settings.logging) {
        eprintln!("polar_daq: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = require_simulation(&args) {
        error!(error = %e, "no camera");
        return ExitCode::FAILURE;
    }

    let role = settings.process.effective_role();
    info!(%role, config = %args.config.display(), "polar_daq starting");
    warn!("using the simulated camera");

    let link = (role == Role::Master).then(|| rotator_link(&settings));
    match orchestrator::observe(settings, MockCameraSdk::default(), link).await {
        Ok(frames) => {
            info!(frames, "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "observation failed");
            ExitCode::FAILURE
        }
    }
}
