use clap::{Parser, Subcommand};
use fleetforge_agent::{
    fetcher_for, install_signal_handler, load_agent_config, AgentConfig, AgentError,
    AgentSettings, BootCheck, BootMode, CommandInstaller, FileIncidentReporter, Heartbeat,
    ProcessSupervisor, RestartPolicy, StateStore, StopSignal, UpdateAgent, UpdateOutcome,
    DEFAULT_AGENT_CONFIG,
};
use fleetforge_bundle::Keyring;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_VERIFICATION_ERROR: u8 = 6;
const EXIT_SUPERVISION_EXHAUSTED: u8 = 7;

#[derive(Debug, Parser)]
#[command(
    name = "fleetforge-agent",
    version,
    about = "Fetches, verifies, and installs signed update bundles on a device"
)]
struct Cli {
    /// Agent configuration file, re-read at every start.
    #[arg(long, default_value = DEFAULT_AGENT_CONFIG, global = true)]
    config: PathBuf,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent under its supervisor (daemon entry point).
    Run,
    /// Run one agent process: confirm boot, heartbeat, poll the channel.
    Serve,
    /// Install one bundle from a URL or local path, then exit.
    Update {
        /// Bundle URL or path.
        source: String,
    },
    /// Print the persisted agent state.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FLEETFORGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = match load_agent_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = match cli.command {
        Commands::Run => run_supervised(&cli.config, &config),
        Commands::Serve => serve(&config),
        Commands::Update { source } => update(&config, &source),
        Commands::Status => status(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let code = match e {
                AgentError::Config(_) => EXIT_CONFIG_ERROR,
                AgentError::Verification(_) | AgentError::VariantMismatch { .. } => {
                    EXIT_VERIFICATION_ERROR
                }
                AgentError::Exhausted(_) => EXIT_SUPERVISION_EXHAUSTED,
                _ => EXIT_FAILURE,
            };
            ExitCode::from(code)
        }
    }
}

fn run_supervised(config_path: &Path, config: &AgentConfig) -> Result<(), AgentError> {
    let exe = std::env::current_exe()?;
    let argv = vec![
        exe.to_string_lossy().into_owned(),
        "--config".to_owned(),
        config_path.to_string_lossy().into_owned(),
        "serve".to_owned(),
    ];
    let reporter = FileIncidentReporter::new(&config.incident_dir());
    let stop = StopSignal::new();
    install_signal_handler(stop.clone());
    info!("supervising agent, heartbeat at {}", config.heartbeat_path().display());
    ProcessSupervisor::new(
        argv,
        &config.heartbeat_path(),
        RestartPolicy::from(&config.supervisor),
        &reporter,
    )
    .with_state_dir(&config.state_dir)
    .run(&stop)
}

fn settings(config: &AgentConfig) -> AgentSettings {
    AgentSettings {
        boot_mode: config.boot_mode,
        variant: config.variant.clone(),
        state_dir: config.state_dir.clone(),
    }
}

fn installer(config: &AgentConfig) -> CommandInstaller {
    CommandInstaller::new(
        config.install.command.clone(),
        config.install.confirm.clone(),
    )
}

fn serve(config: &AgentConfig) -> Result<(), AgentError> {
    let keyring = Keyring::load_dir(&config.keyring_dir)?;
    let installer = installer(config);
    let reporter = FileIncidentReporter::new(&config.incident_dir());
    let agent = UpdateAgent::new(settings(config), keyring, &installer, &reporter)?;
    let fetcher = fetcher_for(&config.source);
    let stop = StopSignal::new();
    install_signal_handler(stop.clone());

    match agent.confirm_boot() {
        Ok(BootCheck::Confirmed { version }) => info!("running bundle {version}"),
        Ok(BootCheck::Rejected { version }) => warn!(
            "pending bundle {} was not booted",
            version.as_deref().unwrap_or("(unknown)")
        ),
        Ok(BootCheck::Interrupted { state }) => warn!("previous update interrupted while {state}"),
        Ok(BootCheck::Clean) => {}
        Err(e) => warn!("boot confirmation failed: {e}"),
    }

    let tick = (Duration::from_secs(config.supervisor.watchdog_secs) / 4)
        .clamp(Duration::from_millis(100), Duration::from_secs(5));
    let pulse = match Heartbeat::from_env() {
        Some(hb) => Some(hb.spawn(tick, stop.clone())?),
        None => None,
    };
    let polling = config.boot_mode == BootMode::Normal;
    if !polling {
        info!("recovery boot, automatic updates disabled");
    }
    let mut next_poll = Instant::now();

    while !stop.is_stopped() {
        if polling && Instant::now() >= next_poll {
            match agent.poll(fetcher.as_ref(), &config.channel) {
                Ok(UpdateOutcome::Installed { version }) => {
                    info!("bundle {version} installed, reboot to activate");
                }
                Ok(UpdateOutcome::UpToDate) => {}
                Err(AgentError::InvalidTransition { from, .. }) => {
                    info!("not polling while {from}");
                }
                Err(e) => warn!("update check failed: {e}"),
            }
            next_poll = Instant::now() + config.poll_interval();
        }
        stop.sleep(tick);
    }
    if let Some(pulse) = pulse {
        let _ = pulse.join();
    }
    info!("agent stopped");
    Ok(())
}

fn update(config: &AgentConfig, source: &str) -> Result<(), AgentError> {
    let keyring = Keyring::load_dir(&config.keyring_dir)?;
    let installer = installer(config);
    let reporter = FileIncidentReporter::new(&config.incident_dir());
    let agent = UpdateAgent::new(settings(config), keyring, &installer, &reporter)?;
    let fetcher = fetcher_for(source);
    if let UpdateOutcome::Installed { version } = agent.request_update(fetcher.as_ref(), source)? {
        println!("installed bundle {version}; reboot to activate");
    }
    Ok(())
}

fn status(config: &AgentConfig) -> Result<(), AgentError> {
    let state = StateStore::new(&config.state_dir).load()?;
    let incidents = FileIncidentReporter::new(&config.incident_dir()).list()?;
    let out = serde_json::json!({
        "state": state,
        "channel": config.channel,
        "boot_mode": config.boot_mode,
        "incidents": incidents.len(),
        "last_incident": incidents.last(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
