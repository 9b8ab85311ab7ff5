mod commands;

use clap::{Parser, Subcommand};
use commands::{
    EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_PACKAGING_ERROR, EXIT_STORE_ERROR,
    EXIT_VERIFICATION_ERROR,
};
use fleetforge_schema::PROJECT_CONFIG_FILE;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "fleetforge",
    version,
    about = "Pinned multi-component image builds and signed update bundles"
)]
struct Cli {
    /// Project configuration file.
    #[arg(long, default_value = PROJECT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

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
    /// Resolve a version catalog into a persisted build plan.
    Resolve {
        /// Catalog name (file stem under the catalogs directory).
        catalog: String,
        /// Per-build revision override, `<component>=<revision>`. Repeatable.
        #[arg(long = "override", value_name = "COMPONENT=REV")]
        overrides: Vec<String>,
    },
    /// Build components of a catalog.
    Build {
        /// Catalog name to resolve and build.
        catalog: String,
        /// Build only these components plus their unbuilt dependencies. Repeatable.
        #[arg(long = "component", short = 'c')]
        components: Vec<String>,
        /// Per-build revision override, `<component>=<revision>`. Repeatable.
        #[arg(long = "override", value_name = "COMPONENT=REV")]
        overrides: Vec<String>,
        /// Build a previously resolved plan instead of resolving the catalog again.
        #[arg(long, conflicts_with = "overrides")]
        plan: Option<String>,
    },
    /// Package a built root filesystem into a signed bundle.
    Package {
        /// Plan whose rootfs artifact is packaged.
        #[arg(long, required_unless_present = "rootfs")]
        plan: Option<String>,
        /// Package this directory or image file instead of a plan artifact.
        #[arg(long, conflicts_with = "plan")]
        rootfs: Option<PathBuf>,
        /// Bundle version; defaults to a timestamp identifier.
        #[arg(long = "bundle-version")]
        version: Option<String>,
        /// Target variant; defaults to bundle.variant, then the plan's catalog.
        #[arg(long)]
        variant: Option<String>,
        /// Signing key (overrides signing.key).
        #[arg(long)]
        key: Option<PathBuf>,
        /// Signing certificate (overrides signing.cert).
        #[arg(long)]
        cert: Option<PathBuf>,
        /// Post-install hook script (overrides bundle.hook).
        #[arg(long)]
        hook: Option<PathBuf>,
        /// Also publish the bundle to this update channel.
        #[arg(long)]
        channel: Option<String>,
    },
    /// Verify a bundle's signature and slot hashes.
    Verify {
        /// Bundle file.
        bundle: PathBuf,
        /// Trusted certificate. Repeatable; defaults to signing.cert.
        #[arg(long)]
        cert: Vec<PathBuf>,
        /// Directory of trusted `*.cert` files.
        #[arg(long)]
        keyring: Option<PathBuf>,
    },
    /// Generate a new signing key and certificate.
    Keygen {
        /// Key output path (defaults to signing.key, then fleetforge.key).
        #[arg(long)]
        key: Option<PathBuf>,
        /// Certificate output path (defaults to signing.cert, then fleetforge.cert).
        #[arg(long)]
        cert: Option<PathBuf>,
        /// Free-form subject recorded in the certificate.
        #[arg(long)]
        subject: Option<String>,
    },
    /// Publish a bundle to the rollout server for an update channel.
    Publish {
        /// Bundle file.
        bundle: PathBuf,
        /// Update channel; devices with this `update_channel` attribute receive it.
        #[arg(long)]
        channel: String,
        /// Software module name (defaults to the bundle variant).
        #[arg(long)]
        software_module: Option<String>,
        /// Distribution set name (defaults to the bundle file name).
        #[arg(long)]
        distribution: Option<String>,
        /// Only auto-assign through the channel filter; leave rollouts alone.
        #[arg(long)]
        no_rollout: bool,
        /// Start the rollout right away.
        #[arg(long, conflicts_with = "no_rollout")]
        autostart: bool,
        #[command(flatten)]
        server: commands::ServerArgs,
    },
    /// Show the latest rollout action of every device on a channel.
    Status {
        /// Update channel.
        #[arg(long)]
        channel: String,
        /// Assign the newest distribution set to devices needing attention.
        #[arg(long)]
        reassign: bool,
        #[command(flatten)]
        server: commands::ServerArgs,
    },
    /// Verify provenance records and stored plans.
    VerifyStore,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

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
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config_path = cli.config;
    let json = cli.json;

    let result = match cli.command {
        Commands::Resolve { catalog, overrides } => {
            commands::resolve::run(&config_path, &catalog, &overrides, json)
        }
        Commands::Build {
            catalog,
            components,
            overrides,
            plan,
        } => commands::build::run(
            &config_path,
            &catalog,
            &components,
            &overrides,
            plan.as_deref(),
            json,
        ),
        Commands::Package {
            plan,
            rootfs,
            version,
            variant,
            key,
            cert,
            hook,
            channel,
        } => commands::package::run(
            &config_path,
            &commands::package::PackageArgs {
                plan,
                rootfs,
                version,
                variant,
                key,
                cert,
                hook,
                channel,
            },
            json,
        ),
        Commands::Verify {
            bundle,
            cert,
            keyring,
        } => commands::verify::run(&config_path, &bundle, &cert, keyring.as_deref(), json),
        Commands::Keygen { key, cert, subject } => {
            commands::keygen::run(&config_path, key, cert, subject, json)
        }
        Commands::Publish {
            bundle,
            channel,
            software_module,
            distribution,
            no_rollout,
            autostart,
            server,
        } => commands::publish::run(
            &bundle,
            &channel,
            commands::publish::PublishArgs {
                software_module,
                distribution,
                rollout: !no_rollout,
                autostart,
            },
            &server,
            json,
        ),
        Commands::Status {
            channel,
            reassign,
            server,
        } => commands::status::run(&channel, reassign, &server, json),
        Commands::VerifyStore => commands::verify_store::run(&config_path, json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    const CONFIG_PREFIXES: &[&str] = &[
        "config error:",
        "component table error:",
        "resolution error:",
        "graph error:",
        "plan error:",
        "unknown component",
    ];
    if CONFIG_PREFIXES.iter().any(|p| msg.starts_with(p)) {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("store at ") {
        EXIT_STORE_ERROR
    } else if msg.starts_with("packaging error:") {
        EXIT_PACKAGING_ERROR
    } else if msg.starts_with("verification failed:") {
        EXIT_VERIFICATION_ERROR
    } else {
        EXIT_FAILURE
    }
}
