mod bmc_commands;
mod config_commands;
mod container_commands;
mod node_commands;
mod prepare_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "turingpi", version, about = "Turing Pi cluster control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/turingpi/).
    #[arg(long, global = true, env = "TURINGPI_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare a node image with its network identity baked in.
    Prepare(prepare_commands::PrepareArgs),
    /// Worker container housekeeping.
    Containers {
        #[command(subcommand)]
        action: container_commands::ContainerAction,
    },
    /// Board management controller commands.
    Bmc {
        #[command(subcommand)]
        action: bmc_commands::BmcAction,
    },
    /// Remote commands and file copies on compute nodes.
    Node {
        #[command(subcommand)]
        action: node_commands::NodeAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    if let Some(ref dir) = cli.config_dir {
        turingpi_config::set_config_dir(dir.clone());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "turingpi starting");

    match cli.command {
        Commands::Prepare(args) => prepare_commands::handle_prepare(args).await,
        Commands::Containers { action } => container_commands::handle_containers(action).await,
        Commands::Bmc { action } => bmc_commands::handle_bmc(action).await,
        Commands::Node { action } => node_commands::handle_node(action).await,
        Commands::Config { action } => config_commands::handle_config(action).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["turingpi", "containers", "prune", "--json-logs", "--log-level", "debug"]).unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Containers { .. }));
    }

    #[test]
    fn bmc_power_parses() {
        let cli = Cli::try_parse_from(["turingpi", "bmc", "power", "on", "-n", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Bmc {
                action: bmc_commands::BmcAction::Power {
                    action: bmc_commands::PowerAction::On { node: Some(2) }
                }
            }
        ));
    }
}
