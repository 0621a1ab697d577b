use std::{path::PathBuf, time::Duration};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    tokio_util::sync::CancellationToken,
    turingpi_cluster::{NodeShell, OpenSshShell, RetryPolicy},
    turingpi_config::{RetryConfig, TuringPiConfig},
};

#[derive(Subcommand)]
pub enum NodeAction {
    /// Run a command on a node.
    Exec {
        #[arg(long, short)]
        node: u8,
        command: String,
    },
    /// Copy a local file to a node.
    Push {
        #[arg(long, short)]
        node: u8,
        local: PathBuf,
        remote: String,
    },
    /// Copy a file from a node.
    Pull {
        #[arg(long, short)]
        node: u8,
        remote: String,
        local: PathBuf,
    },
}

pub(crate) fn retry_policy(retry: &RetryConfig) -> RetryPolicy {
    RetryPolicy::new(
        retry.attempts,
        Duration::from_millis(retry.initial_delay_ms),
        Duration::from_millis(retry.increment_ms),
    )
}

pub(crate) fn node_shell(config: &TuringPiConfig, index: u8) -> Result<NodeShell<OpenSshShell>> {
    let node = config
        .node(index)
        .with_context(|| format!("node {index} is not in the config"))?;
    let ip = node
        .ip
        .with_context(|| format!("node {index} has no ip configured"))?;
    let user = node.user.clone().unwrap_or_else(|| "root".into());
    Ok(NodeShell::new(
        OpenSshShell::new(ip.to_string(), user),
        retry_policy(&config.retry),
    ))
}

pub async fn handle_node(action: NodeAction) -> Result<()> {
    let config = turingpi_config::discover_and_load();
    let cancel = CancellationToken::new();

    match action {
        NodeAction::Exec { node, command } => {
            let out = node_shell(&config, node)?.exec(&command, &cancel).await?;
            print!("{}", out.stdout);
            eprint!("{}", out.stderr);
            if !out.success() {
                anyhow::bail!("`{command}` exited with {}", out.exit_code);
            }
        },
        NodeAction::Push { node, local, remote } => {
            node_shell(&config, node)?
                .copy_to(&local, &remote, &cancel)
                .await?;
        },
        NodeAction::Pull { node, remote, local } => {
            node_shell(&config, node)?
                .copy_from(&remote, &local, &cancel)
                .await?;
        },
    }
    Ok(())
}
