use {anyhow::Result, clap::Subcommand};

use turingpi_container::{ContainerRegistry, DockerCli, MANAGED_LABEL, prune_managed};

#[derive(Subcommand)]
pub enum ContainerAction {
    /// List worker containers carrying the managed label.
    List,
    /// Force-remove every managed worker container, e.g. after a crash.
    Prune,
    /// Adopt managed containers into the registry and destroy them with the
    /// configured per-container and sweep deadlines, verifying removal.
    Sweep,
}

pub async fn handle_containers(action: ContainerAction) -> Result<()> {
    let cli = DockerCli::default();
    match action {
        ContainerAction::List => list(&cli).await,
        ContainerAction::Prune => prune(&cli).await,
        ContainerAction::Sweep => sweep(&cli).await,
    }
}

fn label_filter() -> String {
    format!("label={MANAGED_LABEL}=true")
}

async fn list(cli: &DockerCli) -> Result<()> {
    let filter = label_filter();
    let out = cli
        .run_checked(&[
            "ps",
            "-a",
            "--filter",
            filter.as_str(),
            "--format",
            "{{.ID}}\t{{.Names}}\t{{.Status}}",
        ])
        .await?;
    let rows: Vec<&str> = out.lines().filter(|l| !l.trim().is_empty()).collect();
    if rows.is_empty() {
        println!("No managed containers.");
        return Ok(());
    }
    println!("{:<14} {:<40} STATUS", "ID", "NAME");
    for row in rows {
        let mut cols = row.splitn(3, '\t');
        let id = cols.next().unwrap_or_default();
        let name = cols.next().unwrap_or_default();
        let status = cols.next().unwrap_or_default();
        println!("{id:<14} {name:<40} {status}");
    }
    Ok(())
}

async fn prune(cli: &DockerCli) -> Result<()> {
    let removed = prune_managed(cli).await?;
    if removed.is_empty() {
        println!("No managed containers to remove.");
    } else {
        println!(
            "Removed {} container{}.",
            removed.len(),
            if removed.len() == 1 {
                ""
            } else {
                "s"
            }
        );
    }
    Ok(())
}

async fn sweep(cli: &DockerCli) -> Result<()> {
    let config = turingpi_config::discover_and_load();
    let registry = ContainerRegistry::init_global(crate::prepare_commands::deadlines(&config));

    let filter = label_filter();
    let listed = cli
        .run_checked(&["ps", "-aq", "--filter", filter.as_str()])
        .await?;
    for id in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        registry.register(id);
    }
    if registry.count() == 0 {
        println!("No managed containers.");
        return Ok(());
    }

    let report = registry.sweep().await;
    for id in &report.removed {
        println!("removed  {id}");
    }
    for id in &report.failed {
        println!("FAILED   {id}");
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} container(s) could not be removed", report.failed.len());
    }
    Ok(())
}
