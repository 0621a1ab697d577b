use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::{Subcommand, ValueEnum},
    tokio_util::sync::CancellationToken,
    turingpi_cluster::{Bmc, NodeMode, OpenSshShell, UsbMode},
    turingpi_config::BmcConfig,
};

#[derive(Subcommand)]
pub enum BmcAction {
    /// Node power control.
    Power {
        #[command(subcommand)]
        action: PowerAction,
    },
    /// Print controller information.
    Info,
    /// Reboot the controller itself.
    Reboot,
    /// Upload and apply a controller firmware image.
    Firmware { file: PathBuf },
    /// Show or change USB routing.
    Usb {
        /// Leave empty to print the current routing.
        #[arg(value_enum)]
        mode: Option<UsbArg>,
        #[arg(long, short)]
        node: Option<u8>,
        /// Route to the controller instead of the external port.
        #[arg(long)]
        bmc: bool,
    },
    /// Reset the onboard ethernet switch.
    EthReset,
    /// Switch a node between normal boot and mass-storage mode.
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long, short)]
        node: u8,
    },
    /// Flash an image already present on the controller to a node.
    Flash {
        #[arg(long, short)]
        node: u8,
        /// Path on the controller's filesystem.
        #[arg(long, short)]
        image: String,
    },
    /// Read buffered serial output, or send a line with `--send`.
    Uart {
        #[arg(long, short)]
        node: u8,
        #[arg(long)]
        send: Option<String>,
    },
    /// Run an arbitrary command on the controller.
    Raw { command: String },
}

#[derive(Subcommand)]
pub enum PowerAction {
    Status,
    /// Power on one node, or all when `--node` is omitted.
    On {
        #[arg(long, short)]
        node: Option<u8>,
    },
    Off {
        #[arg(long, short)]
        node: Option<u8>,
    },
    Reset {
        #[arg(long, short)]
        node: u8,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum UsbArg {
    Host,
    Device,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Normal,
    Msd,
}

pub(crate) fn shell_for(bmc: &BmcConfig) -> Result<OpenSshShell> {
    let host = bmc
        .host
        .clone()
        .context("no BMC host configured: set bmc.host")?;
    Ok(OpenSshShell::new(host, bmc.user.clone()).with_port(bmc.port))
}

pub async fn handle_bmc(action: BmcAction) -> Result<()> {
    let config = turingpi_config::discover_and_load();
    let bmc = Bmc::new(shell_for(&config.bmc)?);
    let cancel = CancellationToken::new();

    match action {
        BmcAction::Power { action } => match action {
            PowerAction::Status => {
                let status = bmc.power_status(&cancel).await?;
                for (node, on) in status.iter() {
                    println!("node{node}: {}", if on { "on" } else { "off" });
                }
            },
            PowerAction::On { node } => bmc.power_on(node, &cancel).await?,
            PowerAction::Off { node } => bmc.power_off(node, &cancel).await?,
            PowerAction::Reset { node } => bmc.reset(node, &cancel).await?,
        },
        BmcAction::Info => {
            let info = bmc.info(&cancel).await?;
            for (key, value) in &info.fields {
                println!("{key:<16} {value}");
            }
        },
        BmcAction::Reboot => bmc.reboot(&cancel).await?,
        BmcAction::Firmware { file } => bmc.firmware_upgrade(&file, &cancel).await?,
        BmcAction::Usb { mode, node, bmc: to_bmc } => match (mode, node) {
            (Some(mode), Some(node)) => {
                let mode = match mode {
                    UsbArg::Host => UsbMode::Host,
                    UsbArg::Device => UsbMode::Device,
                };
                bmc.set_usb(mode, node, to_bmc, &cancel).await?;
            },
            (Some(_), None) => anyhow::bail!("--node is required to change USB routing"),
            (None, _) => print!("{}", bmc.usb_status(&cancel).await?.raw),
        },
        BmcAction::EthReset => bmc.reset_ethernet(&cancel).await?,
        BmcAction::Mode { mode, node } => {
            let mode = match mode {
                ModeArg::Normal => NodeMode::Normal,
                ModeArg::Msd => NodeMode::Msd,
            };
            bmc.set_node_mode(node, mode, &cancel).await?;
        },
        BmcAction::Flash { node, image } => bmc.flash_node(node, &image, &cancel).await?,
        BmcAction::Uart { node, send } => match send {
            Some(line) => bmc.uart_send(node, &line, &cancel).await?,
            None => print!("{}", bmc.uart_read(node, &cancel).await?),
        },
        BmcAction::Raw { command } => {
            let out = bmc.raw(&command, &cancel).await?;
            print!("{}", out.stdout);
            eprint!("{}", out.stderr);
            if !out.success() {
                anyhow::bail!("`{command}` exited with {}", out.exit_code);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, turingpi_cluster::RemoteShell};

    #[test]
    fn missing_host_is_an_error() {
        let err = shell_for(&BmcConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bmc.host"));
    }

    #[test]
    fn shell_uses_configured_coordinates() {
        let shell = shell_for(&BmcConfig {
            host: Some("turingpi.local".into()),
            port: 2222,
            user: "admin".into(),
        })
        .unwrap();
        assert_eq!(shell.target(), "admin@turingpi.local:2222");
    }
}
