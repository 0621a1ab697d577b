//! Board management controller command surface.
//!
//! Every operation renders one `tpi` command line and runs it over the BMC's
//! remote shell. Output the controller prints back (power state, board info,
//! USB routing) is parsed into typed values.

use std::{collections::BTreeMap, path::Path, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    shell::{ExpectStep, RemoteShell, ShellOutput, command_line},
};

/// Slots on the carrier board.
pub const NODE_COUNT: u8 = 4;

/// Where firmware images are staged on the controller before flashing.
pub const BMC_STAGING_DIR: &str = "/tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    /// The node drives the USB port.
    Host,
    /// The node is presented as a device to the port (or the BMC).
    Device,
}

impl UsbMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Normal,
    /// Mass-storage: the node's eMMC is exposed over USB for flashing.
    Msd,
}

impl NodeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Msd => "msd",
        }
    }
}

/// Power state per node, as reported by `tpi power status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerStatus {
    nodes: BTreeMap<u8, bool>,
}

impl PowerStatus {
    /// `None` when the controller did not report the node.
    #[must_use]
    pub fn is_on(&self, node: u8) -> Option<bool> {
        self.nodes.get(&node).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.nodes.iter().map(|(node, on)| (*node, *on))
    }
}

/// Key/value pairs from `tpi info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BmcInfo {
    pub fields: BTreeMap<String, String>,
}

impl BmcInfo {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStatus {
    pub mode: Option<UsbMode>,
    pub node: Option<u8>,
    /// Whether the port is routed to the BMC rather than the external connector.
    pub to_bmc: bool,
    pub raw: String,
}

fn check_node(node: u8) -> Result<()> {
    if (1..=NODE_COUNT).contains(&node) {
        Ok(())
    } else {
        Err(Error::invalid(format!("node {node} is outside 1-{NODE_COUNT}")))
    }
}

fn node_number(token: &str) -> Option<u8> {
    let digits = token
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == ' ' || c == '#');
    digits.parse().ok().filter(|n| (1..=NODE_COUNT).contains(n))
}

fn power_word(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Split a `key: value` or `| key | value |` line.
fn key_value(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.chars().all(|c| matches!(c, '|' | '-' | '+' | '=' | ' ')) {
        return None;
    }
    if line.starts_with('|') {
        let cells: Vec<&str> = line
            .trim_matches('|')
            .split('|')
            .map(str::trim)
            .collect();
        return match cells.as_slice() {
            [key, value] if !key.is_empty() => Some(((*key).to_string(), (*value).to_string())),
            _ => None,
        };
    }
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Parse `tpi power status`, e.g. `node1: On`.
pub fn parse_power_status(output: &str) -> Result<PowerStatus> {
    let nodes: BTreeMap<u8, bool> = output
        .lines()
        .filter_map(key_value)
        .filter_map(|(key, value)| Some((node_number(&key)?, power_word(&value)?)))
        .collect();
    if nodes.is_empty() {
        return Err(Error::parse("tpi power status", "no node power lines"));
    }
    Ok(PowerStatus { nodes })
}

/// Parse `tpi info`. Accepts both plain and table-formatted output.
#[must_use]
pub fn parse_info(output: &str) -> BmcInfo {
    BmcInfo {
        fields: output.lines().filter_map(key_value).collect(),
    }
}

/// Parse `tpi usb status`.
#[must_use]
pub fn parse_usb_status(output: &str) -> UsbStatus {
    let mut status = UsbStatus {
        raw: output.to_string(),
        ..UsbStatus::default()
    };
    for (key, value) in output.lines().filter_map(key_value) {
        let value_lc = value.to_ascii_lowercase();
        match key.to_ascii_lowercase().as_str() {
            "mode" => {
                status.mode = match value_lc.as_str() {
                    "host" => Some(UsbMode::Host),
                    "device" => Some(UsbMode::Device),
                    _ => None,
                };
            },
            "node" => status.node = node_number(&value),
            "route" => status.to_bmc = value_lc == "bmc",
            _ => {},
        }
    }
    status
}

/// The BMC reached over a [`RemoteShell`].
pub struct Bmc<S> {
    shell: S,
}

impl<S: RemoteShell> Bmc<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    async fn tpi(&self, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        let mut words = vec!["tpi"];
        words.extend_from_slice(args);
        let command = command_line(&words);
        debug!(target_host = %self.shell.target(), %command, "bmc command");
        let output = self.shell.exec(&command, cancel).await?.checked(&command)?;
        Ok(output.stdout)
    }

    pub async fn power_status(&self, cancel: &CancellationToken) -> Result<PowerStatus> {
        parse_power_status(&self.tpi(&["power", "status"], cancel).await?)
    }

    /// Power on one node, or every node when `node` is `None`.
    pub async fn power_on(&self, node: Option<u8>, cancel: &CancellationToken) -> Result<()> {
        self.power("on", node, cancel).await
    }

    pub async fn power_off(&self, node: Option<u8>, cancel: &CancellationToken) -> Result<()> {
        self.power("off", node, cancel).await
    }

    pub async fn reset(&self, node: u8, cancel: &CancellationToken) -> Result<()> {
        self.power("reset", Some(node), cancel).await
    }

    async fn power(&self, action: &str, node: Option<u8>, cancel: &CancellationToken) -> Result<()> {
        match node {
            Some(node) => {
                check_node(node)?;
                let node = node.to_string();
                self.tpi(&["power", action, "-n", &node], cancel).await?;
            },
            None => {
                self.tpi(&["power", action], cancel).await?;
            },
        }
        info!(action, node, "node power changed");
        Ok(())
    }

    pub async fn info(&self, cancel: &CancellationToken) -> Result<BmcInfo> {
        Ok(parse_info(&self.tpi(&["info"], cancel).await?))
    }

    pub async fn reboot(&self, cancel: &CancellationToken) -> Result<()> {
        self.tpi(&["reboot"], cancel).await?;
        info!(target_host = %self.shell.target(), "bmc reboot requested");
        Ok(())
    }

    /// Upload a firmware image to the controller and apply it.
    pub async fn firmware_upgrade(&self, local: &Path, cancel: &CancellationToken) -> Result<()> {
        let remote = staged_path(local)?;
        self.shell.upload(local, &remote, cancel).await?;
        self.tpi(&["firmware", "-f", &remote], cancel).await?;
        info!(firmware = %local.display(), "bmc firmware upgrade started");
        Ok(())
    }

    pub async fn usb_status(&self, cancel: &CancellationToken) -> Result<UsbStatus> {
        Ok(parse_usb_status(&self.tpi(&["usb", "status"], cancel).await?))
    }

    /// Route the USB port to `node` in `mode`; `to_bmc` routes it to the
    /// controller instead of the external connector.
    pub async fn set_usb(
        &self,
        mode: UsbMode,
        node: u8,
        to_bmc: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_node(node)?;
        let node_arg = node.to_string();
        let mut args = vec!["usb", mode.as_str(), "-n", &node_arg];
        if to_bmc {
            args.push("--bmc");
        }
        self.tpi(&args, cancel).await?;
        info!(node, mode = mode.as_str(), to_bmc, "usb routing changed");
        Ok(())
    }

    pub async fn reset_ethernet(&self, cancel: &CancellationToken) -> Result<()> {
        self.tpi(&["eth", "reset"], cancel).await.map(drop)
    }

    pub async fn set_node_mode(&self, node: u8, mode: NodeMode, cancel: &CancellationToken) -> Result<()> {
        check_node(node)?;
        let node_arg = node.to_string();
        self.tpi(&["advanced", mode.as_str(), "-n", &node_arg], cancel).await?;
        info!(node, mode = mode.as_str(), "node mode changed");
        Ok(())
    }

    /// Flash an image that already sits on the controller's filesystem.
    pub async fn flash_node(&self, node: u8, image: &str, cancel: &CancellationToken) -> Result<()> {
        check_node(node)?;
        let node_arg = node.to_string();
        info!(node, image, "flashing node");
        self.tpi(&["flash", "-n", &node_arg, "-i", image], cancel).await?;
        info!(node, "flash finished");
        Ok(())
    }

    /// Buffered UART output of `node` since the last read.
    pub async fn uart_read(&self, node: u8, cancel: &CancellationToken) -> Result<String> {
        check_node(node)?;
        let node_arg = node.to_string();
        self.tpi(&["uart", "-n", &node_arg, "get"], cancel).await
    }

    pub async fn uart_send(&self, node: u8, line: &str, cancel: &CancellationToken) -> Result<()> {
        check_node(node)?;
        let node_arg = node.to_string();
        self.tpi(&["uart", "-n", &node_arg, "set", "--cmd", line], cancel)
            .await
            .map(drop)
    }

    pub async fn expect_send(
        &self,
        steps: &[ExpectStep],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.shell.expect_send(steps, timeout, cancel).await
    }

    pub async fn upload(&self, local: &Path, remote: &str, cancel: &CancellationToken) -> Result<()> {
        self.shell.upload(local, remote, cancel).await
    }

    /// Run an arbitrary command; the exit status is left to the caller.
    pub async fn raw(&self, command: &str, cancel: &CancellationToken) -> Result<ShellOutput> {
        self.shell.exec(command, cancel).await
    }
}

fn staged_path(local: &Path) -> Result<String> {
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid(format!("{} has no usable file name", local.display())))?;
    Ok(format!("{BMC_STAGING_DIR}/{name}"))
}
