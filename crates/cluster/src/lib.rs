//! Cluster board interfaces.
//!
//! [`Bmc`] drives the board management controller through its `tpi` command
//! surface; [`NodeShell`] talks to individual compute nodes. Both sit on a
//! [`RemoteShell`], with [`OpenSshShell`] as the stock transport.

pub mod bmc;
pub mod error;
pub mod expect;
pub mod node;
pub mod retry;
pub mod shell;
pub mod ssh;

pub use {
    bmc::{Bmc, BmcInfo, NODE_COUNT, NodeMode, PowerStatus, UsbMode, UsbStatus},
    error::{Error, Result},
    node::NodeShell,
    retry::RetryPolicy,
    shell::{ExpectStep, RemoteShell, ShellOutput},
    ssh::OpenSshShell,
};
