//! Daemon endpoint discovery.
//!
//! Order: named context (explicit, `DOCKER_CONTEXT`, or the CLI's current
//! context), then `DOCKER_HOST`, then the client's local defaults. Each
//! candidate is pinged; the first that answers wins.

use {
    bollard::{API_DEFAULT_VERSION, Docker},
    tracing::{debug, info, warn},
};

use crate::{
    cli::DockerCli,
    error::{DaemonHint, Error, Result},
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Address from a CLI context.
    Context { name: String, host: String },
    /// Address from `DOCKER_HOST`.
    Env(String),
    /// Platform default socket / named pipe.
    Local,
}

impl Endpoint {
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Context { name, host } => format!("context {name} ({host})"),
            Self::Env(host) => format!("DOCKER_HOST ({host})"),
            Self::Local => "local defaults".into(),
        }
    }
}

/// Settings that steer discovery; `None` fields fall back to the environment.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub context: Option<String>,
    pub host: Option<String>,
}

/// Build a client for a `unix://`, `npipe://`, `tcp://` or `http://` address.
pub fn client_for_host(host: &str) -> Result<Docker> {
    let connect_err = |e: bollard::errors::Error| Error::daemon(DaemonHint::NotRunning, e.to_string());
    if let Some(path) = host.strip_prefix("unix://") {
        return Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(connect_err);
    }
    if host.starts_with("npipe://") {
        return Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(connect_err);
    }
    if let Some(addr) = host.strip_prefix("tcp://") {
        return Docker::connect_with_http(
            &format!("http://{addr}"),
            CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(connect_err);
    }
    if host.starts_with("http://") {
        return Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(connect_err);
    }
    Err(Error::daemon(
        DaemonHint::ContextMisconfigured,
        format!("unsupported daemon address {host}"),
    ))
}

/// Candidate endpoints in priority order.
pub async fn candidates(cli: &DockerCli, opts: &EndpointOptions) -> Vec<Endpoint> {
    let mut out = Vec::with_capacity(3);

    let context = opts
        .context
        .clone()
        .or_else(|| std::env::var("DOCKER_CONTEXT").ok())
        .filter(|c| !c.is_empty());
    if cli.is_available()
        && let Some(host) = cli.context_host(context.as_deref()).await
    {
        let name = context.unwrap_or_else(|| "current".into());
        out.push(Endpoint::Context { name, host });
    }

    let env_host = opts
        .host
        .clone()
        .or_else(|| std::env::var("DOCKER_HOST").ok())
        .filter(|h| !h.is_empty());
    if let Some(host) = env_host
        && !out
            .iter()
            .any(|e| matches!(e, Endpoint::Context { host: h, .. } if *h == host))
    {
        out.push(Endpoint::Env(host));
    }

    out.push(Endpoint::Local);
    out
}

/// Connect to the first endpoint that answers a ping.
pub async fn connect(cli: &DockerCli, opts: &EndpointOptions) -> Result<(Docker, Endpoint)> {
    let mut last_error = String::from("no endpoints tried");

    for endpoint in candidates(cli, opts).await {
        debug!(endpoint = %endpoint.label(), "trying container daemon endpoint");
        let client = match &endpoint {
            Endpoint::Context { host, .. } | Endpoint::Env(host) => client_for_host(host),
            Endpoint::Local => Docker::connect_with_local_defaults()
                .map_err(|e| Error::daemon(DaemonHint::NotRunning, e.to_string())),
        };
        let docker = match client {
            Ok(docker) => docker,
            Err(e) => {
                debug!(endpoint = %endpoint.label(), error = %e, "could not build client");
                last_error = e.to_string();
                continue;
            },
        };
        match docker.ping().await {
            Ok(_) => {
                info!(endpoint = %endpoint.label(), "connected to container daemon");
                return Ok((docker, endpoint));
            },
            Err(e) => {
                debug!(endpoint = %endpoint.label(), error = %e, "daemon did not answer");
                last_error = e.to_string();
            },
        }
    }

    let hint = diagnose(cli);
    warn!(hint = %hint, error = %last_error, "container daemon unavailable");
    Err(Error::daemon(hint, last_error))
}

/// Tell "not installed" from "not running" from "CLI works, we don't".
#[must_use]
pub fn diagnose(cli: &DockerCli) -> DaemonHint {
    classify(cli.is_available(), cli.is_available() && cli.daemon_reachable())
}

fn classify(cli_available: bool, cli_reaches_daemon: bool) -> DaemonHint {
    match (cli_available, cli_reaches_daemon) {
        (false, _) => DaemonHint::NotInstalled,
        (true, false) => DaemonHint::NotRunning,
        (true, true) => DaemonHint::ContextMisconfigured,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(false, false, DaemonHint::NotInstalled)]
    #[case(true, false, DaemonHint::NotRunning)]
    #[case(true, true, DaemonHint::ContextMisconfigured)]
    fn hint_classification(
        #[case] cli: bool,
        #[case] reaches: bool,
        #[case] expected: DaemonHint,
    ) {
        assert_eq!(classify(cli, reaches), expected);
    }

    #[test]
    fn rejects_ssh_addresses() {
        let err = client_for_host("ssh://pi@bmc").unwrap_err();
        assert!(matches!(
            err,
            Error::DaemonUnavailable {
                hint: DaemonHint::ContextMisconfigured,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn explicit_host_precedes_local_defaults() {
        let cli = DockerCli::with_binary("turingpi-no-such-binary-xyz");
        let opts = EndpointOptions {
            context: None,
            host: Some("tcp://10.0.0.5:2375".into()),
        };
        let found = candidates(&cli, &opts).await;
        assert_eq!(found, vec![
            Endpoint::Env("tcp://10.0.0.5:2375".into()),
            Endpoint::Local
        ]);
    }
}
