use std::{net::Ipv4Addr, path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    tracing::{info, warn},
    turingpi_config::TuringPiConfig,
    turingpi_container::{
        ContainerRegistry, Deadlines, DockerCli, SessionOptions, endpoint::EndpointOptions,
    },
    turingpi_image::{
        ContainerSettings, ExecutionMode, Executor, ImagePipeline, MutationPlanner, PipelineConfig,
        PreparationJob, TempManager,
    },
};

#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Compressed source image (`*.img.xz`).
    #[arg(long, short)]
    pub source: PathBuf,

    /// Node slot on the board, 1-4.
    #[arg(long, short)]
    pub node: u8,

    /// Static address. Defaults to the node's `ip` in the config.
    #[arg(long)]
    pub ip: Option<Ipv4Addr>,

    /// Prefix length. Defaults to `network.prefix_len`.
    #[arg(long)]
    pub prefix: Option<u8>,

    /// Default gateway. Defaults to `network.gateway`.
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,

    /// DNS servers, comma separated. Defaults to `network.dns`.
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<Ipv4Addr>,

    /// Defaults to the node's `hostname` in the config, then `node<N>`.
    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(long, env = "TURINGPI_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, env = "TURINGPI_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Where image tools run: auto, host, or container.
    #[arg(long, default_value = "auto")]
    pub mode: ExecutionMode,

    /// Leave the decompressed image and workspace behind.
    #[arg(long)]
    pub keep_intermediate: bool,

    /// Read every write back and keep a `.sha256` next to the artefact.
    #[arg(long)]
    pub verify: bool,

    /// xz preset, 0-9. Defaults to `images.compression_level`.
    #[arg(long)]
    pub compression_level: Option<u32>,

    /// Copy a local file into the image, `LOCAL:IMAGE_PATH`. Repeatable.
    #[arg(long = "copy", value_name = "LOCAL:IMAGE_PATH")]
    pub copies: Vec<String>,
}

/// Merge flags over the config. Flags win; the node entry fills gaps.
pub fn build_job(args: &PrepareArgs, config: &TuringPiConfig) -> Result<PreparationJob> {
    let node = config.node(args.node);

    let Some(address) = args.ip.or_else(|| node.and_then(|n| n.ip)) else {
        bail!("no address for node {}: pass --ip or set it in the config", args.node);
    };
    let Some(gateway) = args.gateway.or(config.network.gateway) else {
        bail!("no gateway: pass --gateway or set network.gateway");
    };
    let prefix = args.prefix.unwrap_or(config.network.prefix_len);

    let mut job = PreparationJob::new(&args.source, args.node, address, prefix, gateway);
    if !args.dns.is_empty() {
        job.dns = args.dns.clone();
    } else if !config.network.dns.is_empty() {
        job.dns = config.network.dns.clone();
    }
    job.hostname = args
        .hostname
        .clone()
        .or_else(|| node.and_then(|n| n.hostname.clone()));
    job.output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.images.output_dir.clone());
    job.temp_dir = args
        .temp_dir
        .clone()
        .or_else(|| config.images.temp_dir.clone());
    job.keep_intermediate = args.keep_intermediate || config.images.keep_intermediate;
    job.verify_checksums = args.verify || config.images.verify_checksums;

    let mut plan = MutationPlanner::new();
    for spec in &args.copies {
        let Some((local, dest)) = spec.split_once(':') else {
            bail!("--copy {spec:?} is not LOCAL:IMAGE_PATH");
        };
        plan.copy_local(local, dest);
    }
    job.mutations = plan.into_operations();

    job.validate()?;
    Ok(job)
}

pub(crate) fn deadlines(config: &TuringPiConfig) -> Deadlines {
    Deadlines {
        stop_grace: Duration::from_secs(config.container.stop_grace_secs),
        per_container: Duration::from_secs(config.container.cleanup_timeout_secs),
        sweep: Duration::from_secs(config.container.sweep_timeout_secs),
    }
}

fn container_settings(config: &TuringPiConfig) -> ContainerSettings {
    let c = &config.container;
    ContainerSettings {
        image: c.worker_image.clone(),
        name_prefix: c.name_prefix.clone(),
        session: SessionOptions {
            endpoint: EndpointOptions {
                context: c.docker_context.clone(),
                host: c.docker_host.clone(),
            },
            stop_grace: Duration::from_secs(c.stop_grace_secs),
            exec_timeout: c.exec_timeout_secs.map(Duration::from_secs),
            cli: DockerCli::default(),
        },
    }
}

pub async fn handle_prepare(args: PrepareArgs) -> Result<()> {
    let config = turingpi_config::discover_and_load();
    let job = build_job(&args, &config)?;
    let hostname = job.hostname();

    let registry = ContainerRegistry::init_global(deadlines(&config));
    let executor = Executor::new(
        args.mode,
        container_settings(&config),
        Arc::clone(&registry),
        config.images.expansion_ratio,
    );
    info!(node = job.node_index, %hostname, mode = ?executor.effective_mode(), "preparing node image");

    let temp = TempManager::global();
    temp.set_max_age(Duration::from_secs(config.images.temp_max_age_secs));
    temp.start_sweeper(Duration::from_secs(config.images.sweep_interval_secs.max(1)));

    let pipeline = ImagePipeline::new(Arc::new(executor), Arc::clone(&temp), PipelineConfig {
        compression_level: args
            .compression_level
            .unwrap_or(config.images.compression_level),
        ..PipelineConfig::default()
    });

    // Signals cancel the registry's token; the run stops at its next await.
    let cancel = registry.shutdown_token().child_token();
    let outcome = pipeline.prepare_image(&job, &cancel).await;

    temp.shutdown().await;
    let report = registry.close().await;
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "some worker containers could not be removed");
    }

    let path = outcome.with_context(|| format!("preparing image for {hostname}"))?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        clap::Parser,
        turingpi_config::{NetworkConfig, NodeConfig},
        turingpi_image::MutationOp,
    };

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: PrepareArgs,
    }

    fn parse(argv: &[&str]) -> PrepareArgs {
        let mut full = vec!["prepare"];
        full.extend_from_slice(argv);
        Harness::try_parse_from(full).unwrap().args
    }

    fn cluster_config() -> TuringPiConfig {
        TuringPiConfig {
            network: NetworkConfig {
                prefix_len: 24,
                gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
                dns: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(9, 9, 9, 9)],
            },
            nodes: vec![NodeConfig {
                index: 2,
                hostname: Some("rk1-b".into()),
                ip: Some(Ipv4Addr::new(10, 0, 0, 12)),
                user: None,
            }],
            ..TuringPiConfig::default()
        }
    }

    #[test]
    fn node_entry_fills_the_gaps() {
        let args = parse(&["-s", "/srv/ubuntu.img.xz", "-n", "2", "--output-dir", "/out"]);
        let job = build_job(&args, &cluster_config()).unwrap();
        assert_eq!(job.address, Ipv4Addr::new(10, 0, 0, 12));
        assert_eq!(job.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(job.dns.len(), 2);
        assert_eq!(job.hostname(), "rk1-b");
        assert_eq!(job.output_path().unwrap(), PathBuf::from("/out/rk1-b.img.xz"));
        assert_eq!(args.mode, ExecutionMode::Auto);
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "-s",
            "/srv/ubuntu.img.xz",
            "-n",
            "2",
            "--ip",
            "192.168.1.22",
            "--prefix",
            "16",
            "--gateway",
            "192.168.0.1",
            "--dns",
            "8.8.8.8,8.8.4.4",
            "--hostname",
            "worker",
            "--mode",
            "container",
            "--verify",
            "--copy",
            "/home/me/id.pub:/root/.ssh/authorized_keys",
        ]);
        let job = build_job(&args, &cluster_config()).unwrap();
        assert_eq!(job.address, Ipv4Addr::new(192, 168, 1, 22));
        assert_eq!(job.prefix, 16);
        assert_eq!(job.dns, [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]);
        assert_eq!(job.hostname(), "worker");
        assert!(job.verify_checksums);
        assert_eq!(args.mode, ExecutionMode::Container);
        assert!(matches!(
            &job.mutations[..],
            [MutationOp::CopyLocal { src, dst }]
                if src == &PathBuf::from("/home/me/id.pub") && dst == &PathBuf::from("/root/.ssh/authorized_keys")
        ));
    }

    #[test]
    fn missing_address_is_reported() {
        let args = parse(&["-s", "/srv/ubuntu.img.xz", "-n", "3"]);
        let err = build_job(&args, &cluster_config()).unwrap_err();
        assert!(err.to_string().contains("no address for node 3"));
    }

    #[test]
    fn malformed_copy_is_rejected() {
        let args = parse(&["-s", "/srv/ubuntu.img.xz", "-n", "2", "--copy", "nocolon"]);
        assert!(build_job(&args, &cluster_config()).is_err());
    }

    #[test]
    fn job_validation_still_applies() {
        let args = parse(&["-s", "/srv/ubuntu.img", "-n", "2"]);
        let err = build_job(&args, &cluster_config()).unwrap_err();
        assert!(err.to_string().contains(".xz"));
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        assert!(Harness::try_parse_from(["prepare", "-s", "a.img.xz", "-n", "1", "--mode", "vm"]).is_err());
    }

    #[test]
    fn config_maps_onto_container_settings() {
        let mut config = cluster_config();
        config.container.docker_context = Some("colima".into());
        config.container.exec_timeout_secs = None;
        let settings = container_settings(&config);
        assert_eq!(settings.image, "turingpi-image-prep:latest");
        assert_eq!(settings.session.endpoint.context.as_deref(), Some("colima"));
        assert!(settings.session.exec_timeout.is_none());
        assert_eq!(deadlines(&config).per_container, Duration::from_secs(30));
    }
}
