use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use directories::BaseDirs;

use crate::{
    error::{Error, Result},
    mutation::MutationOp,
    network::NetworkIdentity,
};

/// One node image to prepare.
#[derive(Debug, Clone)]
pub struct PreparationJob {
    /// Compressed source image (`*.xz`).
    pub source: PathBuf,
    /// Slot on the board, 1 through 4.
    pub node_index: u8,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    /// Defaults to `node<index>`.
    pub hostname: Option<String>,
    /// Defaults to `<user cache>/turingpi/images`.
    pub output_dir: Option<PathBuf>,
    /// Base for the scratch workspace; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    pub keep_intermediate: bool,
    pub verify_checksums: bool,
    /// Extra edits applied after the network identity.
    pub mutations: Vec<MutationOp>,
}

impl PreparationJob {
    #[must_use]
    pub fn new(
        source: impl Into<PathBuf>,
        node_index: u8,
        address: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Self {
        Self {
            source: source.into(),
            node_index,
            address,
            prefix,
            gateway,
            dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
            hostname: None,
            output_dir: None,
            temp_dir: None,
            keep_intermediate: false,
            verify_checksums: false,
            mutations: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.extension().is_none_or(|ext| ext != "xz") {
            return Err(Error::invalid(format!(
                "source {} must be an .xz image",
                self.source.display()
            )));
        }
        if !(1..=4).contains(&self.node_index) {
            return Err(Error::invalid(format!(
                "node index {} is outside 1-4",
                self.node_index
            )));
        }
        if !(1..=32).contains(&self.prefix) {
            return Err(Error::invalid(format!(
                "/{} is not an IPv4 prefix length",
                self.prefix
            )));
        }
        if self.dns.is_empty() {
            return Err(Error::invalid("at least one DNS server is required"));
        }
        if let Some(raw) = self.hostname.as_deref() {
            let hostname = raw.trim();
            if hostname.is_empty() {
                return Err(Error::invalid("hostname is empty"));
            }
            if !is_hostname_label(hostname) {
                return Err(Error::invalid(format!(
                    "hostname {hostname:?} must be 1-63 letters, digits or '-', not starting or ending with '-'"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn hostname(&self) -> String {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map_or_else(|| format!("node{}", self.node_index), String::from)
    }

    pub fn output_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(dir.clone());
        }
        default_output_dir()
    }

    /// `<output>/<hostname>.img.xz`
    pub fn output_path(&self) -> Result<PathBuf> {
        Ok(self.output_dir()?.join(format!("{}.img.xz", self.hostname())))
    }

    /// Directory the source lives in, mounted read-only into a worker.
    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    #[must_use]
    pub fn temp_base(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("turingpi"))
    }

    #[must_use]
    pub fn identity(&self) -> NetworkIdentity {
        NetworkIdentity {
            hostname: self.hostname(),
            address: self.address,
            prefix: self.prefix,
            gateway: self.gateway,
            dns: self.dns.clone(),
        }
    }
}

/// A single RFC 1123 label. The hostname names the output file, the scratch
/// workspace and lines in `/etc/hosts`, so nothing else is accepted.
#[must_use]
pub fn is_hostname_label(name: &str) -> bool {
    (1..=63).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// `<user cache>/turingpi/images`
pub fn default_output_dir() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.cache_dir().join("turingpi").join("images"))
        .ok_or_else(|| Error::Message("could not determine the user cache directory".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    fn job() -> PreparationJob {
        PreparationJob::new(
            "/srv/images/ubuntu-rk1.img.xz",
            3,
            Ipv4Addr::new(192, 168, 1, 13),
            24,
            Ipv4Addr::new(192, 168, 1, 1),
        )
    }

    #[test]
    fn defaults() {
        let job = job();
        job.validate().unwrap();
        assert_eq!(job.hostname(), "node3");
        assert_eq!(job.source_dir(), Path::new("/srv/images"));
        assert!(job.output_path().unwrap().ends_with("turingpi/images/node3.img.xz"));
        let id = job.identity();
        assert_eq!(id.hostname, "node3");
        assert_eq!(id.dns, [Ipv4Addr::new(1, 1, 1, 1)]);
    }

    #[test]
    fn explicit_hostname_and_output() {
        let mut job = job();
        job.hostname = Some("  rk1-c ".into());
        job.output_dir = Some("/out".into());
        assert_eq!(job.output_path().unwrap(), Path::new("/out/rk1-c.img.xz"));
    }

    #[rstest]
    #[case::not_xz(|j: &mut PreparationJob| j.source = "/srv/images/disk.img".into())]
    #[case::node_zero(|j: &mut PreparationJob| j.node_index = 0)]
    #[case::node_five(|j: &mut PreparationJob| j.node_index = 5)]
    #[case::prefix_zero(|j: &mut PreparationJob| j.prefix = 0)]
    #[case::prefix_33(|j: &mut PreparationJob| j.prefix = 33)]
    #[case::no_dns(|j: &mut PreparationJob| j.dns.clear())]
    #[case::blank_hostname(|j: &mut PreparationJob| j.hostname = Some("   ".into()))]
    #[case::path_escape(|j: &mut PreparationJob| j.hostname = Some("../../etc/cron.d/x".into()))]
    #[case::slash(|j: &mut PreparationJob| j.hostname = Some("rk1/b".into()))]
    #[case::newline(|j: &mut PreparationJob| j.hostname = Some("node1\n10.0.0.9 evil".into()))]
    #[case::dotted(|j: &mut PreparationJob| j.hostname = Some("node1.lan".into()))]
    #[case::leading_dash(|j: &mut PreparationJob| j.hostname = Some("-node1".into()))]
    #[case::trailing_dash(|j: &mut PreparationJob| j.hostname = Some("node1-".into()))]
    #[case::too_long(|j: &mut PreparationJob| j.hostname = Some("n".repeat(64)))]
    fn invalid_jobs(#[case] tweak: fn(&mut PreparationJob)) {
        let mut job = job();
        tweak(&mut job);
        assert!(matches!(job.validate(), Err(Error::InputInvalid(_))));
    }

    #[test]
    fn unusual_prefix_passes_job_validation() {
        let mut job = job();
        job.prefix = 20;
        job.validate().unwrap();
    }

    #[rstest]
    #[case("node1")]
    #[case("rk1-b")]
    #[case("CM4")]
    #[case("a")]
    fn hostname_labels_are_accepted(#[case] name: &str) {
        let mut job = job();
        job.hostname = Some(name.into());
        job.validate().unwrap();
        assert_eq!(job.output_path().unwrap().file_name().unwrap().to_str().unwrap(), format!("{name}.img.xz"));
    }

    #[test]
    fn label_length_limit() {
        assert!(is_hostname_label(&"n".repeat(63)));
        assert!(!is_hostname_label(&"n".repeat(64)));
        assert!(!is_hostname_label(""));
    }
}
