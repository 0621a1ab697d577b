use std::path::{Path, PathBuf};

/// Where an intermediate image lives.
///
/// A container-backed run may keep the decompressed image inside the
/// container's own filesystem when the host cannot hold it; every later stage
/// then has to run in the same container until the image is repacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocation {
    Host(PathBuf),
    Container(PathBuf),
}

impl ImageLocation {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Host(p) | Self::Container(p) => p,
        }
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host(_))
    }
}

impl std::fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(p) => write!(f, "{}", p.display()),
            Self::Container(p) => write!(f, "container:{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_marks_container_paths() {
        let host = ImageLocation::Host("/ws/node1.img".into());
        let inner = ImageLocation::Container("/var/tmp/turingpi/node1.img".into());
        assert_eq!(host.to_string(), "/ws/node1.img");
        assert_eq!(inner.to_string(), "container:/var/tmp/turingpi/node1.img");
        assert!(host.is_host());
        assert!(!inner.is_host());
        assert_eq!(inner.path(), Path::new("/var/tmp/turingpi/node1.img"));
    }
}
