//! Parse the partition mapper's `add map` report.
//!
//! ```text
//! add map loop0p1 (253:0): 0 524288 linear 7:0 8192
//! add map loop0p2 (253:1): 0 3530752 linear 7:0 532480
//! ```

use std::path::PathBuf;

use crate::error::{Error, Result};

/// One mapped partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPartition {
    /// Device name without the `/dev/mapper/` prefix, e.g. `loop0p2`.
    pub name: String,
    /// Length in 512-byte sectors, when the line carried one.
    pub sectors: Option<u64>,
}

impl MappedPartition {
    #[must_use]
    pub fn device(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub partitions: Vec<MappedPartition>,
    root: usize,
}

impl PartitionTable {
    #[must_use]
    pub fn root(&self) -> &MappedPartition {
        &self.partitions[self.root]
    }

    #[must_use]
    pub fn root_device(&self) -> PathBuf {
        self.root().device()
    }
}

/// `loopNpM`, digits on both sides.
fn is_partition_device(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("loop") else {
        return false;
    };
    let Some((loop_no, part_no)) = rest.split_once('p') else {
        return false;
    };
    !loop_no.is_empty()
        && !part_no.is_empty()
        && loop_no.bytes().all(|b| b.is_ascii_digit())
        && part_no.bytes().all(|b| b.is_ascii_digit())
}

fn parse_line(line: &str) -> Option<MappedPartition> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"add") {
        return None;
    }
    let name = tokens
        .iter()
        .map(|t| t.strip_prefix("/dev/mapper/").unwrap_or(t))
        .find(|t| is_partition_device(t))?;
    Some(MappedPartition {
        name: name.to_string(),
        sectors: tokens.get(5).and_then(|t| t.parse().ok()),
    })
}

/// Parse mapper output and pick the root partition.
///
/// The root is the largest partition; equal sizes resolve to the later entry.
/// When no line carries a size the second partition line is used.
pub fn parse_mapping(output: &str) -> Result<PartitionTable> {
    let partitions: Vec<MappedPartition> = output.lines().filter_map(parse_line).collect();
    if partitions.len() < 2 {
        return Err(Error::UnsupportedLayout {
            found: partitions.len(),
        });
    }

    let largest = partitions
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.sectors.map(|s| (i, s)))
        .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ia.cmp(ib)))
        .map(|(i, _)| i);

    Ok(PartitionTable {
        root: largest.unwrap_or(1),
        partitions,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest, std::path::Path};

    const RASPI: &str = "\
add map loop0p1 (253:0): 0 524288 linear 7:0 8192
add map loop0p2 (253:1): 0 3530752 linear 7:0 532480
";

    #[test]
    fn picks_largest_partition() {
        let table = parse_mapping(RASPI).unwrap();
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.root().name, "loop0p2");
        assert_eq!(table.root_device(), Path::new("/dev/mapper/loop0p2"));
    }

    #[test]
    fn largest_wins_even_when_not_last() {
        let out = "\
add map loop3p1 (253:0): 0 8192 linear 7:3 2048
add map loop3p2 (253:1): 0 9000000 linear 7:3 10240
add map loop3p3 (253:2): 0 204800 linear 7:3 9010240
";
        assert_eq!(parse_mapping(out).unwrap().root().name, "loop3p2");
    }

    #[test]
    fn ties_resolve_to_later_entry() {
        let out = "\
add map loop1p1 (253:0): 0 4096 linear 7:1 0
add map loop1p2 (253:1): 0 4096 linear 7:1 4096
";
        assert_eq!(parse_mapping(out).unwrap().root().name, "loop1p2");
    }

    #[test]
    fn falls_back_to_second_line_without_sizes() {
        let out = "add map loop0p1\nadd map loop0p2\nadd map loop0p3\n";
        let table = parse_mapping(out).unwrap();
        assert_eq!(table.root().name, "loop0p2");
        assert!(table.partitions.iter().all(|p| p.sectors.is_none()));
    }

    #[test]
    fn accepts_mapper_prefixed_names_and_ignores_noise() {
        let out = "\
loop deleted : /dev/loop0
add map /dev/mapper/loop7p1 (253:4): 0 100 linear 7:7 0
warning: something odd
add map /dev/mapper/loop7p2 (253:5): 0 200 linear 7:7 100
";
        let table = parse_mapping(out).unwrap();
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.root_device(), Path::new("/dev/mapper/loop7p2"));
    }

    #[rstest]
    #[case("")]
    #[case("add map loop0p1 (253:0): 0 524288 linear 7:0 8192\n")]
    #[case("add map loop0 (253:0): 0 1 linear 7:0 0\nadd map loopXp2 (253:1): 0 1 linear 7:0 0\n")]
    #[case("del devmap : loop0p1\ndel devmap : loop0p2\n")]
    fn rejects_single_partition_layouts(#[case] out: &str) {
        let err = parse_mapping(out).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout { found } if found < 2));
    }
}
