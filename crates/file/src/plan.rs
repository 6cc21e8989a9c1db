use std::path::{Path, PathBuf};

use crate::{part_path, Error, TransferOptions};

/// What a metadata-only probe learned about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub supports_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleStream,
    MultiPart { part_count: u64, part_size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub supports_range: bool,
    pub total_size: Option<u64>,
    pub strategy: Strategy,
}

impl TransferPlan {
    /// Multi-part is only chosen for range-capable sources larger than the
    /// large-file threshold, and never while a partial resume is pending.
    pub fn decide(probe: ProbeResult, resume_offset: u64, opts: &TransferOptions) -> Self {
        let single = Self {
            supports_range: probe.supports_range,
            total_size: probe.total_size,
            strategy: Strategy::SingleStream,
        };

        if !opts.use_multipart || !probe.supports_range || resume_offset > 0 {
            return single;
        }

        let Some(total) = probe.total_size else {
            return single;
        };
        if total <= opts.large_file_threshold {
            return single;
        }

        let part_count = opts
            .max_connections_per_file
            .min((total / opts.min_part_size.max(1)).max(1))
            .max(1);
        if part_count < 2 {
            return single;
        }

        Self {
            strategy: Strategy::MultiPart {
                part_count,
                part_size: total / part_count,
            },
            ..single
        }
    }
}

/// One byte range of a multi-part transfer, owned by a single splitter run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartJob {
    pub index: u64,
    pub start_byte: u64,
    /// Inclusive.
    pub end_byte: u64,
    pub temp_part_path: PathBuf,
}

impl PartJob {
    pub fn size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }
}

/// Equal-sized parts covering exactly `[0, total_size)`; the last part absorbs the remainder.
pub fn split_parts(
    total_size: u64,
    part_count: u64,
    dest: impl AsRef<Path>,
) -> Result<Vec<PartJob>, Error> {
    if part_count == 0 {
        return Err(Error::InvalidRange("part count must be at least 1".into()));
    }
    if total_size < part_count {
        return Err(Error::InvalidRange(format!(
            "cannot split {} bytes into {} parts",
            total_size, part_count
        )));
    }

    let part_size = total_size / part_count;
    let parts = (0..part_count)
        .map(|index| {
            let start_byte = index * part_size;
            let end_byte = if index == part_count - 1 {
                total_size - 1
            } else {
                start_byte + part_size - 1
            };

            PartJob {
                index,
                start_byte,
                end_byte,
                temp_part_path: part_path(dest.as_ref(), index),
            }
        })
        .collect();

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIB;

    fn probe(total: u64, ranges: bool) -> ProbeResult {
        ProbeResult {
            total_size: Some(total),
            supports_range: ranges,
        }
    }

    #[test]
    fn test_split_parts_covers_range() {
        for (total, count) in [(10, 1), (10, 3), (1000, 8), (7, 7), (1024, 2)] {
            let parts = split_parts(total, count, "/tmp/model.imx").unwrap();
            assert_eq!(parts.len() as u64, count);
            assert_eq!(parts[0].start_byte, 0);
            assert_eq!(parts.last().unwrap().end_byte, total - 1);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].end_byte + 1, pair[1].start_byte);
            }
            assert_eq!(parts.iter().map(PartJob::size).sum::<u64>(), total);
        }
    }

    #[test]
    fn test_split_parts_rejects_bad_input() {
        assert!(matches!(
            split_parts(10, 0, "/tmp/x"),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            split_parts(2, 3, "/tmp/x"),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_part_paths() {
        let parts = split_parts(100, 2, "/tmp/voice.wav").unwrap();
        assert_eq!(
            parts[1].temp_part_path,
            PathBuf::from("/tmp/voice.wav.tmp.part1")
        );
    }

    #[test]
    fn test_decide() {
        let opts = TransferOptions::default();

        let plan = TransferPlan::decide(probe(100 * MIB, true), 0, &opts);
        assert_eq!(
            plan.strategy,
            Strategy::MultiPart {
                part_count: 3,
                part_size: 100 * MIB / 3
            }
        );

        let small = TransferPlan::decide(probe(MIB, true), 0, &opts);
        assert_eq!(small.strategy, Strategy::SingleStream);

        let no_ranges = TransferPlan::decide(probe(100 * MIB, false), 0, &opts);
        assert_eq!(no_ranges.strategy, Strategy::SingleStream);

        let resuming = TransferPlan::decide(probe(100 * MIB, true), 42, &opts);
        assert_eq!(resuming.strategy, Strategy::SingleStream);

        let unknown = TransferPlan::decide(ProbeResult::default(), 0, &opts);
        assert_eq!(unknown.strategy, Strategy::SingleStream);
        assert_eq!(unknown.total_size, None);

        let disabled = TransferOptions {
            use_multipart: false,
            ..Default::default()
        };
        let plan = TransferPlan::decide(probe(100 * MIB, true), 0, &disabled);
        assert_eq!(plan.strategy, Strategy::SingleStream);
    }

    #[test]
    fn test_decide_part_count_follows_min_part_size() {
        let opts = TransferOptions::default();

        // 12 MiB / 5 MiB = 2 parts, below the connection limit.
        let plan = TransferPlan::decide(probe(12 * MIB, true), 0, &opts);
        assert_eq!(
            plan.strategy,
            Strategy::MultiPart {
                part_count: 2,
                part_size: 6 * MIB
            }
        );
    }
}
