use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Tunables for one transport. Built once per setup run from the settings snapshot.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub connect_timeout: Duration,
    /// Longest wait for the next body chunk before the read is abandoned.
    pub read_timeout: Duration,
    pub probe_timeout: Duration,
    pub chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_connections_per_file: u64,
    pub large_file_threshold: u64,
    pub min_part_size: u64,
    pub use_multipart: bool,
    pub progress_interval: Duration,
    pub user_agent: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(60),
            chunk_size: MIB,
            max_chunk_size: 4 * MIB,
            max_connections_per_file: 3,
            large_file_threshold: 10 * MIB,
            min_part_size: 5 * MIB,
            use_multipart: true,
            progress_interval: Duration::from_secs(1),
            user_agent: concat!("asset-acquisition/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransferOptions {
    /// Write-buffer size for a transfer of `total_size` bytes.
    pub fn adaptive_chunk_size(&self, total_size: Option<u64>) -> usize {
        let size = match total_size {
            Some(total) if total > GIB => 4 * MIB,
            Some(total) if total > 100 * MIB => 2 * MIB,
            _ => self.chunk_size,
        };

        size.max(self.chunk_size)
            .min(self.max_chunk_size.max(1))
            .max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_chunk_size() {
        let opts = TransferOptions::default();

        assert_eq!(opts.adaptive_chunk_size(None), MIB as usize);
        assert_eq!(opts.adaptive_chunk_size(Some(50 * MIB)), MIB as usize);
        assert_eq!(opts.adaptive_chunk_size(Some(200 * MIB)), 2 * MIB as usize);
        assert_eq!(opts.adaptive_chunk_size(Some(2 * GIB)), 4 * MIB as usize);

        let capped = TransferOptions {
            max_chunk_size: 2 * MIB,
            ..Default::default()
        };
        assert_eq!(capped.adaptive_chunk_size(Some(2 * GIB)), 2 * MIB as usize);
    }
}
