use std::time::Duration;

/// Byte-level progress of a single transfer.
///
/// `Progress` is emitted at a bounded wall-clock interval, never per chunk.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DownloadProgress {
    Started,
    Progress {
        downloaded: u64,
        total: Option<u64>,
        bytes_per_sec: f64,
    },
    Finished,
}

impl DownloadProgress {
    /// Fraction of the transfer done, if the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            DownloadProgress::Started => Some(0.0),
            DownloadProgress::Finished => Some(1.0),
            DownloadProgress::Progress {
                downloaded, total, ..
            } => match total {
                Some(0) | None => None,
                Some(total) => Some((*downloaded as f64 / *total as f64).clamp(0.0, 1.0)),
            },
        }
    }

    /// Time left at the current transfer rate.
    pub fn eta(&self) -> Option<Duration> {
        match self {
            DownloadProgress::Progress {
                downloaded,
                total: Some(total),
                bytes_per_sec,
            } if *bytes_per_sec > 0.0 => {
                let remaining = total.saturating_sub(*downloaded) as f64;
                Some(Duration::from_secs_f64(remaining / bytes_per_sec))
            }
            _ => None,
        }
    }
}
