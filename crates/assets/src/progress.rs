use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use acq_download_interface::DownloadProgress;

/// Marks machine-parseable progress ticks.
pub const PROGRESS_PREFIX: &str = "PROGRESS: ";
/// Marks terminal failure ticks.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Receives `(message, fraction)` ticks for a whole setup run.
///
/// Called with the aggregator lock held, so consecutive fractions are
/// non-decreasing; implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, f64) + Send + Sync,
{
    fn report(&self, message: &str, fraction: f64) {
        self(message, fraction)
    }
}

/// Forwards ticks to `tracing`.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, message: &str, fraction: f64) {
        if message.starts_with(ERROR_PREFIX) {
            tracing::error!("{} ({:.1}%)", message, fraction * 100.0);
        } else {
            tracing::info!("{} ({:.1}%)", message, fraction * 100.0);
        }
    }
}

#[derive(Debug, Default)]
struct GlobalProgressState {
    weight_completed: f64,
    total_weight: f64,
    /// Weight earned so far by items still transferring.
    in_flight: HashMap<String, f64>,
    last_fraction: f64,
}

impl GlobalProgressState {
    fn advance(&mut self) -> f64 {
        let raw = if self.total_weight > 0.0 {
            let in_flight: f64 = self.in_flight.values().sum();
            ((self.weight_completed + in_flight) / self.total_weight).min(1.0)
        } else {
            1.0
        };

        self.last_fraction = self.last_fraction.max(raw);
        self.last_fraction
    }
}

/// Serialises weighted progress from concurrent item transfers into one
/// non-decreasing global fraction.
pub struct ProgressAggregator {
    state: Mutex<GlobalProgressState>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressAggregator {
    pub fn new(total_weight: f64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            state: Mutex::new(GlobalProgressState {
                total_weight,
                ..Default::default()
            }),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counts weight for items that were already on disk. Emits nothing.
    pub fn credit(&self, weight: f64) {
        let mut state = self.lock();
        state.weight_completed += weight;
        state.advance();
    }

    pub fn item(self: &Arc<Self>, id: impl Into<String>, weight: f64) -> ItemProgress {
        ItemProgress {
            aggregator: Arc::clone(self),
            id: id.into(),
            weight,
        }
    }

    pub fn fraction(&self) -> f64 {
        self.lock().last_fraction
    }

    pub fn weight_completed(&self) -> f64 {
        self.lock().weight_completed
    }

    pub fn total_weight(&self) -> f64 {
        self.lock().total_weight
    }

    /// Human-readable status line at the current fraction.
    pub fn status(&self, message: &str) {
        let mut state = self.lock();
        let fraction = state.advance();
        self.sink.report(message, fraction);
    }

    pub fn error(&self, message: &str) {
        let state = self.lock();
        self.sink
            .report(&format!("{}{}", ERROR_PREFIX, message), state.last_fraction);
    }

    /// Ends a fully successful run at exactly 1.0.
    pub fn finish(&self, message: &str) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.last_fraction = 1.0;
        self.sink.report(message, 1.0);
    }

    fn tick(&self, id: &str, earned: Option<f64>, message: &str) {
        let mut state = self.lock();
        if let Some(earned) = earned {
            state.in_flight.insert(id.to_string(), earned);
        }
        let fraction = state.advance();
        self.sink
            .report(&format!("{}{}", PROGRESS_PREFIX, message), fraction);
    }

    fn complete(&self, id: &str, weight: f64, message: &str) {
        let mut state = self.lock();
        state.in_flight.remove(id);
        state.weight_completed += weight;
        let fraction = state.advance();
        self.sink
            .report(&format!("{}{}", PROGRESS_PREFIX, message), fraction);
    }

    fn abandon(&self, id: &str) {
        let mut state = self.lock();
        state.in_flight.remove(id);
    }
}

/// Progress handle for one item. Cheap to clone into callbacks.
#[derive(Clone)]
pub struct ItemProgress {
    aggregator: Arc<ProgressAggregator>,
    id: String,
    weight: f64,
}

impl ItemProgress {
    pub fn update(&self, message: &str, fraction: f64) {
        let earned = self.weight * fraction.clamp(0.0, 1.0);
        self.aggregator.tick(&self.id, Some(earned), message);
    }

    /// Message-only tick; the item's earned weight is unchanged.
    pub fn message(&self, message: &str) {
        self.aggregator.tick(&self.id, None, message);
    }

    /// Replaces any intermediate weight with the item's full weight.
    pub fn complete(&self, message: &str) {
        self.aggregator.complete(&self.id, self.weight, message);
    }

    /// Drops intermediate weight of a failed item; the displayed fraction does not move back.
    pub fn abandon(&self) {
        self.aggregator.abandon(&self.id);
    }

    /// Translates a byte-level transfer event into an item tick.
    pub fn transfer(&self, what: &str, progress: &DownloadProgress) {
        match progress {
            DownloadProgress::Started => self.message(&format!("Downloading {}...", what)),
            DownloadProgress::Finished => self.update(&format!("Downloaded {}", what), 1.0),
            DownloadProgress::Progress {
                downloaded,
                bytes_per_sec,
                ..
            } => {
                let speed = format_speed(*bytes_per_sec);
                match (progress.fraction(), progress.eta()) {
                    (Some(fraction), Some(eta)) => self.update(
                        &format!(
                            "Downloading {}: {:.1}% (ETA {}, {})",
                            what,
                            fraction * 100.0,
                            format_eta(eta),
                            speed
                        ),
                        fraction,
                    ),
                    (Some(fraction), None) => self.update(
                        &format!("Downloading {}: {:.1}% ({})", what, fraction * 100.0, speed),
                        fraction,
                    ),
                    (None, _) => self.message(&format!(
                        "Downloading {}: {} ({})",
                        what,
                        format_bytes(*downloaded as f64),
                        speed
                    )),
                }
            }
        }
    }
}

/// Whole seconds, nearest-rounded, with zero components left out: `"1h 2m 3s"`, `"5m"`, `"0s"`.
pub fn format_eta(eta: Duration) -> String {
    let total = eta.as_secs_f64().round() as u64;
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);

    let parts: Vec<String> = [(hours, "h"), (minutes, "m"), (seconds, "s")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect();

    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024.0 {
        return format!("{:.0} B", bytes.max(0.0));
    }

    let mut value = bytes / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<(String, f64)>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<(String, f64)> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn fractions(&self) -> Vec<f64> {
            self.events().into_iter().map(|(_, f)| f).collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, message: &str, fraction: f64) {
            self.events
                .lock()
                .unwrap()
                .push((message.to_string(), fraction));
        }
    }
}
