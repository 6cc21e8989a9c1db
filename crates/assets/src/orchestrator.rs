use std::{collections::BTreeMap, sync::Arc};

use acq_assets_config::Config;
use tokio_util::sync::CancellationToken;

use crate::{
    download_with_retry, produce_thumbnail, run_bounded, AssetCategory, AssetItem,
    AttemptOutcome, Error, Fetcher, HttpFetcher, JobOutcome, Manifest, Planner,
    ProgressAggregator, ProgressSink, RetryPolicy, RetryResult, ThumbnailGenerator,
    TransferAttempt,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
pub enum SetupState {
    Idle,
    Planning,
    DownloadingModels,
    DownloadingConfigs,
    DownloadingVoices,
    GeneratingThumbnails,
    Verifying,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl SetupState {
    fn for_category(category: AssetCategory) -> Self {
        match category {
            AssetCategory::Model => SetupState::DownloadingModels,
            AssetCategory::Config => SetupState::DownloadingConfigs,
            AssetCategory::Voice => SetupState::DownloadingVoices,
            AssetCategory::Thumbnail => SetupState::GeneratingThumbnails,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
pub enum FileStatus {
    Success,
    Failed,
    #[serde(rename = "Already exists")]
    #[strum(serialize = "Already exists")]
    AlreadyExists,
}

/// Everything a caller needs to explain the outcome of a setup run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupReport {
    pub state: SetupState,
    /// Every state the run passed through, in order.
    pub states: Vec<SetupState>,
    pub initial_status: BTreeMap<AssetCategory, String>,
    pub final_status: BTreeMap<AssetCategory, String>,
    pub files: BTreeMap<AssetCategory, BTreeMap<String, FileStatus>>,
    /// Reason per failed item id.
    pub failures: BTreeMap<String, String>,
    pub attempts: BTreeMap<String, Vec<TransferAttempt>>,
    pub weight_completed: f64,
    pub total_weight: f64,
}

impl SetupReport {
    pub fn fraction(&self) -> f64 {
        if self.total_weight > 0.0 {
            (self.weight_completed / self.total_weight).min(1.0)
        } else {
            1.0
        }
    }

    /// Whether the application can run, possibly degraded.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            SetupState::Succeeded | SetupState::PartiallySucceeded
        )
    }

    fn record(&mut self, item: &AssetItem, status: FileStatus) {
        self.files
            .entry(item.category)
            .or_default()
            .insert(item.file_name.clone(), status);
    }

    fn enter(&mut self, state: SetupState) {
        tracing::info!("setup_state: {}", state);
        self.state = state;
        self.states.push(state);
    }
}

struct RunContext {
    fetcher: Arc<dyn Fetcher>,
    thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
    policy: RetryPolicy,
    aggregator: Arc<ProgressAggregator>,
    cancellation_token: CancellationToken,
}

impl RunContext {
    async fn acquire(&self, item: &AssetItem, weight: f64) -> RetryResult {
        let progress = self.aggregator.item(item.id(), weight);

        let result = match item.category {
            AssetCategory::Thumbnail => {
                produce_thumbnail(
                    self.thumbnails.as_deref(),
                    self.fetcher.as_ref(),
                    &self.policy,
                    item,
                    &progress,
                    &self.cancellation_token,
                )
                .await
            }
            _ => {
                download_with_retry(
                    self.fetcher.as_ref(),
                    item,
                    &self.policy,
                    &progress,
                    &self.cancellation_token,
                )
                .await
            }
        };

        match &result.outcome {
            AttemptOutcome::Success => {
                let verb = match item.category {
                    AssetCategory::Thumbnail => "Created",
                    _ => "Downloaded",
                };
                progress.complete(&format!("{} {} {}", verb, item.category.label(), item.file_name));
            }
            _ => progress.abandon(),
        }

        result
    }
}

/// Drives one setup run: plan, acquire each category in turn, verify.
pub struct AssetSetup {
    manifest: Manifest,
    fetcher: Arc<dyn Fetcher>,
    thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
    policy: RetryPolicy,
}

impl AssetSetup {
    pub fn new(manifest: Manifest, fetcher: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self {
            manifest,
            fetcher,
            thumbnails: None,
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let manifest = Manifest::from_config(config)?;
        let fetcher = HttpFetcher::from_config(&config.download)?;
        let policy = RetryPolicy {
            max_retries: config.download.max_retries,
            base_delay: std::time::Duration::from_millis(config.download.retry_base_delay_ms),
        };

        Ok(Self::new(manifest, Arc::new(fetcher), policy))
    }

    pub fn with_thumbnail_generator(mut self, generator: Arc<dyn ThumbnailGenerator>) -> Self {
        self.thumbnails = Some(generator);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Planner verdict and per-category status, without touching anything.
    pub fn is_setup_required(&self) -> (bool, BTreeMap<AssetCategory, String>) {
        let plan = Planner::plan(&self.manifest);
        for (category, status) in &plan.status {
            tracing::debug!("asset_status: {} {}", category, status);
        }
        (plan.setup_required, plan.status)
    }

    #[tracing::instrument(skip_all, fields(root = %self.manifest.root.display()))]
    pub async fn setup_assets(
        &self,
        sink: Arc<dyn ProgressSink>,
        cancellation_token: &CancellationToken,
    ) -> Result<SetupReport, Error> {
        let total_weight = self.manifest.total_weight();
        let aggregator = Arc::new(ProgressAggregator::new(total_weight, sink));

        let mut report = SetupReport {
            state: SetupState::Idle,
            states: vec![SetupState::Idle],
            initial_status: BTreeMap::new(),
            final_status: BTreeMap::new(),
            files: BTreeMap::new(),
            failures: BTreeMap::new(),
            attempts: BTreeMap::new(),
            weight_completed: 0.0,
            total_weight,
        };

        report.enter(SetupState::Planning);
        let plan = Planner::plan(&self.manifest);
        report.initial_status = plan.status.clone();

        for item in &plan.present {
            report.record(item, FileStatus::AlreadyExists);
            aggregator.credit(self.manifest.weight(item.category));
        }

        if !plan.setup_required {
            aggregator.finish("All assets are present");
            report.final_status = plan.status;
            report.weight_completed = aggregator.weight_completed();
            report.enter(SetupState::Succeeded);
            return Ok(report);
        }

        for category in self.manifest.categories() {
            if let Err(e) = tokio::fs::create_dir_all(&category.dir).await {
                aggregator.error(&format!("Could not create {}: {}", category.dir.display(), e));
                return Err(e.into());
            }
        }

        let context = Arc::new(RunContext {
            fetcher: Arc::clone(&self.fetcher),
            thumbnails: self.thumbnails.clone(),
            policy: self.policy,
            aggregator: Arc::clone(&aggregator),
            cancellation_token: cancellation_token.clone(),
        });

        let mut any_success = false;

        for category in AssetCategory::ALL {
            let items: Vec<AssetItem> = plan
                .missing
                .iter()
                .filter(|item| item.category == category)
                .cloned()
                .collect();
            if items.is_empty() {
                continue;
            }

            report.enter(SetupState::for_category(category));
            aggregator.status(&format!("Downloading {}...", category));

            let weight = self.manifest.weight(category);
            let limit = self.manifest.concurrency(category);
            let results = run_bounded(items.clone(), limit, cancellation_token, |item| {
                let context = Arc::clone(&context);
                async move { context.acquire(&item, weight).await }
            })
            .await;

            if cancellation_token.is_cancelled() {
                aggregator.status("Setup cancelled");
                tracing::info!("setup_cancelled");
                return Err(Error::Cancelled);
            }

            let mut failed = 0;
            for (item, outcome) in results {
                let (outcome, attempts) = match outcome {
                    JobOutcome::Finished(result) => (result.outcome, result.attempts),
                    JobOutcome::Panicked(message) => {
                        (AttemptOutcome::Fatal(format!("panicked: {}", message)), vec![])
                    }
                    JobOutcome::NotStarted => (AttemptOutcome::Cancelled, vec![]),
                };
                report.attempts.insert(item.id(), attempts);

                match outcome {
                    AttemptOutcome::Success => {
                        any_success = true;
                        report.record(&item, FileStatus::Success);
                    }
                    AttemptOutcome::Fatal(reason) | AttemptOutcome::Retryable(reason) => {
                        failed += 1;
                        report.record(&item, FileStatus::Failed);
                        report.failures.insert(item.id(), reason);
                    }
                    AttemptOutcome::Cancelled => {
                        failed += 1;
                        report.record(&item, FileStatus::Failed);
                        report.failures.insert(item.id(), "cancelled".into());
                    }
                }
            }

            // Items lost to an aborted task never reported back.
            for item in &items {
                let known = report
                    .files
                    .get(&item.category)
                    .is_some_and(|files| files.contains_key(&item.file_name));
                if !known {
                    failed += 1;
                    report.record(item, FileStatus::Failed);
                    report
                        .failures
                        .insert(item.id(), "transfer task aborted".into());
                }
            }

            if failed == items.len() {
                aggregator.error(&format!("Failed to download {}", category));

                for item in plan.missing.iter().filter(|i| i.category > category) {
                    report.record(item, FileStatus::Failed);
                    report.failures.insert(item.id(), "not attempted".into());
                }

                report.final_status = Planner::plan(&self.manifest).status;
                report.weight_completed = aggregator.weight_completed();
                report.enter(SetupState::Failed);
                return Ok(report);
            }

            if failed > 0 {
                tracing::warn!(
                    "category_partially_failed: {} {}/{}",
                    category,
                    failed,
                    items.len()
                );
            }
        }

        report.enter(SetupState::Verifying);
        let verified = Planner::plan(&self.manifest);
        report.final_status = verified.status;
        report.weight_completed = aggregator.weight_completed();

        if verified.missing.is_empty() {
            aggregator.finish("Asset setup complete");
            report.enter(SetupState::Succeeded);
        } else if any_success {
            let names: Vec<&str> = verified
                .missing
                .iter()
                .map(|i| i.file_name.as_str())
                .collect();
            aggregator.status(&format!(
                "Asset setup partially complete, missing: {}",
                names.join(", ")
            ));
            report.enter(SetupState::PartiallySucceeded);
        } else {
            aggregator.error("Asset setup failed");
            report.enter(SetupState::Failed);
        }

        Ok(report)
    }
}
