use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Mutex,
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use tokio::process::Command;
use tokio_util::{
    codec::{AnyDelimiterCodec, FramedRead},
    sync::CancellationToken,
};

use crate::ItemProgress;

/// One parsed progress line of an external tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgress {
    pub percent: f64,
    pub speed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorOutcome {
    Completed,
    /// Not installed, or exited unsuccessfully. The internal downloader takes over.
    Unavailable,
    Cancelled,
}

#[async_trait::async_trait]
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Downloads `url` into `dest`, resuming whatever is already there.
    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &(dyn Fn(ToolProgress) + Send + Sync),
        cancellation_token: &CancellationToken,
    ) -> AcceleratorOutcome;

    /// Called after an unsuccessful run; removes output the internal downloader cannot resume.
    async fn discard_partial(&self, _dest: &Path) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ToolKind {
    #[strum(serialize = "aria2c")]
    Aria2c,
    #[strum(serialize = "curl")]
    Curl,
    #[strum(serialize = "wget")]
    Wget,
}

impl ToolKind {
    /// Preference order.
    pub const ALL: [ToolKind; 3] = [ToolKind::Aria2c, ToolKind::Curl, ToolKind::Wget];

    fn args(&self, url: &str, dest: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self {
            ToolKind::Aria2c => {
                let dir = dest.parent().unwrap_or_else(|| Path::new("."));
                let out = dest.file_name().unwrap_or_default();
                args.push(url.into());
                args.push("--dir".into());
                args.push(dir.into());
                args.push("--out".into());
                args.push(out.into());
                args.extend(
                    [
                        "--file-allocation=none",
                        "--continue=true",
                        "--max-connection-per-server=16",
                        "--split=16",
                        "--max-tries=5",
                        "--retry-wait=5",
                        "--connect-timeout=60",
                        "--timeout=60",
                        "--auto-file-renaming=false",
                        "--allow-overwrite=true",
                        "--console-log-level=notice",
                        "--summary-interval=1",
                        "--download-result=full",
                        "--show-console-readout=true",
                        "--human-readable=true",
                    ]
                    .map(OsString::from),
                );
            }
            ToolKind::Curl => {
                args.push(url.into());
                args.push("--output".into());
                args.push(dest.into());
                args.extend(
                    [
                        "--continue-at",
                        "-",
                        "--location",
                        "--fail",
                        "--connect-timeout",
                        "60",
                        "--retry",
                        "5",
                        "--retry-delay",
                        "5",
                        "--progress-bar",
                    ]
                    .map(OsString::from),
                );
            }
            ToolKind::Wget => {
                args.push(url.into());
                args.push("-O".into());
                args.push(dest.into());
                args.extend(
                    ["-c", "--tries=5", "--timeout=60", "--progress=bar:force:noscroll"]
                        .map(OsString::from),
                );
            }
        }
        args
    }

    pub fn parse_line(&self, line: &str) -> Option<ToolProgress> {
        match self {
            ToolKind::Aria2c => parse_aria2_line(line),
            ToolKind::Curl => parse_curl_line(line),
            ToolKind::Wget => parse_wget_line(line),
        }
    }
}

/// `[#2089b0 400KiB/33MiB(1%) CN:16 DL:1.2MiB ETA:27s]`
fn parse_aria2_line(line: &str) -> Option<ToolProgress> {
    if !line.contains("[#") {
        return None;
    }

    let percent = line
        .split_once('(')?
        .1
        .split_once('%')?
        .0
        .trim()
        .parse::<f64>()
        .ok()?;

    let speed = line.split_once("DL:").and_then(|(_, rest)| {
        rest.split_whitespace()
            .next()
            .map(|s| s.trim_end_matches(']').to_string())
    });

    Some(ToolProgress { percent, speed })
}

/// `######                     9.3%`
fn parse_curl_line(line: &str) -> Option<ToolProgress> {
    let percent = line
        .split_whitespace()
        .rev()
        .find(|token| token.ends_with('%'))?
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()?;

    Some(ToolProgress {
        percent,
        speed: None,
    })
}

/// `voice.wav  45%[=====>     ]  1.2M  1.20MB/s  eta 2s`
fn parse_wget_line(line: &str) -> Option<ToolProgress> {
    let (before, _) = line.split_once('%')?;
    let percent = before.split_whitespace().last()?.parse::<f64>().ok()?;

    let speed = line
        .split_whitespace()
        .find(|token| token.ends_with("/s"))
        .map(str::to_string);

    Some(ToolProgress { percent, speed })
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    let file_name = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };

    std::env::split_paths(&paths)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Runs `program` and feeds every output line (stdout and stderr, split on
/// `\r` or `\n`) to `on_line`. Returns `None` if cancelled; the child is killed.
pub(crate) async fn run_tool(
    program: &Path,
    args: &[OsString],
    mut on_line: impl FnMut(&str),
    cancellation_token: &CancellationToken,
) -> std::io::Result<Option<ExitStatus>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(std::io::Error::other("child output was not captured"));
    };

    let codec = || AnyDelimiterCodec::new(b"\r\n".to_vec(), b"\n".to_vec());
    let mut lines = futures_util::stream::select(
        FramedRead::new(stdout, codec()),
        FramedRead::new(stderr, codec()),
    );

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                child.kill().await.ok();
                return Ok(None);
            }
            line = lines.next() => match line {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let text = text.trim();
                    if !text.is_empty() {
                        on_line(text);
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("accelerator_output_error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    tokio::select! {
        _ = cancellation_token.cancelled() => {
            child.kill().await.ok();
            Ok(None)
        }
        status = child.wait() => Ok(Some(status?)),
    }
}

/// An installed command-line download tool.
#[derive(Debug, Clone)]
pub struct CommandAccelerator {
    kind: ToolKind,
    program: PathBuf,
}

impl CommandAccelerator {
    pub fn new(kind: ToolKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }

    /// Looks the tool up on `PATH`.
    pub fn locate(kind: ToolKind) -> Option<Self> {
        find_in_path(&kind.to_string()).map(|program| Self::new(kind, program))
    }

    pub fn kind(&self) -> ToolKind {
        self.kind
    }
}

#[async_trait::async_trait]
impl Accelerator for CommandAccelerator {
    fn name(&self) -> &str {
        match self.kind {
            ToolKind::Aria2c => "aria2c",
            ToolKind::Curl => "curl",
            ToolKind::Wget => "wget",
        }
    }

    fn is_available(&self) -> bool {
        self.program.is_file()
    }

    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &(dyn Fn(ToolProgress) + Send + Sync),
        cancellation_token: &CancellationToken,
    ) -> AcceleratorOutcome {
        let args = self.kind.args(url, dest);
        let kind = self.kind;

        let result = run_tool(
            &self.program,
            &args,
            |line| {
                if let Some(progress) = kind.parse_line(line) {
                    on_progress(progress);
                }
            },
            cancellation_token,
        )
        .await;

        match result {
            Ok(Some(status)) if status.success() => AcceleratorOutcome::Completed,
            Ok(Some(status)) => {
                tracing::warn!(
                    "{} download failed with {}, falling back to internal method",
                    self.name(),
                    status
                );
                AcceleratorOutcome::Unavailable
            }
            Ok(None) => AcceleratorOutcome::Cancelled,
            Err(e) => {
                tracing::warn!("accelerator_spawn_failed: {} {}", self.name(), e);
                AcceleratorOutcome::Unavailable
            }
        }
    }

    async fn discard_partial(&self, dest: &Path) {
        // Segmented output is not a contiguous prefix of the file.
        if self.kind == ToolKind::Aria2c {
            let mut control = dest.as_os_str().to_owned();
            control.push(".aria2");
            tokio::fs::remove_file(dest).await.ok();
            tokio::fs::remove_file(PathBuf::from(control)).await.ok();
        }
    }
}

/// Accelerators in preference order. Only the first available one is used.
pub struct AcceleratorChain {
    tools: Vec<Box<dyn Accelerator>>,
    progress_interval: Duration,
}

impl Default for AcceleratorChain {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl AcceleratorChain {
    pub fn new(tools: Vec<Box<dyn Accelerator>>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }

    /// Every known tool found on `PATH`.
    pub fn discover() -> Self {
        let tools: Vec<Box<dyn Accelerator>> = ToolKind::ALL
            .into_iter()
            .filter_map(CommandAccelerator::locate)
            .map(|tool| Box::new(tool) as Box<dyn Accelerator>)
            .collect();

        tracing::debug!(
            "accelerators_found: {:?}",
            tools.iter().map(|t| t.name()).collect::<Vec<_>>()
        );

        Self::new(tools)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Minimum spacing of forwarded tool progress lines. The final 100% line
    /// is always forwarded.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn has_available_tool(&self) -> bool {
        self.tools.iter().any(|tool| tool.is_available())
    }

    /// Runs the first available tool into `<dest>.tmp` and renames it onto
    /// `dest` when the tool exits successfully.
    ///
    /// With `expected_len` known, output of any other length is discarded and
    /// reported as `Unavailable` so the internal downloader takes over.
    pub async fn try_external(
        &self,
        url: &str,
        dest: &Path,
        what: &str,
        expected_len: Option<u64>,
        progress: &ItemProgress,
        cancellation_token: &CancellationToken,
    ) -> AcceleratorOutcome {
        let Some(tool) = self.tools.iter().find(|tool| tool.is_available()) else {
            return AcceleratorOutcome::Unavailable;
        };

        let tmp = acq_file::tmp_path(dest);
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("accelerator_dir_failed: {}", e);
                return AcceleratorOutcome::Unavailable;
            }
        }

        tracing::info!("Using {} to download {}", tool.name(), url);
        progress.message(&format!("Downloading {} with {}...", what, tool.name()));

        let last_emit: Mutex<Option<Instant>> = Mutex::new(None);
        let on_progress = |p: ToolProgress| {
            let Ok(mut last) = last_emit.lock() else {
                return;
            };
            let now = Instant::now();
            let due = p.percent >= 100.0
                || last.map_or(true, |at| now.duration_since(at) >= self.progress_interval);
            if !due {
                return;
            }
            *last = Some(now);

            let message = match &p.speed {
                Some(speed) => format!(
                    "Downloading {}: {:.1}% (Speed: {}/s)",
                    what, p.percent, speed
                ),
                None => format!("Downloading {}: {:.1}%", what, p.percent),
            };
            progress.update(&message, p.percent / 100.0);
        };

        match tool
            .try_download(url, &tmp, &on_progress, cancellation_token)
            .await
        {
            AcceleratorOutcome::Completed => {
                if let Some(expected) = expected_len {
                    let actual = acq_file::file_size(&tmp).unwrap_or(0);
                    if actual != expected {
                        tracing::warn!(
                            "accelerator_size_mismatch: {} {:?} expected={} actual={}",
                            tool.name(),
                            tmp,
                            expected,
                            actual
                        );
                        tool.discard_partial(&tmp).await;
                        return AcceleratorOutcome::Unavailable;
                    }
                }

                match tokio::fs::rename(&tmp, dest).await {
                    Ok(()) => {
                        tracing::info!("Downloaded {} to {:?} using {}", url, dest, tool.name());
                        AcceleratorOutcome::Completed
                    }
                    Err(e) => {
                        tracing::warn!("accelerator_rename_failed: {}", e);
                        AcceleratorOutcome::Unavailable
                    }
                }
            }
            AcceleratorOutcome::Unavailable => {
                tool.discard_partial(&tmp).await;
                AcceleratorOutcome::Unavailable
            }
            AcceleratorOutcome::Cancelled => AcceleratorOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes fixed bytes, or fails, without spawning anything.
    pub(crate) struct FakeAccelerator {
        pub(crate) body: Option<Vec<u8>>,
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Accelerator for FakeAccelerator {
        fn name(&self) -> &str {
            "fake"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn try_download(
            &self,
            _url: &str,
            dest: &Path,
            on_progress: &(dyn Fn(ToolProgress) + Send + Sync),
            _cancellation_token: &CancellationToken,
        ) -> AcceleratorOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(body) => {
                    for percent in [25.0, 50.0, 75.0] {
                        on_progress(ToolProgress {
                            percent,
                            speed: Some("1.0MiB".into()),
                        });
                    }
                    tokio::fs::write(dest, body).await.unwrap();
                    AcceleratorOutcome::Completed
                }
                None => AcceleratorOutcome::Unavailable,
            }
        }
    }
}
