use crate::{
    config::Config,
    error::AppError,
    format::{quality_ladder, select, FormatSpec, MediaKind, QualityTier},
    progress::{human_size, ProgressReporter},
    session::{DownloadRecord, SessionRegistry, TaskHandle, TaskState},
    ytdlp::{purge_media_files, DownloadEvent, DownloadRequest, Downloader, MediaProvider, ProbeInfo},
};
use chrono::Utc;
use std::{
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
};
use teloxide::types::UserId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, instrument, warn};

/// Channel for user-facing status lines (already throttled); the bot layer
/// relays them into message edits.
pub type StatusSink = mpsc::UnboundedSender<String>;

/// Drives one request through probe → format selection → download → size
/// check, degrading the quality tier until the artifact fits the budget or
/// the ladder runs out. Owns every active-map mutation.
pub struct Orchestrator {
    config: Arc<Config>,
    media: Arc<dyn MediaProvider>,
    downloader: Arc<dyn Downloader>,
    sessions: SessionRegistry,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        media: Arc<dyn MediaProvider>,
        downloader: Arc<dyn Downloader>,
        sessions: SessionRegistry,
    ) -> Self {
        Self {
            config,
            media,
            downloader,
            sessions,
        }
    }

    /// Runs the task to a terminal state. The returned error is the reason
    /// code for the terminal state; `Cancelled` is the normal cancellation
    /// path, not a failure.
    #[instrument(skip(self, handle, status), fields(user = %user))]
    pub async fn run(
        &self,
        user: UserId,
        handle: Arc<TaskHandle>,
        status: StatusSink,
    ) -> Result<DownloadRecord, AppError> {
        let _guard = self.sessions.guard(user, handle.clone());
        match self.drive(&handle, &status).await {
            Ok(record) => {
                info!(event = "task_done", bytes = record.bytes, files = record.files.len());
                self.sessions.complete(&handle, record.clone()).await;
                Ok(record)
            }
            Err(err) => {
                let state = match &err {
                    AppError::Cancelled => TaskState::Cancelled,
                    other => TaskState::Failed {
                        reason: other.to_string(),
                    },
                };
                info!(event = "task_terminal", state = %state);
                self.sessions.finish(&handle, state).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        handle: &Arc<TaskHandle>,
        status: &StatusSink,
    ) -> Result<DownloadRecord, AppError> {
        let (url, kind) = {
            let task = handle.inner.lock().await;
            (task.url.clone(), task.kind)
        };

        handle.set_state(TaskState::Probing).await;
        let info = self.media.probe(&url).await?;
        handle.set_title(info.title.clone()).await;
        if handle.cancel.load(Ordering::SeqCst) {
            return Err(AppError::Cancelled);
        }

        let min_free = self.config.max_artifact_bytes.saturating_mul(2);
        if !has_enough_space(&self.config.download_dir, min_free) {
            return Err(AppError::Internal(
                "not enough free disk space for a safe download".into(),
            ));
        }

        let mut files = Vec::new();
        let mut bytes = 0u64;
        for stage in kind.stages() {
            match self.run_stage(handle, &url, &info, *stage, status).await {
                Ok((stage_files, stage_bytes)) => {
                    files.extend(stage_files);
                    bytes += stage_bytes;
                }
                Err(err) => {
                    purge_media_files(&self.config.download_dir, &info.id).await;
                    return Err(err);
                }
            }
        }

        Ok(DownloadRecord {
            url,
            title: info.title.clone().unwrap_or_else(|| info.id.clone()),
            kind,
            files,
            bytes,
            completed_at: Utc::now(),
        })
    }

    /// One media kind through the fallback ladder. Size-triggered retries
    /// always advance the tier; transient-error retries never do.
    async fn run_stage(
        &self,
        handle: &Arc<TaskHandle>,
        url: &str,
        info: &ProbeInfo,
        stage: MediaKind,
        status: &StatusSink,
    ) -> Result<(Vec<PathBuf>, u64), AppError> {
        let ladder = quality_ladder(stage, &self.config);
        let budget = self.config.max_artifact_bytes;
        let mut smallest: Option<u64> = None;

        for (index, tier) in ladder.iter().enumerate() {
            let spec = select(info, stage, *tier)?;
            handle.set_state(TaskState::Downloading { tier: index }).await;
            let label = tier_label(stage, *tier, index);
            let picked = self
                .attempt_download(handle, url, info, stage, &spec, &label, status)
                .await?;

            handle.set_state(TaskState::SizeCheck { tier: index }).await;
            let size = total_size(&picked).await?;
            if size <= budget {
                info!(event = "size_check_ok", size, budget, tier = %tier);
                return Ok((picked, size));
            }

            smallest = Some(smallest.map_or(size, |s| s.min(size)));
            warn!(event = "size_check_over", size, budget, tier = %tier);
            for path in &picked {
                let _ = tokio::fs::remove_file(path).await;
            }
            if let Some(next) = ladder.get(index + 1) {
                let _ = status.send(format!(
                    "⚠️ {label} came out at {}; trying {next}…",
                    human_size(size)
                ));
            }
        }

        Err(AppError::SizeExceeded {
            size: smallest.unwrap_or(0),
            budget,
        })
    }

    async fn attempt_download(
        &self,
        handle: &Arc<TaskHandle>,
        url: &str,
        info: &ProbeInfo,
        stage: MediaKind,
        spec: &FormatSpec,
        label: &str,
        status: &StatusSink,
    ) -> Result<Vec<PathBuf>, AppError> {
        let mut attempt = 0u32;
        loop {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let relay = spawn_status_relay(events_rx, label.to_string(), status.clone());
            let result = self
                .downloader
                .download(DownloadRequest {
                    url: url.to_string(),
                    media_id: info.id.clone(),
                    kind: stage,
                    spec: spec.clone(),
                    out_dir: self.config.download_dir.clone(),
                    socket_timeout: self.config.socket_timeout,
                    retries: self.config.retries,
                    events: events_tx,
                    cancel: handle.cancel.clone(),
                })
                .await;
            let _ = relay.await;

            match result {
                Ok(files) => return Ok(files),
                Err(err) if err.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(event = "transient_retry", attempt, error = %err);
                    let _ = status.send(format!(
                        "🌐 Network hiccup while fetching {label}; retrying ({attempt}/{})…",
                        self.config.retries
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn tier_label(stage: MediaKind, tier: QualityTier, index: usize) -> String {
    if index == 0 {
        stage.to_string()
    } else {
        format!("{stage} ({tier})")
    }
}

async fn total_size(files: &[PathBuf]) -> Result<u64, AppError> {
    let mut total = 0u64;
    for path in files {
        total += tokio::fs::metadata(path).await.map_err(AppError::Io)?.len();
    }
    Ok(total)
}

fn spawn_status_relay(
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    label: String,
    status: StatusSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reporter = ProgressReporter::new(label.clone());
        while let Some(event) = events.recv().await {
            match event {
                DownloadEvent::Progress(progress) => {
                    if let Some(text) = reporter.report(progress) {
                        let _ = status.send(text);
                    }
                }
                DownloadEvent::Postprocessing => {
                    let _ = status.send(format!("📦 Processing {label}…"));
                }
            }
        }
    })
}

/// Free-space pre-check on the disk backing the artifact directory. Unknown
/// mounts pass, matching the optimistic stance of the rest of the pipeline.
fn has_enough_space(dir: &Path, min_free_bytes: u64) -> bool {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if dir.starts_with(mount) {
            let depth = mount.as_os_str().len();
            if best.map_or(true, |(existing, _)| depth >= existing) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map_or(true, |(_, free)| free >= min_free_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RequestedKind;
    use crate::progress::ProgressEvent;
    use crate::session::HistoryStore;
    use crate::ytdlp::StreamFormat;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct StubMedia {
        info: Option<ProbeInfo>,
    }

    #[async_trait]
    impl MediaProvider for StubMedia {
        async fn probe(&self, _url: &str) -> Result<ProbeInfo, AppError> {
            self.info
                .clone()
                .ok_or_else(|| AppError::Extraction("Unsupported URL".into()))
        }
    }

    #[derive(Default)]
    struct StubDownloader {
        sizes: Mutex<VecDeque<u64>>,
        transient_failures: Mutex<u32>,
        wait_for_cancel: bool,
        selectors: Mutex<Vec<String>>,
        bitrates: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Downloader for StubDownloader {
        async fn download(&self, req: DownloadRequest) -> Result<Vec<PathBuf>, AppError> {
            self.selectors.lock().await.push(req.spec.selector.clone());
            if let Some(pp) = &req.spec.postprocess {
                self.bitrates.lock().await.push(pp.bitrate_kbps);
            }
            if self.wait_for_cancel {
                for _ in 0..500 {
                    if req.cancel.load(Ordering::SeqCst) {
                        return Err(AppError::Cancelled);
                    }
                    let _ = req
                        .events
                        .send(DownloadEvent::Progress(ProgressEvent::default()));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                return Err(AppError::Internal("cancel never arrived".into()));
            }
            {
                let mut failures = self.transient_failures.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AppError::NetworkTransient("timed out".into()));
                }
            }
            let size = self
                .sizes
                .lock()
                .await
                .pop_front()
                .expect("unscripted download call");
            let ext = match req.kind {
                MediaKind::Audio => "mp3",
                MediaKind::Video => "mp4",
            };
            let path = req.out_dir.join(format!("Clip-{}.{ext}", req.media_id));
            tokio::fs::write(&path, vec![0u8; size as usize]).await.unwrap();
            Ok(vec![path])
        }
    }

    fn muxed_info() -> ProbeInfo {
        ProbeInfo {
            id: "abc123".into(),
            title: Some("Big Clip".into()),
            duration: Some(120.0),
            formats: vec![StreamFormat {
                format_id: "137".into(),
                ext: Some("mp4".into()),
                height: Some(2160),
                abr: Some(128.0),
                tbr: Some(5000.0),
                vcodec: Some("avc1".into()),
                acodec: Some("mp4a".into()),
                filesize: None,
                filesize_approx: None,
            }],
        }
    }

    fn audio_only_info() -> ProbeInfo {
        let mut info = muxed_info();
        info.formats[0].vcodec = Some("none".into());
        info
    }

    fn test_config(dir: &Path, budget: u64) -> Arc<Config> {
        Arc::new(Config {
            download_dir: dir.to_path_buf(),
            history_db: dir.join("history.json"),
            max_artifact_bytes: budget,
            max_height: 1080,
            audio_bitrate_ladder: vec![192, 128, 64],
            socket_timeout: Duration::from_secs(5),
            retries: 2,
            cleanup_after_send: false,
            history_limit: 5,
        })
    }

    struct Fixture {
        orchestrator: Orchestrator,
        sessions: SessionRegistry,
        downloader: Arc<StubDownloader>,
        status_rx: mpsc::UnboundedReceiver<String>,
        status_tx: StatusSink,
    }

    async fn fixture(
        dir: &Path,
        budget: u64,
        info: Option<ProbeInfo>,
        downloader: StubDownloader,
    ) -> Fixture {
        let config = test_config(dir, budget);
        let sessions =
            SessionRegistry::new(HistoryStore::load(config.history_db.clone(), 5).await);
        let downloader = Arc::new(downloader);
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(StubMedia { info }),
            downloader.clone(),
            sessions.clone(),
        );
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Fixture {
            orchestrator,
            sessions,
            downloader,
            status_rx,
            status_tx,
        }
    }

    fn start(fx: &Fixture, kind: RequestedKind) -> (UserId, Arc<TaskHandle>) {
        let user = UserId(1);
        let handle = fx
            .sessions
            .start(user, "https://example.com/v".into(), kind, None)
            .unwrap();
        (user, handle)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn video_degrades_until_the_artifact_fits() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = StubDownloader {
            sizes: Mutex::new(VecDeque::from([200, 80, 40])),
            ..Default::default()
        };
        let mut fx = fixture(dir.path(), 50, Some(muxed_info()), downloader).await;
        let (user, handle) = start(&fx, RequestedKind::Video);

        let record = fx
            .orchestrator
            .run(user, handle.clone(), fx.status_tx.clone())
            .await
            .unwrap();

        assert_eq!(record.bytes, 40);
        assert_eq!(record.files.len(), 1);
        assert_eq!(tokio::fs::metadata(&record.files[0]).await.unwrap().len(), 40);

        let selectors = fx.downloader.selectors.lock().await.clone();
        assert_eq!(selectors.len(), 3);
        assert!(selectors[0].contains("height<=1080"));
        assert!(selectors[1].contains("height<=720"));
        assert!(selectors[2].contains("height<=480"));

        let task = handle.inner.lock().await.clone();
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.tier, 2);
        assert!(fx.sessions.status(user).await.is_none());
        assert_eq!(fx.sessions.history(user).await.len(), 1);
        let statuses = drain(&mut fx.status_rx);
        assert!(statuses.iter().any(|s| s.contains("trying")));
    }

    #[tokio::test]
    async fn audio_exhausting_the_ladder_fails_with_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = StubDownloader {
            sizes: Mutex::new(VecDeque::from([200, 80, 60])),
            ..Default::default()
        };
        let fx = fixture(dir.path(), 50, Some(muxed_info()), downloader).await;
        let (user, handle) = start(&fx, RequestedKind::Audio);

        let err = fx
            .orchestrator
            .run(user, handle.clone(), fx.status_tx.clone())
            .await
            .unwrap_err();

        match err {
            AppError::SizeExceeded { size, budget } => {
                assert_eq!(size, 60);
                assert_eq!(budget, 50);
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(*fx.downloader.bitrates.lock().await, vec![192, 128, 64]);
        assert!(matches!(
            handle.inner.lock().await.state,
            TaskState::Failed { .. }
        ));
        assert!(fx.sessions.history(user).await.is_empty());
        assert!(
            crate::ytdlp::find_output_files(dir.path(), "abc123")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn probe_failure_never_reaches_the_downloader() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path(), 50, None, StubDownloader::default()).await;
        let (user, handle) = start(&fx, RequestedKind::Video);

        let err = fx
            .orchestrator
            .run(user, handle.clone(), fx.status_tx.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Extraction(_)));
        assert!(fx.downloader.selectors.lock().await.is_empty());
        assert!(matches!(
            handle.inner.lock().await.state,
            TaskState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn video_request_on_audio_only_source_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path(), 50, Some(audio_only_info()), StubDownloader::default()).await;
        let (user, handle) = start(&fx, RequestedKind::Video);

        let err = fx
            .orchestrator
            .run(user, handle, fx.status_tx.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NoFormatAvailable("video")));
        assert!(fx.downloader.selectors.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_download_terminates_without_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = StubDownloader {
            wait_for_cancel: true,
            ..Default::default()
        };
        let fx = fixture(dir.path(), 50, Some(muxed_info()), downloader).await;
        let (user, handle) = start(&fx, RequestedKind::Video);

        let orchestrator_handle = handle.clone();
        let sessions = fx.sessions.clone();
        let status_tx = fx.status_tx.clone();
        let run = tokio::spawn(async move {
            fx.orchestrator
                .run(user, orchestrator_handle, status_tx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sessions.cancel(user));

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(handle.inner.lock().await.state, TaskState::Cancelled);
        assert!(
            crate::ytdlp::find_output_files(dir.path(), "abc123")
                .await
                .unwrap()
                .is_empty()
        );
        // Terminal state frees the slot for a fresh request.
        assert!(sessions
            .start(user, "https://again".into(), RequestedKind::Video, None)
            .is_ok());
    }

    #[tokio::test]
    async fn transient_failures_retry_at_the_same_tier() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = StubDownloader {
            sizes: Mutex::new(VecDeque::from([40])),
            transient_failures: Mutex::new(1),
            ..Default::default()
        };
        let fx = fixture(dir.path(), 50, Some(muxed_info()), downloader).await;
        let (user, handle) = start(&fx, RequestedKind::Video);

        let record = fx
            .orchestrator
            .run(user, handle, fx.status_tx.clone())
            .await
            .unwrap();

        assert_eq!(record.bytes, 40);
        let selectors = fx.downloader.selectors.lock().await.clone();
        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0], selectors[1]);
    }

    #[tokio::test]
    async fn both_runs_video_then_audio_stages() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = StubDownloader {
            sizes: Mutex::new(VecDeque::from([40, 30])),
            ..Default::default()
        };
        let fx = fixture(dir.path(), 50, Some(muxed_info()), downloader).await;
        let (user, handle) = start(&fx, RequestedKind::Both);

        let record = fx
            .orchestrator
            .run(user, handle, fx.status_tx.clone())
            .await
            .unwrap();

        assert_eq!(record.bytes, 70);
        assert_eq!(record.files.len(), 2);
        let selectors = fx.downloader.selectors.lock().await.clone();
        assert!(selectors[0].contains("bestvideo"));
        assert_eq!(selectors[1], "bestaudio/best");
    }
}
