use crate::{
    config::Config,
    error::AppError,
    format::{FormatSpec, MediaKind},
    progress::ProgressEvent,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    env,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

/// Probed source metadata, deserialized from `yt-dlp -J`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProbeInfo {
    pub id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<StreamFormat>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

impl StreamFormat {
    pub fn has_video(&self) -> bool {
        !matches!(self.vcodec.as_deref(), None | Some("none"))
    }

    pub fn has_audio(&self) -> bool {
        !matches!(self.acodec.as_deref(), None | Some("none"))
    }
}

/// Events streamed out of a running download.
#[derive(Clone, Debug)]
pub enum DownloadEvent {
    Progress(ProgressEvent),
    Postprocessing,
}

/// Everything one download invocation needs, passed explicitly per request.
pub struct DownloadRequest {
    pub url: String,
    pub media_id: String,
    pub kind: MediaKind,
    pub spec: FormatSpec,
    pub out_dir: PathBuf,
    pub socket_timeout: Duration,
    pub retries: u32,
    pub events: mpsc::UnboundedSender<DownloadEvent>,
    pub cancel: Arc<AtomicBool>,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeInfo, AppError>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, req: DownloadRequest) -> Result<Vec<PathBuf>, AppError>;
}

pub struct YtDlpClient {
    socket_timeout: Duration,
    cache_dir: PathBuf,
}

impl YtDlpClient {
    pub fn new(config: &Config) -> Self {
        Self {
            socket_timeout: config.socket_timeout,
            cache_dir: config.download_dir.join(".cache").join("yt-dlp"),
        }
    }
}

#[async_trait]
impl MediaProvider for YtDlpClient {
    #[instrument(skip(self))]
    async fn probe(&self, url: &str) -> Result<ProbeInfo, AppError> {
        info!(event = "probe_start", url = %url);
        let mut cmd = base_command();
        cmd.arg("-J")
            .arg("--no-playlist")
            .arg("--socket-timeout")
            .arg(self.socket_timeout.as_secs().to_string())
            .arg(url);
        let output = cmd.output().await.map_err(AppError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                event = "probe_failed",
                status = %output.status,
                stderr = %stderr.trim()
            );
            return Err(classify_tool_error(&stderr));
        }

        let info: ProbeInfo = serde_json::from_slice(&output.stdout).map_err(AppError::Json)?;
        info!(
            event = "probe_success",
            media_id = %info.id,
            format_count = info.formats.len()
        );
        Ok(info)
    }
}

#[async_trait]
impl Downloader for YtDlpClient {
    #[instrument(skip(self, req), fields(url = %req.url, media_id = %req.media_id))]
    async fn download(&self, req: DownloadRequest) -> Result<Vec<PathBuf>, AppError> {
        download_with_progress(req, &self.cache_dir).await
    }
}

const PROGRESS_TEMPLATE: &str = "download:dl %(progress.downloaded_bytes)s \
     %(progress.total_bytes)s %(progress.total_bytes_estimate)s \
     %(progress.speed)s %(progress.elapsed)s";

#[instrument(skip(req, cache_dir), fields(media_id = %req.media_id))]
async fn download_with_progress(
    req: DownloadRequest,
    cache_dir: &Path,
) -> Result<Vec<PathBuf>, AppError> {
    info!(
        event = "download_start",
        selector = %req.spec.selector,
        kind = %req.kind
    );
    tokio::fs::create_dir_all(&req.out_dir).await.map_err(AppError::Io)?;
    tokio::fs::create_dir_all(cache_dir).await.map_err(AppError::Io)?;

    let mut cmd = base_command();
    cmd.arg("-f")
        .arg(&req.spec.selector)
        .arg("-o")
        .arg(output_template(&req.out_dir))
        .arg("--restrict-filenames")
        .arg("--no-playlist")
        .arg("--newline")
        .arg("--progress")
        .arg("--progress-template")
        .arg(PROGRESS_TEMPLATE)
        .arg("--socket-timeout")
        .arg(req.socket_timeout.as_secs().to_string())
        .arg("--retries")
        .arg(req.retries.to_string())
        .arg("--concurrent-fragments")
        .arg("3")
        .arg("--cache-dir")
        .arg(cache_dir);
    if let Some(container) = req.spec.merge_container {
        cmd.arg("--merge-output-format").arg(container);
    }
    if let Some(pp) = &req.spec.postprocess {
        cmd.arg("-x")
            .arg("--audio-format")
            .arg(pp.codec)
            .arg("--audio-quality")
            .arg(format!("{}K", pp.bitrate_kbps));
    }
    cmd.arg(&req.url)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(AppError::Io)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::MissingOutput("stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::MissingOutput("stderr".into()))?;

    let stderr_task = tokio::spawn(
        async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut tail = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                trace!(event = "yt_dlp_stderr_line", line = line.as_str());
                if tail.len() + line.len() < 8 * 1024 {
                    tail.push_str(&line);
                    tail.push('\n');
                }
            }
            tail
        }
        .in_current_span(),
    );

    let mut reader = BufReader::new(stdout).lines();
    let mut postprocessing = false;
    loop {
        if req.cancel.load(Ordering::SeqCst) {
            info!(event = "download_cancelled");
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = stderr_task.await;
            purge_partials(&req.out_dir, &req.media_id).await;
            return Err(AppError::Cancelled);
        }
        match reader.next_line().await.map_err(AppError::Io)? {
            Some(line) => {
                if let Some(event) = parse_progress_line(&line) {
                    let _ = req.events.send(DownloadEvent::Progress(event));
                } else if !postprocessing && is_postprocess_line(&line) {
                    postprocessing = true;
                    debug!(event = "postprocess_start", line = line.as_str());
                    let _ = req.events.send(DownloadEvent::Postprocessing);
                }
            }
            None => {
                debug!(event = "download_stdout_eof");
                break;
            }
        }
    }

    let status = child.wait().await.map_err(AppError::Io)?;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    if !status.success() {
        error!(event = "download_failed_status", status = %status);
        purge_partials(&req.out_dir, &req.media_id).await;
        return Err(classify_tool_error(&stderr_tail));
    }

    let files = find_output_files(&req.out_dir, &req.media_id).await?;
    let picked = pick_for_kind(&files, req.kind);
    if picked.is_empty() {
        return Err(AppError::MissingOutput(format!(
            "no {} file produced for {}",
            req.kind, req.media_id
        )));
    }
    info!(event = "download_complete", file_count = picked.len());
    Ok(picked)
}

fn base_command() -> Command {
    let mut cmd = Command::new("yt-dlp");
    let player_client = env::var("YTDLP_PLAYER_CLIENT").unwrap_or_else(|_| "android".to_string());
    cmd.arg("--extractor-args")
        .arg(format!("youtube:player_client={player_client}"));

    if matches!(
        env::var("YTDLP_FORCE_IPV4").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    ) {
        info!(event = "yt_dlp_force_ipv4");
        cmd.arg("--force-ipv4");
    }

    cmd.arg("--no-warnings");
    cmd
}

/// Title-plus-id template keeps artifact names unique per source and
/// discoverable afterwards by the `-{id}.` infix.
fn output_template(out_dir: &Path) -> String {
    out_dir
        .join("%(title).80s-%(id)s.%(ext)s")
        .to_string_lossy()
        .into_owned()
}

fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix("dl ")?;
    let mut parts = rest.split_whitespace();
    let downloaded = parse_field(parts.next()?)? as u64;
    let total = parse_field(parts.next()?);
    let estimate = parse_field(parts.next()?);
    let speed = parse_field(parts.next()?);
    let elapsed = parse_field(parts.next()?).unwrap_or(0.0);
    Some(ProgressEvent {
        downloaded_bytes: downloaded,
        total_bytes: total.or(estimate).map(|v| v as u64),
        speed_bps: speed,
        elapsed: Duration::from_secs_f64(elapsed.max(0.0)),
    })
}

fn parse_field(raw: &str) -> Option<f64> {
    match raw {
        "NA" | "None" | "" => None,
        value => value.parse().ok(),
    }
}

fn is_postprocess_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("[Merger]")
        || trimmed.starts_with("[ExtractAudio]")
        || trimmed.starts_with("[VideoConvertor]")
}

/// Every tool failure is sorted into the error taxonomy before it reaches
/// the orchestrator; nothing opaque crosses this boundary.
fn classify_tool_error(stderr: &str) -> AppError {
    let message = error_line(stderr);
    let lower = stderr.to_lowercase();

    const POSTPROCESS_MARKERS: [&str; 4] = ["ffmpeg", "ffprobe", "postprocess", "merger"];
    const NETWORK_MARKERS: [&str; 8] = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporary failure",
        "network is unreachable",
        "read error",
        "http error 5",
    ];

    if POSTPROCESS_MARKERS.iter().any(|m| lower.contains(m)) {
        AppError::Postprocess(format!("{message} (is ffmpeg installed?)"))
    } else if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        AppError::NetworkTransient(message)
    } else {
        AppError::Extraction(message)
    }
}

fn error_line(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| line.contains("ERROR:"))
        .last()
        .map(|line| line.trim().trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| {
            let trimmed = stderr.trim();
            trimmed.lines().last().unwrap_or(trimmed).trim().to_string()
        })
}

/// All artifacts produced for a media id, sorted by name.
pub async fn find_output_files(dir: &Path, media_id: &str) -> Result<Vec<PathBuf>, AppError> {
    let infix = format!("-{media_id}.");
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(AppError::Io(err)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(AppError::Io)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(&infix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Picks the files worth sending for the requested kind. Video prefers mp4
/// (the merge container) and falls back to other containers yt-dlp leaves
/// behind when muxing to mp4 is impossible.
pub fn pick_for_kind(files: &[PathBuf], kind: MediaKind) -> Vec<PathBuf> {
    let with_ext = |exts: &[&str]| -> Vec<PathBuf> {
        files
            .iter()
            .filter(|path| {
                path.extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .map_or(false, |ext| exts.contains(&ext.as_str()))
            })
            .cloned()
            .collect()
    };
    match kind {
        MediaKind::Audio => with_ext(&["mp3"]),
        MediaKind::Video => {
            let mp4 = with_ext(&["mp4"]);
            if mp4.is_empty() {
                with_ext(&["mkv", "webm", "mov"])
            } else {
                mp4
            }
        }
    }
}

/// Removes every file produced for a media id, including partials.
pub async fn purge_media_files(dir: &Path, media_id: &str) {
    match find_output_files(dir, media_id).await {
        Ok(files) => {
            for path in files {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(event = "purge_failed", path = %path.display(), error = %err);
                }
            }
        }
        Err(err) => warn!(event = "purge_scan_failed", error = %err),
    }
}

/// Removes only in-flight temp files, leaving finished artifacts (possibly
/// from an earlier stage of the same request) alone.
async fn purge_partials(dir: &Path, media_id: &str) {
    if let Ok(files) = find_output_files(dir, media_id).await {
        for path in files {
            let name = path.to_string_lossy().into_owned();
            if name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".temp") {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_with_all_fields() {
        let event = parse_progress_line("dl 1024 4096 NA 512.5 3.5").unwrap();
        assert_eq!(event.downloaded_bytes, 1024);
        assert_eq!(event.total_bytes, Some(4096));
        assert_eq!(event.speed_bps, Some(512.5));
        assert_eq!(event.elapsed, Duration::from_secs_f64(3.5));
    }

    #[test]
    fn progress_line_falls_back_to_estimate() {
        let event = parse_progress_line("dl 100 NA 2000.0 NA 0.1").unwrap();
        assert_eq!(event.total_bytes, Some(2000));
        assert_eq!(event.speed_bps, None);
    }

    #[test]
    fn progress_line_with_unknown_total() {
        let event = parse_progress_line("dl 100 NA NA 50.0 1.0").unwrap();
        assert_eq!(event.total_bytes, None);
    }

    #[test]
    fn non_progress_lines_are_ignored() {
        assert!(parse_progress_line("[download] Destination: clip.mp4").is_none());
        assert!(parse_progress_line("dl NA NA NA NA NA").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn postprocess_lines_are_recognized() {
        assert!(is_postprocess_line("[Merger] Merging formats into \"clip.mp4\""));
        assert!(is_postprocess_line("[ExtractAudio] Destination: clip.mp3"));
        assert!(!is_postprocess_line("[download] 100%"));
    }

    #[test]
    fn extractor_errors_classify_as_extraction() {
        let err = classify_tool_error("ERROR: Unsupported URL: https://example.com");
        assert!(matches!(err, AppError::Extraction(_)));
        let err = classify_tool_error("ERROR: [youtube] abc: Video unavailable");
        assert!(matches!(err, AppError::Extraction(_)));
    }

    #[test]
    fn network_errors_classify_as_transient() {
        let err = classify_tool_error("ERROR: Unable to download webpage: <urlopen error timed out>");
        assert!(matches!(err, AppError::NetworkTransient(_)));
        let err = classify_tool_error("ERROR: Connection reset by peer");
        assert!(matches!(err, AppError::NetworkTransient(_)));
    }

    #[test]
    fn ffmpeg_errors_classify_as_postprocess_with_hint() {
        let err = classify_tool_error("ERROR: ffprobe and ffmpeg not found. Please install");
        match err {
            AppError::Postprocess(message) => assert!(message.contains("ffmpeg installed")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn error_line_picks_last_error() {
        let stderr = "WARNING: something\nERROR: first\nERROR: second one\n";
        assert_eq!(error_line(stderr), "second one");
        assert_eq!(error_line("plain failure\n"), "plain failure");
    }

    #[tokio::test]
    async fn output_discovery_and_picking() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "My_Clip-abc123.mp4",
            "My_Clip-abc123.mp3",
            "My_Clip-abc123.mp4.part",
            "Other-zzz999.mp4",
        ] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let files = find_output_files(dir.path(), "abc123").await.unwrap();
        assert_eq!(files.len(), 3);

        let video = pick_for_kind(&files, MediaKind::Video);
        assert_eq!(video.len(), 1);
        assert!(video[0].to_string_lossy().ends_with(".mp4"));

        let audio = pick_for_kind(&files, MediaKind::Audio);
        assert_eq!(audio.len(), 1);
        assert!(audio[0].to_string_lossy().ends_with(".mp3"));
    }

    #[tokio::test]
    async fn video_picking_falls_back_to_other_containers() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Clip-abc.webm"), b"x")
            .await
            .unwrap();
        let files = find_output_files(dir.path(), "abc").await.unwrap();
        let picked = pick_for_kind(&files, MediaKind::Video);
        assert_eq!(picked.len(), 1);
        assert!(picked[0].to_string_lossy().ends_with(".webm"));
    }

    #[tokio::test]
    async fn purge_partials_leaves_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Clip-abc.mp4"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("Clip-abc.mp4.part"), b"x").await.unwrap();
        purge_partials(dir.path(), "abc").await;
        let files = find_output_files(dir.path(), "abc").await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with(".mp4"));
    }

    #[tokio::test]
    async fn purge_media_files_removes_everything_for_the_id() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Clip-abc.mp4"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("Clip-abc.mp3"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("Keep-def.mp4"), b"x").await.unwrap();
        purge_media_files(dir.path(), "abc").await;
        assert!(find_output_files(dir.path(), "abc").await.unwrap().is_empty());
        assert_eq!(find_output_files(dir.path(), "def").await.unwrap().len(), 1);
    }

    #[test]
    fn output_template_embeds_title_and_id() {
        let template = output_template(Path::new("/tmp/dl"));
        assert!(template.ends_with("%(title).80s-%(id)s.%(ext)s"));
    }
}
