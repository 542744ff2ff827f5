use crate::{config::Config, error::AppError, ytdlp::ProbeInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the user asked for. `Both` runs the video stage and then the audio
/// stage, each with its own quality ladder.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedKind {
    Audio,
    Video,
    Both,
}

impl RequestedKind {
    pub fn stages(self) -> &'static [MediaKind] {
        match self {
            RequestedKind::Audio => &[MediaKind::Audio],
            RequestedKind::Video => &[MediaKind::Video],
            RequestedKind::Both => &[MediaKind::Video, MediaKind::Audio],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestedKind::Audio => "audio",
            RequestedKind::Video => "video",
            RequestedKind::Both => "audio+video",
        }
    }
}

impl fmt::Display for RequestedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// One rung of the fallback ladder. Ladders are strictly descending; the
/// orchestrator only ever walks them forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QualityTier {
    MaxHeight(u32),
    MaxAudioBitrate(u32),
}

impl QualityTier {
    pub fn ceiling(self) -> u32 {
        match self {
            QualityTier::MaxHeight(h) => h,
            QualityTier::MaxAudioBitrate(k) => k,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::MaxHeight(h) => write!(f, "{h}p"),
            QualityTier::MaxAudioBitrate(k) => write!(f, "{k}kbps"),
        }
    }
}

const VIDEO_HEIGHTS: [u32; 6] = [2160, 1440, 1080, 720, 480, 360];

pub fn quality_ladder(kind: MediaKind, config: &Config) -> Vec<QualityTier> {
    let ladder = match kind {
        MediaKind::Video => {
            let ladder: Vec<QualityTier> = VIDEO_HEIGHTS
                .iter()
                .filter(|h| **h <= config.max_height)
                .map(|h| QualityTier::MaxHeight(*h))
                .collect();
            if ladder.is_empty() {
                vec![QualityTier::MaxHeight(config.max_height)]
            } else {
                ladder
            }
        }
        MediaKind::Audio => config
            .audio_bitrate_ladder
            .iter()
            .map(|k| QualityTier::MaxAudioBitrate(*k))
            .collect(),
    };
    debug_assert!(ladder
        .windows(2)
        .all(|pair| pair[0].ceiling() > pair[1].ceiling()));
    ladder
}

/// Declarative download target handed to the extraction tool: a yt-dlp
/// format selector plus mux/transcode directives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormatSpec {
    pub selector: String,
    pub merge_container: Option<&'static str>,
    pub postprocess: Option<AudioPostprocess>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AudioPostprocess {
    pub codec: &'static str,
    pub bitrate_kbps: u32,
}

/// Maps probed metadata and a quality tier to a concrete format request.
/// Pure; the only failure is a source that cannot satisfy the requested kind
/// at all.
pub fn select(info: &ProbeInfo, kind: MediaKind, tier: QualityTier) -> Result<FormatSpec, AppError> {
    match (kind, tier) {
        (MediaKind::Video, QualityTier::MaxHeight(height)) => {
            if !info.formats.iter().any(|f| f.has_video()) {
                return Err(AppError::NoFormatAvailable("video"));
            }
            Ok(FormatSpec {
                selector: format!(
                    "bestvideo[height<={height}]+bestaudio/best[height<={height}]/best"
                ),
                merge_container: Some("mp4"),
                postprocess: None,
            })
        }
        (MediaKind::Audio, QualityTier::MaxAudioBitrate(bitrate)) => {
            if !info.formats.iter().any(|f| f.has_audio()) {
                return Err(AppError::NoFormatAvailable("audio"));
            }
            Ok(FormatSpec {
                selector: "bestaudio/best".to_string(),
                merge_container: None,
                postprocess: Some(AudioPostprocess {
                    codec: "mp3",
                    bitrate_kbps: bitrate,
                }),
            })
        }
        _ => Err(AppError::Internal(format!(
            "quality tier {tier} does not match requested kind {kind}"
        ))),
    }
}
