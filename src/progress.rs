use std::time::{Duration, Instant};

pub const PROGRESS_MIN_PERCENT_STEP: u32 = 5;
pub const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Point-in-time snapshot from the download stream. Total size is unknown
/// for live/variable streams.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgressEvent {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<f64>,
    pub elapsed: Duration,
}

impl ProgressEvent {
    pub fn percent(&self) -> Option<u32> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        Some(((self.downloaded_bytes.saturating_mul(100)) / total).min(100) as u32)
    }
}

/// Turns raw progress events into human-readable status strings, emitting at
/// most every N percentage points or every T seconds, whichever comes first.
/// The final 100% emission bypasses the throttle. Reported percent never
/// decreases, even when the total-size estimate shrinks mid-stream.
pub struct ProgressReporter {
    label: String,
    min_percent_step: u32,
    min_interval: Duration,
    last_percent: Option<u32>,
    last_emitted_at: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_thresholds(label, PROGRESS_MIN_PERCENT_STEP, PROGRESS_MIN_INTERVAL)
    }

    pub fn with_thresholds(
        label: impl Into<String>,
        min_percent_step: u32,
        min_interval: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            min_percent_step,
            min_interval,
            last_percent: None,
            last_emitted_at: None,
        }
    }

    pub fn report(&mut self, event: ProgressEvent) -> Option<String> {
        self.report_at(event, Instant::now())
    }

    pub fn report_at(&mut self, event: ProgressEvent, now: Instant) -> Option<String> {
        let interval_due = self
            .last_emitted_at
            .map_or(true, |at| now.duration_since(at) >= self.min_interval);

        match event.percent() {
            Some(raw) => {
                let percent = self.last_percent.map_or(raw, |last| raw.max(last));
                let step_due = self
                    .last_percent
                    .map_or(true, |last| percent >= last + self.min_percent_step);
                let finished = percent == 100 && self.last_percent != Some(100);
                if !(step_due || interval_due || finished) {
                    return None;
                }
                self.last_percent = Some(percent);
                self.last_emitted_at = Some(now);
                Some(self.render(Some(percent), &event))
            }
            None => {
                if !interval_due {
                    return None;
                }
                self.last_emitted_at = Some(now);
                Some(self.render(None, &event))
            }
        }
    }

    fn render(&self, percent: Option<u32>, event: &ProgressEvent) -> String {
        let mut parts = Vec::new();
        match percent {
            Some(p) => parts.push(format!("⬇️ {}: {p}%", self.label)),
            None => parts.push(format!(
                "⬇️ {}: {}",
                self.label,
                human_size(event.downloaded_bytes)
            )),
        }
        if let Some(speed) = event.speed_bps.filter(|s| *s > 0.0) {
            parts.push(format!("{}/s", human_size(speed as u64)));
        }
        match (percent, event.total_bytes, event.speed_bps) {
            (Some(p), Some(total), Some(speed)) if p < 100 && speed > 0.0 => {
                let remaining = total.saturating_sub(event.downloaded_bytes);
                parts.push(format!("ETA {}s", (remaining as f64 / speed).ceil() as u64));
            }
            (None, _, _) => {
                parts.push(format!(
                    "{} elapsed",
                    humanize_duration(event.elapsed.as_secs())
                ));
            }
            _ => {}
        }
        parts.join(" • ")
    }
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f >= GB {
        format!("{:.2} GB", bytes_f / GB)
    } else if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn humanize_duration(seconds: u64) -> String {
    let (hours, rem) = (seconds / 3600, seconds % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}
