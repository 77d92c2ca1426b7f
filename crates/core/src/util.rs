use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

/// Returns current unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Generates a new ULID.
pub fn new_ulid() -> Ulid {
    Ulid::new()
}

/// Filename prefix shared by every working artifact of a topic.
pub fn topic_slug(topic: &str) -> String {
    topic.replace(' ', "_")
}

/// Formats seconds as an SRT cue timestamp (`HH:MM:SS,mmm`).
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_replaces_spaces_only() {
        assert_eq!(topic_slug("MikroTik VPN Setup"), "MikroTik_VPN_Setup");
        assert_eq!(topic_slug("QoS/Queues"), "QoS/Queues");
    }

    #[test]
    fn srt_timestamps() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(61.5), "00:01:01,500");
        assert_eq!(srt_timestamp(3725.042), "01:02:05,042");
        assert_eq!(srt_timestamp(-3.0), "00:00:00,000");
    }
}
