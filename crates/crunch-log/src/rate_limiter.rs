// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Throttling policy for the remote copy of a job's log.
//!
//! The limiter counts bytes and lines per throttle window and over the job's
//! whole life. When a per-window threshold is crossed the window closes until
//! its reset deadline; when the per-job cap is crossed it never reopens. Every
//! transition is reported once as a notice line that replaces the line that
//! caused it, so the reader of the remote log knows why output went quiet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::LogThrottleConfig;
use crate::constants::{CONTINUATION_MARKER, DURABLE_COPY_NOTE, HARD_CAP_SILENCE_SECS};
use crate::timestamp::Timestamper;

/// Counters and deadlines of the current throttle window.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThrottleWindow {
    /// Bytes accepted over the job's lifetime. Never decreases.
    pub bytes_logged: u64,
    /// When the window reopens. `None` until the first window starts.
    pub reset_at: Option<DateTime<Utc>>,
    pub lines_so_far: u64,
    pub bytes_so_far: u64,
    pub bytes_skipped: u64,
    pub is_open: bool,
    pub partial_line_last_at: Option<DateTime<Utc>>,
    pub first_partial_line: bool,
}

/// What to send to the remote API for one line.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict<'a> {
    /// Forward the line unchanged.
    Accept(&'a [u8]),
    /// Forward this notice instead of the line.
    Notice(String),
    /// Forward nothing.
    Drop,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: Arc<LogThrottleConfig>,
    timestamper: Timestamper,
    window: ThrottleWindow,
}

impl RateLimiter {
    pub fn new(config: Arc<LogThrottleConfig>, timestamper: Timestamper) -> Self {
        Self {
            config,
            timestamper,
            window: ThrottleWindow::default(),
        }
    }

    pub fn window(&self) -> &ThrottleWindow {
        &self.window
    }

    pub fn is_open(&self) -> bool {
        self.window.is_open
    }

    fn hard_capped(&self) -> bool {
        self.window.bytes_logged > self.config.limit_log_bytes_per_job
    }

    /// Starts a new window if the current one has expired, returning a
    /// "Skipped N bytes" notice when the previous window dropped anything.
    ///
    /// A job past its lifetime cap never gets a new window.
    pub fn start_window_if_due(&mut self, now: DateTime<Utc>) -> Option<String> {
        if self.hard_capped() {
            return None;
        }
        if self.window.reset_at.is_some_and(|reset_at| now <= reset_at) {
            return None;
        }

        let notice = (self.window.bytes_skipped > 0).then(|| {
            format!(
                "{} Skipped {} bytes of log",
                (self.timestamper)(now),
                self.window.bytes_skipped
            )
        });

        self.window.reset_at = Some(deadline(now, self.config.throttle_period));
        self.window.bytes_so_far = 0;
        self.window.lines_so_far = 0;
        self.window.bytes_skipped = 0;
        self.window.is_open = true;
        self.window.partial_line_last_at = None;
        self.window.first_partial_line = true;

        notice
    }

    /// Counts bytes that were dropped without being evaluated.
    pub fn skip(&mut self, len: usize) {
        self.window.bytes_skipped += len as u64;
    }

    /// Decides what happens to `line`.
    pub fn rate_limit<'a>(&mut self, line: &'a [u8], now: DateTime<Utc>) -> Verdict<'a> {
        let line_size = line.len() as u64;
        if !self.window.is_open {
            self.window.bytes_skipped += line_size;
            return Verdict::Drop;
        }

        let partial_line = is_partial_line(line);
        if partial_line {
            let cooled_down = self.window.partial_line_last_at.map_or(true, |last_at| {
                now > deadline(last_at, self.config.partial_line_throttle_period)
            });
            if cooled_down {
                self.window.partial_line_last_at = Some(now);
                self.window.first_partial_line = true;
            }
        }

        self.window.lines_so_far += 1;
        self.window.bytes_so_far += line_size;
        self.window.bytes_logged += line_size;

        let ts = (self.timestamper)(now);
        let period = self.config.throttle_period.as_secs();
        let message = if self.hard_capped() {
            self.window.reset_at = Some(deadline(now, Duration::from_secs(HARD_CAP_SILENCE_SECS)));
            self.window.is_open = false;
            Some(format!(
                "{ts} Exceeded log limit {} bytes (crunch_limit_log_bytes_per_job). Log will be truncated.",
                self.config.limit_log_bytes_per_job
            ))
        } else if self.window.bytes_so_far > self.config.throttle_bytes {
            self.window.is_open = false;
            Some(format!(
                "{ts} Exceeded rate {} bytes per {period} seconds (crunch_log_throttle_bytes). Logging will be silenced for the next {} seconds.",
                self.config.throttle_bytes,
                self.remaining_secs(now)
            ))
        } else if self.window.lines_so_far > self.config.throttle_lines {
            self.window.is_open = false;
            Some(format!(
                "{ts} Exceeded rate {} lines per {period} seconds (crunch_log_throttle_lines), logging will be silenced for the next {} seconds.",
                self.config.throttle_lines,
                self.remaining_secs(now)
            ))
        } else if partial_line && self.window.first_partial_line {
            self.window.first_partial_line = false;
            Some(format!(
                "{ts} Rate-limiting partial segments of long lines to one every {} seconds.",
                self.config.partial_line_throttle_period.as_secs()
            ))
        } else {
            None
        };

        if !self.window.is_open {
            self.window.bytes_skipped += line_size;
        }

        match message {
            Some(message) => Verdict::Notice(format!("{message} {DURABLE_COPY_NOTE}")),
            None if self.window.is_open => Verdict::Accept(line),
            None => Verdict::Drop,
        }
    }

    fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        self.window
            .reset_at
            .map_or(0, |reset_at| (reset_at - now).num_seconds())
    }
}

fn deadline(from: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(period)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Reports whether `line` is a middle segment of a split line: a leading
/// token without whitespace, one space, then content that both starts and
/// ends with the continuation marker.
pub fn is_partial_line(line: &[u8]) -> bool {
    let Some(boundary) = line
        .iter()
        .position(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\x0c' | b'\r'))
    else {
        return false;
    };
    if boundary == 0 || line[boundary] != b' ' {
        return false;
    }
    let rest = &line[boundary + 1..];
    let marker = CONTINUATION_MARKER.as_bytes();
    rest.starts_with(marker) && rest.ends_with(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn fixed_ts(_: DateTime<Utc>) -> String {
        "TS".to_string()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn limiter(config: LogThrottleConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(config), fixed_ts)
    }

    fn open_limiter(config: LogThrottleConfig) -> RateLimiter {
        let mut limiter = limiter(config);
        assert_eq!(limiter.start_window_if_due(start()), None);
        limiter
    }

    #[test]
    fn test_first_window_opens_without_notice() {
        let mut limiter = limiter(LogThrottleConfig::default());
        assert!(!limiter.is_open());
        assert_eq!(limiter.start_window_if_due(start()), None);
        assert!(limiter.is_open());
        assert_eq!(
            limiter.window().reset_at,
            Some(start() + TimeDelta::seconds(60))
        );
        // Same instant, same window
        assert_eq!(limiter.start_window_if_due(start()), None);
    }

    #[test]
    fn test_accepts_lines_under_thresholds() {
        let mut limiter = open_limiter(LogThrottleConfig::default());
        assert_eq!(
            limiter.rate_limit(b"hello world", start()),
            Verdict::Accept(b"hello world")
        );
        assert_eq!(limiter.window().lines_so_far, 1);
        assert_eq!(limiter.window().bytes_so_far, 11);
        assert_eq!(limiter.window().bytes_logged, 11);
    }

    #[test]
    fn test_byte_threshold_closes_window_once() {
        let mut limiter = open_limiter(LogThrottleConfig {
            throttle_bytes: 100,
            ..Default::default()
        });
        let now = start() + TimeDelta::seconds(15);

        for _ in 0..100 {
            assert_eq!(limiter.rate_limit(b"x", now), Verdict::Accept(b"x"));
        }
        let Verdict::Notice(notice) = limiter.rate_limit(b"x", now) else {
            panic!("expected a notice on the 101st byte");
        };
        assert_eq!(
            notice,
            format!("TS Exceeded rate 100 bytes per 60 seconds (crunch_log_throttle_bytes). Logging will be silenced for the next 45 seconds. {DURABLE_COPY_NOTE}")
        );
        assert!(!limiter.is_open());
        assert_eq!(limiter.window().bytes_skipped, 1);

        for _ in 0..10 {
            assert_eq!(limiter.rate_limit(b"x", now), Verdict::Drop);
        }
        assert_eq!(limiter.window().bytes_skipped, 11);
    }

    #[test]
    fn test_line_threshold_closes_window() {
        let mut limiter = open_limiter(LogThrottleConfig {
            throttle_lines: 2,
            ..Default::default()
        });
        assert!(matches!(limiter.rate_limit(b"a", start()), Verdict::Accept(_)));
        assert!(matches!(limiter.rate_limit(b"b", start()), Verdict::Accept(_)));
        let Verdict::Notice(notice) = limiter.rate_limit(b"c", start()) else {
            panic!("expected a notice");
        };
        assert!(notice.starts_with(
            "TS Exceeded rate 2 lines per 60 seconds (crunch_log_throttle_lines), logging will be silenced for the next 60 seconds."
        ));
        assert!(notice.ends_with(DURABLE_COPY_NOTE));
    }

    #[test]
    fn test_byte_threshold_wins_over_line_threshold() {
        let mut limiter = open_limiter(LogThrottleConfig {
            throttle_bytes: 3,
            throttle_lines: 1,
            ..Default::default()
        });
        assert!(matches!(limiter.rate_limit(b"a", start()), Verdict::Accept(_)));
        let Verdict::Notice(notice) = limiter.rate_limit(b"bcd", start()) else {
            panic!("expected a notice");
        };
        assert!(notice.contains("crunch_log_throttle_bytes"));
    }

    #[test]
    fn test_reset_reports_skipped_bytes() {
        let mut limiter = open_limiter(LogThrottleConfig {
            throttle_bytes: 4,
            ..Default::default()
        });
        assert!(matches!(limiter.rate_limit(b"abcd", start()), Verdict::Accept(_)));
        assert!(matches!(limiter.rate_limit(b"ef", start()), Verdict::Notice(_)));
        limiter.skip(3);
        assert_eq!(limiter.window().bytes_skipped, 5);

        // Still inside the window
        let before_reset = start() + TimeDelta::seconds(60);
        assert_eq!(limiter.start_window_if_due(before_reset), None);
        assert!(!limiter.is_open());

        let after_reset = start() + TimeDelta::seconds(61);
        assert_eq!(
            limiter.start_window_if_due(after_reset),
            Some("TS Skipped 5 bytes of log".to_string())
        );
        assert!(limiter.is_open());
        assert_eq!(limiter.window().bytes_skipped, 0);
        assert_eq!(limiter.window().bytes_so_far, 0);
        assert_eq!(limiter.window().bytes_logged, 6);
    }

    #[test]
    fn test_reset_without_skips_is_silent() {
        let mut limiter = open_limiter(LogThrottleConfig::default());
        assert!(matches!(limiter.rate_limit(b"abc", start()), Verdict::Accept(_)));
        assert_eq!(
            limiter.start_window_if_due(start() + TimeDelta::seconds(120)),
            None
        );
        assert!(limiter.is_open());
    }

    #[test]
    fn test_hard_cap_is_permanent() {
        let mut limiter = open_limiter(LogThrottleConfig {
            limit_log_bytes_per_job: 10,
            throttle_bytes: 5,
            throttle_period: Duration::from_secs(1),
            ..Default::default()
        });

        let mut now = start();
        assert!(matches!(limiter.rate_limit(b"12345", now), Verdict::Accept(_)));
        now += TimeDelta::seconds(2);
        assert_eq!(limiter.start_window_if_due(now), None);
        assert!(matches!(limiter.rate_limit(b"67890", now), Verdict::Accept(_)));
        now += TimeDelta::seconds(2);
        assert_eq!(limiter.start_window_if_due(now), None);

        let Verdict::Notice(notice) = limiter.rate_limit(b"!", now) else {
            panic!("expected the hard cap notice");
        };
        assert!(notice.starts_with(
            "TS Exceeded log limit 10 bytes (crunch_limit_log_bytes_per_job). Log will be truncated."
        ));
        assert_eq!(
            limiter.window().reset_at,
            Some(now + TimeDelta::days(365))
        );

        // Well past any deadline the window stays shut
        let much_later = now + TimeDelta::days(400);
        assert_eq!(limiter.start_window_if_due(much_later), None);
        assert!(!limiter.is_open());
        assert_eq!(limiter.rate_limit(b"more", much_later), Verdict::Drop);
        assert_eq!(limiter.window().bytes_logged, 11);
    }

    #[test]
    fn test_partial_line_notice_once_per_cooldown() {
        let mut limiter = open_limiter(LogThrottleConfig::default());
        let partial = b"2024-01-01T00:00:00.000000000Z [...]segment[...]";

        let Verdict::Notice(notice) = limiter.rate_limit(partial, start()) else {
            panic!("expected the partial segment notice");
        };
        assert_eq!(
            notice,
            format!("TS Rate-limiting partial segments of long lines to one every 5 seconds. {DURABLE_COPY_NOTE}")
        );
        assert!(limiter.is_open());

        for i in 1..=4 {
            let now = start() + TimeDelta::seconds(i);
            assert_eq!(limiter.rate_limit(partial, now), Verdict::Accept(partial));
        }

        // Cooldown elapsed
        let now = start() + TimeDelta::seconds(6);
        assert!(matches!(limiter.rate_limit(partial, now), Verdict::Notice(_)));
    }

    #[test]
    fn test_is_partial_line() {
        assert!(is_partial_line(b"ts [...]middle[...]"));
        assert!(is_partial_line(b"ts [...]"));
        assert!(is_partial_line(b"ts [...][...]"));
        assert!(!is_partial_line(b"ts [...]tail"));
        assert!(!is_partial_line(b"ts head[...]"));
        assert!(!is_partial_line(b" [...]x[...]"));
        assert!(!is_partial_line(b"ts\t[...]x[...]"));
        assert!(!is_partial_line(b"[...]x[...]"));
        assert!(!is_partial_line(b""));
    }

    proptest! {
        #[test]
        fn test_is_partial_line_matches_pattern(
            token in "[a-z\\[\\]. \t]{0,6}",
            body in "[a-z\\[\\]. \t]{0,12}",
            wrap in any::<bool>(),
        ) {
            let line = if wrap {
                format!("{token}[...]{body}[...]")
            } else {
                format!("{token}{body}")
            };
            let pattern = regex::bytes::Regex::new(r"(?-u)^[^\t\n\x0C\r ]+ (.*)").unwrap();
            let expected = pattern
                .captures(line.as_bytes())
                .and_then(|captures| captures.get(1))
                .map_or(false, |rest| {
                    rest.as_bytes().starts_with(b"[...]") && rest.as_bytes().ends_with(b"[...]")
                });
            prop_assert_eq!(is_partial_line(line.as_bytes()), expected);
        }
    }
}
