use crate::messages::KeystrokeEvent;
use std::time::Duration;
use tokio::time::Instant;

/// Sustained typing faster than this is not human.
const MAX_CHARS_PER_SEC: f64 = 25.0;
/// Speed violations tolerated before disqualification.
const SPEED_VIOLATION_LIMIT: u32 = 3;
/// Finishing above this WPM disqualifies outright.
pub const MAX_FINISH_WPM: i64 = 300;
/// Interval below which the speed bound is not evaluated.
const MIN_SPEED_SAMPLE: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy)]
pub struct SpeedTracker {
    violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Validated and bounded values, safe to buffer and broadcast.
    Accept { progress: i64, errors: i64 },
    /// Regression or garbage; dropped without a broadcast or an error frame.
    Drop,
    /// Speed bound exceeded; dropped, and disqualifying on the third strike.
    SpeedViolation { disqualify: bool },
}

/// Validates one progress frame against the previous server-observed state.
pub fn validate_progress(
    previous: Option<(i64, Instant)>,
    progress: i64,
    errors: i64,
    paragraph_len: i64,
    tracker: &mut SpeedTracker,
    now: Instant,
) -> ProgressOutcome {
    if progress < 0 || errors < 0 {
        return ProgressOutcome::Drop;
    }

    if let Some((prev_progress, last_update)) = previous {
        if progress < prev_progress {
            return ProgressOutcome::Drop;
        }
        let elapsed = now.saturating_duration_since(last_update);
        if elapsed >= MIN_SPEED_SAMPLE {
            let chars_per_sec =
                (progress - prev_progress) as f64 * 1000.0 / elapsed.as_millis() as f64;
            if chars_per_sec > MAX_CHARS_PER_SEC {
                tracker.violations += 1;
                return ProgressOutcome::SpeedViolation {
                    disqualify: tracker.violations >= SPEED_VIOLATION_LIMIT,
                };
            }
        }
    }

    let progress = progress.min(paragraph_len);
    let errors = errors.min(progress);
    ProgressOutcome::Accept { progress, errors }
}

/// Server-authoritative WPM and accuracy from a progress snapshot.
#[must_use]
pub fn server_metrics(progress: i64, errors: i64, elapsed: Duration) -> (i64, f64) {
    let correct_chars = (progress - errors).max(0) as f64;
    let elapsed_secs = elapsed.as_secs_f64().max(1.0);
    let wpm = ((correct_chars / 5.0) / (elapsed_secs / 60.0)).round() as i64;
    let accuracy = if progress > 0 {
        (correct_chars / progress as f64 * 10_000.0).round() / 100.0
    } else {
        100.0
    };
    (wpm, accuracy)
}

#[derive(Debug, Clone)]
pub struct KeystrokeVerdict {
    pub is_valid: bool,
    pub is_flagged: bool,
    pub server_calculated_wpm: i64,
    pub flag_reasons: Vec<String>,
}

/// Validates a keystroke evidence frame against the server-held paragraph.
/// Correctness is re-derived per event; the client's `correct` bits are
/// ignored. Returns `None` when no derivable keystroke remains.
#[must_use]
pub fn validate_keystrokes(
    paragraph: &str,
    events: &[KeystrokeEvent],
    client_wpm: Option<f64>,
) -> Option<KeystrokeVerdict> {
    let chars: Vec<char> = paragraph.chars().collect();
    let mut derivable = 0usize;
    let mut correct = 0usize;
    let mut non_monotonic = false;
    let mut last_timestamp = i64::MIN;
    let mut intervals: Vec<i64> = Vec::new();

    for event in events {
        if event.timestamp < last_timestamp {
            non_monotonic = true;
        }
        if last_timestamp != i64::MIN {
            intervals.push(event.timestamp - last_timestamp);
        }
        last_timestamp = event.timestamp;

        let position = usize::try_from(event.position).ok();
        let expected = position.and_then(|p| chars.get(p));
        let Some(expected) = expected else { continue };
        derivable += 1;
        let mut typed = event.key.chars();
        if typed.next() == Some(*expected) && typed.next().is_none() {
            correct += 1;
        }
    }

    if derivable == 0 {
        return None;
    }

    let span_ms = events
        .last()
        .map(|last| last.timestamp)
        .zip(events.first().map(|first| first.timestamp))
        .map_or(0, |(last, first)| (last - first).max(0));
    let minutes = (span_ms as f64 / 60_000.0).max(1.0 / 60.0);
    let server_calculated_wpm = ((correct as f64 / 5.0) / minutes).round() as i64;

    let mut flag_reasons = Vec::new();
    if non_monotonic {
        flag_reasons.push("non_monotonic_timestamps".to_owned());
    }
    if server_calculated_wpm > MAX_FINISH_WPM {
        flag_reasons.push("wpm_exceeds_maximum".to_owned());
    }
    if let Some(claimed) = client_wpm {
        let delta = (claimed - server_calculated_wpm as f64).abs();
        if delta > 20.0 && delta > claimed.abs() * 0.3 {
            flag_reasons.push("client_wpm_mismatch".to_owned());
        }
    }
    // Inhumanly uniform cadence over a long run of keystrokes.
    if intervals.len() >= 50 {
        let mean = intervals.iter().sum::<i64>() as f64 / intervals.len() as f64;
        let variance = intervals
            .iter()
            .map(|interval| {
                let d = *interval as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / intervals.len() as f64;
        if variance.sqrt() < 2.0 {
            flag_reasons.push("robotic_cadence".to_owned());
        }
    }

    let is_valid = !non_monotonic && server_calculated_wpm <= MAX_FINISH_WPM;
    Some(KeystrokeVerdict {
        is_valid,
        is_flagged: !flag_reasons.is_empty(),
        server_calculated_wpm,
        flag_reasons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(pairs: &[(i64, &str, i64)]) -> Vec<KeystrokeEvent> {
        pairs
            .iter()
            .map(|(position, key, timestamp)| KeystrokeEvent {
                position: *position,
                key: (*key).to_owned(),
                timestamp: *timestamp,
                correct: None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn regression_is_dropped() {
        let mut tracker = SpeedTracker::default();
        let now = Instant::now();
        let outcome = validate_progress(Some((40, now)), 35, 0, 100, &mut tracker, now);
        assert_eq!(outcome, ProgressOutcome::Drop);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_values_are_dropped() {
        let mut tracker = SpeedTracker::default();
        let now = Instant::now();
        assert_eq!(
            validate_progress(None, -1, 0, 100, &mut tracker, now),
            ProgressOutcome::Drop
        );
        assert_eq!(
            validate_progress(None, 5, -2, 100, &mut tracker, now),
            ProgressOutcome::Drop
        );
    }

    #[tokio::test(start_paused = true)]
    async fn progress_clamped_to_paragraph_and_errors_to_progress() {
        let mut tracker = SpeedTracker::default();
        let now = Instant::now();
        match validate_progress(None, 500, 600, 100, &mut tracker, now) {
            ProgressOutcome::Accept { progress, errors } => {
                assert_eq!(progress, 100);
                assert_eq!(errors, 100);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn third_speed_violation_disqualifies() {
        let mut tracker = SpeedTracker::default();
        let mut now = Instant::now();
        let mut progress = 0;
        let mut disqualified = false;
        for _ in 0..3 {
            now += Duration::from_millis(100);
            // 10 chars in 100 ms = 100 chars/sec, far over the bound.
            progress += 10;
            match validate_progress(Some((progress - 10, now - Duration::from_millis(100))), progress, 0, 1000, &mut tracker, now) {
                ProgressOutcome::SpeedViolation { disqualify } => disqualified = disqualify,
                other => panic!("expected speed violation, got {other:?}"),
            }
        }
        assert!(disqualified);
    }

    #[tokio::test(start_paused = true)]
    async fn short_intervals_skip_speed_check() {
        let mut tracker = SpeedTracker::default();
        let now = Instant::now();
        let outcome = validate_progress(
            Some((0, now - Duration::from_millis(10))),
            10,
            0,
            100,
            &mut tracker,
            now,
        );
        assert!(matches!(outcome, ProgressOutcome::Accept { .. }));
    }

    #[test]
    fn metrics_match_known_values() {
        // 11 correct chars in 5 seconds: 2.2 words at 12x = 26 wpm.
        let (wpm, accuracy) = server_metrics(11, 0, Duration::from_secs(5));
        assert_eq!(wpm, 26);
        assert_eq!(accuracy, 100.0);

        // 90 chars, no errors, 30 seconds: 36 wpm.
        let (wpm, _) = server_metrics(90, 0, Duration::from_secs(30));
        assert_eq!(wpm, 36);

        // 60 chars with 2 errors in 30 seconds.
        let (wpm, accuracy) = server_metrics(60, 2, Duration::from_secs(30));
        assert_eq!(wpm, 23);
        assert_eq!(accuracy, 96.67);

        // Sub-second elapsed clamps to one second.
        let (wpm, _) = server_metrics(10, 0, Duration::from_millis(100));
        assert_eq!(wpm, 120);

        let (_, accuracy) = server_metrics(0, 0, Duration::from_secs(10));
        assert_eq!(accuracy, 100.0);
    }

    #[test]
    fn keystrokes_derive_correctness_from_paragraph() {
        let verdict = validate_keystrokes(
            "abc",
            &events(&[(0, "a", 0), (1, "x", 300), (2, "c", 600)]),
            None,
        )
        .unwrap();
        assert!(verdict.is_valid);
        // 2 correct chars over 600 ms, clamped to the one-second floor.
        assert_eq!(verdict.server_calculated_wpm, 24);
    }

    #[test]
    fn keystrokes_with_no_derivable_position_reject() {
        let verdict = validate_keystrokes("abc", &events(&[(50, "a", 0), (-1, "b", 10)]), None);
        assert!(verdict.is_none());
    }

    #[test]
    fn out_of_order_timestamps_invalidate() {
        let verdict = validate_keystrokes(
            "abcd",
            &events(&[(0, "a", 100), (1, "b", 50), (2, "c", 200)]),
            None,
        )
        .unwrap();
        assert!(!verdict.is_valid);
        assert!(verdict.is_flagged);
        assert!(verdict
            .flag_reasons
            .contains(&"non_monotonic_timestamps".to_owned()));
    }

    #[test]
    fn wildly_overstated_client_wpm_flags() {
        let verdict = validate_keystrokes(
            "abcdef",
            &events(&[(0, "a", 0), (1, "b", 1000), (2, "c", 2000), (3, "d", 3000)]),
            Some(250.0),
        )
        .unwrap();
        assert!(verdict.is_flagged);
        assert!(verdict
            .flag_reasons
            .contains(&"client_wpm_mismatch".to_owned()));
    }
}
