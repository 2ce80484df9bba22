//! Gate between speech recognition and the caption overlay.
//!
//! Recognised text is cleaned, checked for quality, compared against what was
//! published recently, and finally held back for a length-dependent debounce.
//! A newer submission replaces a pending one, so only the last utterance of a
//! burst goes out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CaptionConfig {
    pub max_len: usize,
    pub min_len: usize,
    /// Reported confidence below this is rejected. Zero means "not reported".
    pub min_confidence: f32,
    pub min_meaningful_ratio: f64,
    pub duplicate_window: Duration,
    pub duplicate_similarity: f64,
    pub base_debounce: Duration,
    pub adaptive_debounce: bool,
    pub history_max_age: Duration,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            max_len: 100,
            min_len: 2,
            min_confidence: 0.7,
            min_meaningful_ratio: 0.4,
            duplicate_window: Duration::from_secs(5),
            duplicate_similarity: 0.8,
            base_debounce: Duration::from_millis(300),
            adaptive_debounce: true,
            history_max_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptionRejection {
    #[error("caption too short")]
    TooShort,
    #[error("recognition confidence {0:.2} below threshold")]
    LowConfidence(f32),
    #[error("caption is mostly noise")]
    NotMeaningful,
    #[error("caption repeats a recent one")]
    Duplicate,
}

#[derive(Debug)]
struct Pending {
    text: String,
    due: Instant,
}

#[derive(Debug)]
pub struct CaptionFilter {
    config: CaptionConfig,
    history: VecDeque<(String, Instant)>,
    pending: Option<Pending>,
}

impl Default for CaptionFilter {
    fn default() -> Self {
        Self::new(CaptionConfig::default())
    }
}

impl CaptionFilter {
    pub fn new(config: CaptionConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            pending: None,
        }
    }

    /// Trims, collapses whitespace and truncates. Empty when too short.
    pub fn clean(&self, text: &str) -> String {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let truncated: String = collapsed.chars().take(self.config.max_len).collect();
        if truncated.chars().count() >= self.config.min_len {
            truncated
        } else {
            String::new()
        }
    }

    fn check_quality(&self, text: &str, confidence: Option<f32>) -> Result<(), CaptionRejection> {
        if let Some(c) = confidence {
            if c > 0.0 && c < self.config.min_confidence {
                return Err(CaptionRejection::LowConfidence(c));
            }
        }
        let total = text.chars().count();
        let meaningful = text.chars().filter(|c| is_meaningful(*c)).count();
        let ratio = if total == 0 {
            0.0
        } else {
            meaningful as f64 / total as f64
        };
        if ratio > self.config.min_meaningful_ratio {
            Ok(())
        } else {
            Err(CaptionRejection::NotMeaningful)
        }
    }

    fn is_duplicate(&self, text: &str, now: Instant) -> bool {
        self.history.iter().any(|(seen, at)| {
            now.saturating_duration_since(*at) < self.config.duplicate_window
                && similarity(text, seen) > self.config.duplicate_similarity
        })
    }

    pub fn debounce_for(&self, text: &str) -> Duration {
        if !self.config.adaptive_debounce {
            return self.config.base_debounce;
        }
        let factor = (text.chars().count() as f64 / 20.0).min(2.0);
        let ms = self.config.base_debounce.as_millis() as f64 * (0.5 + factor * 0.5);
        Duration::from_millis(ms.round() as u64)
    }

    /// Accepts recognised text and schedules it, replacing any pending caption.
    ///
    /// Returns the debounce delay on acceptance.
    pub fn submit(
        &mut self,
        text: &str,
        confidence: Option<f32>,
        now: Instant,
    ) -> Result<Duration, CaptionRejection> {
        self.prune(now);

        let cleaned = self.clean(text);
        if cleaned.is_empty() {
            return Err(CaptionRejection::TooShort);
        }
        self.check_quality(&cleaned, confidence)?;
        if self.is_duplicate(&cleaned, now) {
            return Err(CaptionRejection::Duplicate);
        }

        self.history.push_back((cleaned.clone(), now));
        let delay = self.debounce_for(&cleaned);
        self.pending = Some(Pending {
            text: cleaned,
            due: now + delay,
        });
        Ok(delay)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    /// Takes the pending caption once its debounce has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<String> {
        match &self.pending {
            Some(p) if p.due <= now => self.pending.take().map(|p| p.text),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    fn prune(&mut self, now: Instant) {
        let max_age = self.config.history_max_age;
        self.history
            .retain(|(_, at)| now.saturating_duration_since(*at) < max_age);
    }
}

/// Hangul syllables, ASCII letters and digits.
fn is_meaningful(c: char) -> bool {
    c.is_ascii_alphanumeric() || ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// `1 - levenshtein / max_len` over chars.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return if b.is_empty() { 1.0 } else { 0.0 };
    }
    if b.is_empty() {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=a.len()).collect();
    let mut row = vec![0; a.len() + 1];
    for (j, cb) in b.iter().enumerate() {
        row[0] = j + 1;
        for (i, ca) in a.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[i + 1] = (prev[i + 1] + 1).min(row[i] + 1).min(prev[i] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    let distance = prev[a.len()] as f64;
    1.0 - distance / a.len().max(b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_collapses_and_truncates() {
        let filter = CaptionFilter::default();
        assert_eq!(filter.clean("  hello    there \n friend "), "hello there friend");
        assert_eq!(filter.clean(" a "), "");
        let long = "x".repeat(150);
        assert_eq!(filter.clean(&long).len(), 100);
    }

    #[test]
    fn quality_gate() {
        let mut filter = CaptionFilter::default();
        let now = Instant::now();
        assert_eq!(
            filter.submit("hello there", Some(0.5), now),
            Err(CaptionRejection::LowConfidence(0.5))
        );
        assert_eq!(
            filter.submit("?? !! ..", None, now),
            Err(CaptionRejection::NotMeaningful)
        );
        assert!(filter.submit("안녕하세요 여러분", Some(0.9), now).is_ok());
        // Zero confidence is treated as unreported.
        assert!(filter.submit("completely different", Some(0.0), now).is_ok());
    }

    #[test]
    fn near_duplicates_within_window_are_dropped() {
        let mut filter = CaptionFilter::default();
        let now = Instant::now();
        assert!(filter.submit("see you tomorrow", None, now).is_ok());
        assert_eq!(
            filter.submit("see you tomorow", None, now + Duration::from_secs(1)),
            Err(CaptionRejection::Duplicate)
        );
        assert!(filter
            .submit("see you tomorrow", None, now + Duration::from_secs(6))
            .is_ok());
    }

    #[test]
    fn debounce_scales_with_length() {
        let filter = CaptionFilter::default();
        assert_eq!(filter.debounce_for("hi"), Duration::from_millis(165));
        assert_eq!(filter.debounce_for(&"a".repeat(20)), Duration::from_millis(300));
        assert_eq!(filter.debounce_for(&"a".repeat(80)), Duration::from_millis(450));
    }

    #[test]
    fn newer_submission_replaces_pending() {
        let mut filter = CaptionFilter::default();
        let now = Instant::now();
        filter.submit("first caption", None, now).unwrap();
        let delay = filter
            .submit("second thought", None, now + Duration::from_millis(50))
            .unwrap();

        let due = now + Duration::from_millis(50) + delay;
        assert_eq!(filter.next_deadline(), Some(due));
        assert_eq!(filter.take_due(due - Duration::from_millis(1)), None);
        assert_eq!(filter.take_due(due).as_deref(), Some("second thought"));
        assert_eq!(filter.take_due(due), None);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", ""), 0.0);
        assert_eq!(similarity("kitten", "kitten"), 1.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
    }
}
