use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

static PERIOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*(hours?|hrs?|minutes?|mins?|seconds?|secs?)\b")
        .expect("cooldown period regex is valid")
});

static SINGLE_HOUR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:an|one|per|each|every)\s+hour\b").expect("single hour regex is valid")
});

/// Cooldown stated in a quota notice, e.g. "... per 2 hours ..." or
/// "try again in 45 minutes". `None` when the text names no period.
pub fn parse_cooldown(notice: &str) -> Option<Duration> {
    if let Some(caps) = PERIOD.captures(notice) {
        let amount: f64 = caps[1].parse().ok()?;
        let unit = caps[2].to_ascii_lowercase();
        let scale = if unit.starts_with('h') {
            3600.0
        } else if unit.starts_with('m') {
            60.0
        } else {
            1.0
        };
        let secs = amount * scale;
        if secs <= 0.0 {
            return None;
        }
        return Duration::try_from_secs_f64(secs).ok();
    }
    SINGLE_HOUR
        .is_match(notice)
        .then(|| Duration::from_secs(3600))
}

/// "No new sessions before T". Set on a quota notice, cleared once waited out.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackoffWindow {
    until: Option<Instant>,
}

impl BackoffWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, cooldown: Duration) {
        self.until = Some(Instant::now() + cooldown);
    }

    /// Time left, or `None` when no window is open.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until?;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn clear(&mut self) {
        self.until = None;
    }

    /// Sleep until the window elapses, then clear it.
    pub async fn wait(&mut self) {
        if let Some(left) = self.remaining() {
            info!(secs = left.as_secs(), "Backing off until the quota window elapses");
            tokio::time::sleep(left).await;
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cooldown() {
        let notice = "You've reached your limit of 30 Grok DeepSearch questions per 2 hours for now.";
        assert_eq!(parse_cooldown(notice), Some(Duration::from_secs(7200)));
        assert_eq!(
            parse_cooldown("Please try again in 45 minutes"),
            Some(Duration::from_secs(2700))
        );
        assert_eq!(parse_cooldown("Limit resets per hour"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_cooldown("Wait 1.5 hrs"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_cooldown("Please check back later to continue."), None);
    }

    #[test]
    fn test_unrepresentable_period_is_none() {
        assert_eq!(parse_cooldown("Try again in 99999999999999999999 hours"), None);
        assert_eq!(parse_cooldown("Try again in 0 minutes"), None);
    }

    #[tokio::test]
    async fn test_backoff_window() {
        let mut window = BackoffWindow::new();
        assert!(!window.is_active());

        window.set(Duration::from_millis(50));
        assert!(window.is_active());
        assert!(window.remaining().unwrap() <= Duration::from_millis(50));

        window.wait().await;
        assert!(!window.is_active());
        assert!(window.remaining().is_none());
    }

    #[test]
    fn test_zero_window_is_inactive() {
        let mut window = BackoffWindow::new();
        window.set(Duration::ZERO);
        assert!(!window.is_active());
    }
}
