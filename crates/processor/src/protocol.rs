//! The comparison protocol: one task, one conversation.
//!
//! ```text
//! START -> AWAIT_INPUT_READY -> SUBMITTED_COMPARISON -> RATE_LIMIT_CHECK
//!       -> AWAIT_FOLLOWUP_READY -> SUBMITTED_FOLLOWUP -> VERDICT_SCAN
//!       -> {VERIFIED | IGNORED | UNRESOLVED}
//! ```
//!
//! A quota notice at RATE_LIMIT_CHECK leaves the machine in RATE_LIMITED
//! without a verdict. Errors surface as `aimatch_core::Error`; the caller
//! owns the per-task failure boundary.

use crate::backoff::parse_cooldown;
use crate::prompts::{comparison_prompt, submission, FOLLOWUP_PROMPT, NO_MARKER, YES_MARKER};
use aimatch_browser::{BestMatcher, ContainsMatcher, ElementRef, SessionHandle, TextMatcher};
use aimatch_core::config::{BrowserConfig, ProtocolConfig};
use aimatch_core::{Error, Result, Task, Verdict};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause between verdict-scan rounds when probes return faster than their
/// timeout.
const SCAN_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Start,
    AwaitInputReady,
    SubmittedComparison,
    RateLimitCheck,
    AwaitFollowupReady,
    SubmittedFollowup,
    VerdictScan,
    RateLimited,
    Done(Verdict),
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Start => "START",
            ProtocolState::AwaitInputReady => "AWAIT_INPUT_READY",
            ProtocolState::SubmittedComparison => "SUBMITTED_COMPARISON",
            ProtocolState::RateLimitCheck => "RATE_LIMIT_CHECK",
            ProtocolState::AwaitFollowupReady => "AWAIT_FOLLOWUP_READY",
            ProtocolState::SubmittedFollowup => "SUBMITTED_FOLLOWUP",
            ProtocolState::VerdictScan => "VERDICT_SCAN",
            ProtocolState::RateLimited => "RATE_LIMITED",
            ProtocolState::Done(v) => v.status().as_str(),
        };
        f.write_str(name)
    }
}

/// How a completed protocol run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOutcome {
    Verdict(Verdict),
    /// Quota exhausted; no verdict was reached.
    RateLimited { cooldown: Duration },
}

/// Outcome plus the states visited, in order.
#[derive(Debug, Clone)]
pub struct ProtocolRun {
    pub outcome: ProtocolOutcome,
    pub trace: Vec<ProtocolState>,
}

/// Everything the protocol needs to know about the chat page and its timing.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub chat_url: String,
    pub input_selector: String,
    pub deep_analysis_label: String,
    pub quota_notice: String,
    pub input_timeout: Duration,
    pub recovery_timeout: Duration,
    pub trigger_timeout: Duration,
    pub quota_probe: Duration,
    pub analysis_budget: Duration,
    pub analysis_min: Duration,
    pub analysis_poll: Duration,
    pub followup_settle: Duration,
    pub verdict_budget: Duration,
    pub marker_probe: Duration,
    pub input_delay_min: Duration,
    pub input_delay_max: Duration,
    pub default_cooldown: Duration,
}

impl ProtocolSettings {
    pub fn from_config(browser: &BrowserConfig, protocol: &ProtocolConfig) -> Self {
        let secs = Duration::from_secs;
        Self {
            chat_url: browser.chat_url.clone(),
            input_selector: browser.input_selector.clone(),
            deep_analysis_label: browser.deep_analysis_label.clone(),
            quota_notice: browser.quota_notice.clone(),
            input_timeout: secs(protocol.input_timeout_secs),
            recovery_timeout: secs(protocol.recovery_timeout_secs),
            trigger_timeout: secs(protocol.trigger_timeout_secs),
            quota_probe: secs(protocol.quota_probe_secs),
            analysis_budget: secs(protocol.analysis_budget_secs),
            analysis_min: secs(protocol.analysis_min_secs),
            analysis_poll: secs(protocol.analysis_poll_secs),
            followup_settle: secs(protocol.followup_settle_secs),
            verdict_budget: secs(protocol.verdict_budget_secs),
            marker_probe: secs(protocol.marker_probe_secs),
            input_delay_min: secs(protocol.input_delay_min_secs),
            input_delay_max: secs(protocol.input_delay_max_secs),
            default_cooldown: secs(protocol.default_cooldown_secs),
        }
    }

    fn input_delay(&self) -> Duration {
        let min = self.input_delay_min.as_millis() as u64;
        let max = (self.input_delay_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Drives one session through the protocol for one task at a time.
#[derive(Clone)]
pub struct ComparisonProtocol {
    settings: ProtocolSettings,
    label_matcher: Arc<dyn TextMatcher>,
    marker_matcher: Arc<dyn TextMatcher>,
}

impl ComparisonProtocol {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self {
            settings,
            label_matcher: Arc::new(BestMatcher::default()),
            marker_matcher: Arc::new(ContainsMatcher),
        }
    }

    /// Matcher used for the deep-analysis control and the quota notice.
    pub fn with_label_matcher(mut self, matcher: Arc<dyn TextMatcher>) -> Self {
        self.label_matcher = matcher;
        self
    }

    /// Matcher used for the verdict markers.
    pub fn with_marker_matcher(mut self, matcher: Arc<dyn TextMatcher>) -> Self {
        self.marker_matcher = matcher;
        self
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub async fn run(&self, session: &mut dyn SessionHandle, task: &Task) -> Result<ProtocolRun> {
        let mut machine = Machine::new(task);
        let s = &self.settings;

        // START -> AWAIT_INPUT_READY
        session.navigate(&s.chat_url).await?;
        machine.advance(ProtocolState::AwaitInputReady);
        let input = self.locate_input(session, task).await?;

        // AWAIT_INPUT_READY -> SUBMITTED_COMPARISON
        self.pace().await;
        let trigger = session
            .find_by_text(&s.deep_analysis_label, self.label_matcher.as_ref(), s.trigger_timeout)
            .await?;
        session.click(&trigger).await?;
        debug!(task_id = %task.id, label = ?trigger.text, "Deep analysis enabled");

        self.pace().await;
        let prompt = comparison_prompt(&task.competitor_url, &task.client_url);
        session.send_text(&input, &submission(&prompt)).await?;
        machine.advance(ProtocolState::SubmittedComparison);

        // SUBMITTED_COMPARISON -> RATE_LIMIT_CHECK
        machine.advance(ProtocolState::RateLimitCheck);
        if let Some(cooldown) = self.probe_quota(session).await? {
            warn!(task_id = %task.id, cooldown_secs = cooldown.as_secs(), "Quota notice detected");
            machine.advance(ProtocolState::RateLimited);
            return Ok(machine.finish(ProtocolOutcome::RateLimited { cooldown }));
        }

        // RATE_LIMIT_CHECK -> AWAIT_FOLLOWUP_READY
        self.await_analysis(session, task).await?;
        session.reload().await?;
        machine.advance(ProtocolState::AwaitFollowupReady);
        let input = self.locate_input(session, task).await?;

        // AWAIT_FOLLOWUP_READY -> SUBMITTED_FOLLOWUP
        tokio::time::sleep(s.followup_settle).await;
        self.pace().await;
        session.send_text(&input, &submission(FOLLOWUP_PROMPT)).await?;
        machine.advance(ProtocolState::SubmittedFollowup);

        // SUBMITTED_FOLLOWUP -> VERDICT_SCAN -> terminal
        machine.advance(ProtocolState::VerdictScan);
        let verdict = self.scan_verdict(session).await?;
        machine.advance(ProtocolState::Done(verdict));
        Ok(machine.finish(ProtocolOutcome::Verdict(verdict)))
    }

    /// Short randomized pause before input actions.
    async fn pace(&self) {
        let delay = self.settings.input_delay();
        if !delay.is_zero() {
            debug!(millis = delay.as_millis() as u64, "Input delay");
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for the text input; on a miss, reload once and wait longer.
    async fn locate_input(&self, session: &mut dyn SessionHandle, task: &Task) -> Result<ElementRef> {
        let s = &self.settings;
        match session.wait_for_element(&s.input_selector, s.input_timeout).await {
            Ok(el) => return Ok(el),
            Err(e) if e.is_missing_element() => {
                warn!(task_id = %task.id, error = %e, "Input not ready, reloading once");
            }
            Err(e) => return Err(e),
        }

        session.reload().await?;
        session
            .wait_for_element(&s.input_selector, s.recovery_timeout)
            .await
            .map_err(|e| {
                if e.is_missing_element() {
                    Error::UiElementNotFound(format!(
                        "input '{}' missing after reload: {}",
                        s.input_selector, e
                    ))
                } else {
                    e
                }
            })
    }

    /// `Some(cooldown)` when a quota notice is on the page.
    async fn probe_quota(&self, session: &mut dyn SessionHandle) -> Result<Option<Duration>> {
        let s = &self.settings;
        match session
            .find_by_text(&s.quota_notice, self.label_matcher.as_ref(), s.quota_probe)
            .await
        {
            Ok(notice) => {
                let cooldown = notice
                    .text
                    .as_deref()
                    .and_then(parse_cooldown)
                    .unwrap_or(s.default_cooldown);
                Ok(Some(cooldown))
            }
            Err(e) if e.is_missing_element() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll the page until its text stops changing (after the floor), never
    /// longer than the analysis budget.
    async fn await_analysis(&self, session: &mut dyn SessionHandle, task: &Task) -> Result<()> {
        let s = &self.settings;
        let start = Instant::now();
        let mut last: Option<String> = None;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= s.analysis_budget {
                info!(task_id = %task.id, secs = elapsed.as_secs(), "Analysis budget spent");
                return Ok(());
            }

            let text = session.page_text().await?;
            if elapsed >= s.analysis_min && last.as_deref() == Some(text.as_str()) {
                info!(task_id = %task.id, secs = elapsed.as_secs(), "Analysis output stable");
                return Ok(());
            }
            last = Some(text);

            let left = s.analysis_budget.saturating_sub(start.elapsed());
            tokio::time::sleep(s.analysis_poll.min(left)).await;
        }
    }

    /// Probe `{NO}` then `{YES}` in rounds until a marker shows up or the
    /// budget is spent. `{YES}` wins when both are present.
    async fn scan_verdict(&self, session: &mut dyn SessionHandle) -> Result<Verdict> {
        let s = &self.settings;
        let start = Instant::now();

        loop {
            let no = self.probe_marker(session, NO_MARKER).await?;
            let mut yes = self.probe_marker(session, YES_MARKER).await?;

            if no && !yes {
                // Confirm before committing a negative.
                yes = self.probe_marker(session, YES_MARKER).await?;
            }
            if yes || no {
                return Ok(Verdict::from_markers(yes, no));
            }

            let left = s.verdict_budget.saturating_sub(start.elapsed());
            if left.is_zero() {
                return Ok(Verdict::Unresolved);
            }
            tokio::time::sleep(SCAN_PAUSE.min(left)).await;
        }
    }

    async fn probe_marker(&self, session: &mut dyn SessionHandle, marker: &str) -> Result<bool> {
        match session
            .find_by_text(marker, self.marker_matcher.as_ref(), self.settings.marker_probe)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_element() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Settings with every wait at zero.
#[cfg(test)]
pub(crate) fn fast_settings() -> ProtocolSettings {
    let config = aimatch_core::Config::default();
    let mut s = ProtocolSettings::from_config(&config.browser, &config.protocol);
    for d in [
        &mut s.input_timeout,
        &mut s.recovery_timeout,
        &mut s.trigger_timeout,
        &mut s.quota_probe,
        &mut s.analysis_budget,
        &mut s.analysis_min,
        &mut s.analysis_poll,
        &mut s.followup_settle,
        &mut s.verdict_budget,
        &mut s.marker_probe,
        &mut s.input_delay_min,
        &mut s.input_delay_max,
    ] {
        *d = Duration::ZERO;
    }
    s
}

/// Tracks and logs state transitions for one run.
struct Machine<'a> {
    task: &'a Task,
    state: ProtocolState,
    trace: Vec<ProtocolState>,
}

impl<'a> Machine<'a> {
    fn new(task: &'a Task) -> Self {
        debug!(task_id = %task.id, state = %ProtocolState::Start, "Protocol started");
        Self {
            task,
            state: ProtocolState::Start,
            trace: vec![ProtocolState::Start],
        }
    }

    fn advance(&mut self, next: ProtocolState) {
        info!(task_id = %self.task.id, from = %self.state, to = %next, "Protocol transition");
        self.state = next;
        self.trace.push(next);
    }

    fn finish(self, outcome: ProtocolOutcome) -> ProtocolRun {
        ProtocolRun {
            outcome,
            trace: self.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimatch_browser::scripted::ScriptedProvider;
    use aimatch_browser::SessionProvider;
    use aimatch_core::{Config, TaskId};

    fn task(id: i64, url: &str, client_url: &str) -> Task {
        Task::new(TaskId(id), url, client_url)
    }

    async fn run_once(provider: &ScriptedProvider, t: &Task) -> Result<ProtocolRun> {
        let protocol = ComparisonProtocol::new(fast_settings());
        let mut session = provider.open().await?;
        protocol.run(session.as_mut(), t).await
    }

    #[tokio::test]
    async fn test_no_only_is_ignored() {
        let provider = ScriptedProvider::new();
        provider.reply("cat.html", "{NO}");

        let run = run_once(&provider, &task(7, "cat.html", "p1.html")).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Ignored));
        assert_eq!(
            run.trace,
            vec![
                ProtocolState::Start,
                ProtocolState::AwaitInputReady,
                ProtocolState::SubmittedComparison,
                ProtocolState::RateLimitCheck,
                ProtocolState::AwaitFollowupReady,
                ProtocolState::SubmittedFollowup,
                ProtocolState::VerdictScan,
                ProtocolState::Done(Verdict::Ignored),
            ]
        );

        let sent = provider.submitted();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("cat.html") && sent[0].contains("p1.html"));
        assert_eq!(sent[1], FOLLOWUP_PROMPT);
        assert_eq!(provider.clicks(), vec!["DeepSearch".to_string()]);
    }

    #[tokio::test]
    async fn test_both_markers_is_verified() {
        let provider = ScriptedProvider::new();
        provider.reply("p2.html", "{NO}\n{YES}");
        let run = run_once(&provider, &task(8, "p2.html", "c2.html")).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Verified));
    }

    #[tokio::test]
    async fn test_no_marker_is_unresolved() {
        let provider = ScriptedProvider::new();
        provider.reply("p3.html", "I cannot tell.");
        let run = run_once(&provider, &task(9, "p3.html", "c3.html")).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Unresolved));
    }

    #[tokio::test]
    async fn test_quota_notice_stops_before_followup() {
        let provider = ScriptedProvider::new();
        provider.reply("p4.html", "{YES}");
        provider.quota_notice(
            "p4.html",
            "You've reached your limit of 30 Grok DeepSearch questions per 2 hours for now. Please check back later to continue.",
            1,
        );

        let run = run_once(&provider, &task(10, "p4.html", "c4.html")).await.unwrap();
        assert_eq!(
            run.outcome,
            ProtocolOutcome::RateLimited {
                cooldown: Duration::from_secs(7200)
            }
        );
        assert_eq!(run.trace.last(), Some(&ProtocolState::RateLimited));
        assert_eq!(provider.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_input_recovery_reloads_once() {
        let provider = ScriptedProvider::new();
        provider.reply("p5.html", "{YES}");
        provider.fail_input(1);

        let run = run_once(&provider, &task(11, "p5.html", "c5.html")).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Verified));
        // One recovery reload plus the reload before the follow-up
        assert_eq!(provider.reloads(), 2);
    }

    #[tokio::test]
    async fn test_input_missing_twice_is_ui_error() {
        let provider = ScriptedProvider::new();
        provider.fail_input(2);
        let err = run_once(&provider, &task(12, "p6.html", "c6.html")).await.unwrap_err();
        assert!(matches!(err, Error::UiElementNotFound(_)));
        assert!(provider.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_trigger_is_ui_error() {
        let provider = ScriptedProvider::new();
        provider.set_controls(&["Think"]);
        let err = run_once(&provider, &task(13, "p7.html", "c7.html")).await.unwrap_err();
        assert!(matches!(err, Error::UiElementNotFound(_)));
    }

    #[tokio::test]
    async fn test_session_loss_propagates() {
        let provider = ScriptedProvider::new();
        provider.lose_session_on("p8.html");
        let err = run_once(&provider, &task(14, "p8.html", "c8.html")).await.unwrap_err();
        assert!(err.is_session_lost());
    }

    #[tokio::test]
    async fn test_marker_matcher_is_pluggable() {
        let provider = ScriptedProvider::new();
        provider.reply("p9.html", "Final ANSWER: {YES}");
        let t = task(15, "p9.html", "c9.html");

        let exact = ComparisonProtocol::new(fast_settings())
            .with_marker_matcher(Arc::new(aimatch_browser::ExactMatcher));
        let mut session = provider.open().await.unwrap();
        let run = exact.run(session.as_mut(), &t).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Unresolved));

        let run = run_once(&provider, &t).await.unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Verified));
    }

    #[tokio::test]
    async fn test_label_matcher_is_pluggable() {
        let provider = ScriptedProvider::new();
        provider.set_controls(&["Deep Search"]);
        let t = task(16, "p10.html", "c10.html");

        let exact = ComparisonProtocol::new(fast_settings())
            .with_label_matcher(Arc::new(aimatch_browser::ExactMatcher));
        let mut session = provider.open().await.unwrap();
        assert!(exact.run(session.as_mut(), &t).await.is_err());

        assert!(run_once(&provider, &t).await.is_ok());
    }

    fn timed(configure: impl FnOnce(&mut ProtocolSettings)) -> ComparisonProtocol {
        let mut settings = fast_settings();
        configure(&mut settings);
        ComparisonProtocol::new(settings)
    }

    #[tokio::test]
    async fn test_analysis_wait_ends_once_output_is_stable() {
        let provider = ScriptedProvider::new();
        let protocol = timed(|s| {
            s.analysis_budget = Duration::from_secs(5);
            s.analysis_min = Duration::from_millis(50);
            s.analysis_poll = Duration::from_millis(10);
        });
        let mut session = provider.open().await.unwrap();
        let t = task(20, "p20.html", "c20.html");

        let start = Instant::now();
        protocol.await_analysis(session.as_mut(), &t).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        assert!(provider.page_reads() >= 2);
    }

    #[tokio::test]
    async fn test_analysis_wait_is_capped_by_budget() {
        let provider = ScriptedProvider::new();
        provider.churn_page(true);
        let protocol = timed(|s| {
            s.analysis_budget = Duration::from_millis(150);
            s.analysis_poll = Duration::from_millis(10);
        });
        let mut session = provider.open().await.unwrap();
        let t = task(21, "p21.html", "c21.html");

        let start = Instant::now();
        protocol.await_analysis(session.as_mut(), &t).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(1));
        assert!(provider.page_reads() > 2);
    }

    #[tokio::test]
    async fn test_late_yes_found_in_second_round() {
        let provider = ScriptedProvider::new();
        // Misses both probes of the first round
        provider.reply_after("p22.html", "{YES}", 3);
        let protocol = timed(|s| s.verdict_budget = Duration::from_secs(2));
        let mut session = provider.open().await.unwrap();

        let start = Instant::now();
        let run = protocol
            .run(session.as_mut(), &task(22, "p22.html", "c22.html"))
            .await
            .unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Verified));
        assert!(start.elapsed() >= SCAN_PAUSE);
    }

    #[tokio::test]
    async fn test_late_no_found_in_second_round() {
        let provider = ScriptedProvider::new();
        provider.reply_after("p23.html", "{NO}", 3);
        let protocol = timed(|s| s.verdict_budget = Duration::from_secs(2));
        let mut session = provider.open().await.unwrap();

        let run = protocol
            .run(session.as_mut(), &task(23, "p23.html", "c23.html"))
            .await
            .unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Ignored));
    }

    #[tokio::test]
    async fn test_marker_after_budget_is_unresolved() {
        let provider = ScriptedProvider::new();
        provider.reply_after("p24.html", "{YES}", 1000);
        let protocol = timed(|s| s.verdict_budget = Duration::from_millis(300));
        let mut session = provider.open().await.unwrap();

        let start = Instant::now();
        let run = protocol
            .run(session.as_mut(), &task(24, "p24.html", "c24.html"))
            .await
            .unwrap();
        assert_eq!(run.outcome, ProtocolOutcome::Verdict(Verdict::Unresolved));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_settings_from_default_config() {
        let config = Config::default();
        let s = ProtocolSettings::from_config(&config.browser, &config.protocol);
        assert_eq!(s.analysis_budget, Duration::from_secs(126));
        assert_eq!(s.default_cooldown, Duration::from_secs(7200));
        assert_eq!(s.input_selector, "textarea[placeholder='Ask anything']");
        let delay = s.input_delay();
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(5));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ProtocolState::AwaitInputReady.to_string(), "AWAIT_INPUT_READY");
        assert_eq!(ProtocolState::Done(Verdict::Ignored).to_string(), "IGNORED");
    }
}
