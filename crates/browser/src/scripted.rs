//! In-memory sessions with scripted page content.
//!
//! A conversation is a list of text lines. `navigate` starts a new one,
//! `reload` keeps it. The first submission after `navigate` is treated as the
//! comparison prompt and selects the script rule whose needle it contains;
//! later submissions are follow-ups and append the rule's reply.

use crate::{ElementRef, SessionHandle, SessionProvider, TextMatcher};
use aimatch_core::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const INPUT_REF: &str = "input";

#[derive(Debug, Clone, Default)]
struct Rule {
    needle: String,
    reply: String,
    quota_notices: usize,
    quota_text: String,
    lose_session: bool,
    reply_after: usize,
}

#[derive(Debug, Default)]
struct ScriptState {
    controls: Vec<String>,
    rules: Vec<Rule>,
    input_failures: usize,
    open_failures: usize,
    opens: usize,
    closes: usize,
    navigations: usize,
    reloads: usize,
    clicks: Vec<String>,
    submitted: Vec<String>,
    page_reads: usize,
    churn: bool,
}

/// Provider whose sessions replay a shared script. Clones share state.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        let state = ScriptState {
            controls: vec!["Think".to_string(), "DeepSearch".to_string()],
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        lock(&self.state)
    }

    fn rule_mut(&self, needle: &str, f: impl FnOnce(&mut Rule)) {
        let mut state = self.state();
        match state.rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => f(rule),
            None => {
                let mut rule = Rule {
                    needle: needle.to_string(),
                    ..Default::default()
                };
                f(&mut rule);
                state.rules.push(rule);
            }
        }
    }

    /// Replace the clickable control labels shown on every page.
    pub fn set_controls(&self, labels: &[&str]) {
        self.state().controls = labels.iter().map(|s| s.to_string()).collect();
    }

    /// Text shown after the follow-up for comparisons mentioning `needle`.
    pub fn reply(&self, needle: &str, text: &str) {
        self.rule_mut(needle, |r| r.reply = text.to_string());
    }

    /// Like `reply`, but the text only renders after `probes` element lookups
    /// following the follow-up.
    pub fn reply_after(&self, needle: &str, text: &str, probes: usize) {
        self.rule_mut(needle, |r| {
            r.reply = text.to_string();
            r.reply_after = probes;
        });
    }

    /// While on, every `page_text` read sees a new line, as if output is
    /// still streaming.
    pub fn churn_page(&self, on: bool) {
        self.state().churn = on;
    }

    /// Show `notice` after the next `times` comparisons mentioning `needle`.
    pub fn quota_notice(&self, needle: &str, notice: &str, times: usize) {
        self.rule_mut(needle, |r| {
            r.quota_notices = times;
            r.quota_text = notice.to_string();
        });
    }

    /// Drop the connection when a comparison mentioning `needle` is sent.
    /// Fires once.
    pub fn lose_session_on(&self, needle: &str) {
        self.rule_mut(needle, |r| r.lose_session = true);
    }

    /// The next `times` input-control waits time out.
    pub fn fail_input(&self, times: usize) {
        self.state().input_failures = times;
    }

    /// The next `times` calls to `open` fail.
    pub fn fail_opens(&self, times: usize) {
        self.state().open_failures = times;
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn navigations(&self) -> usize {
        self.state().navigations
    }

    pub fn reloads(&self) -> usize {
        self.state().reloads
    }

    pub fn page_reads(&self) -> usize {
        self.state().page_reads
    }

    /// Labels of every control clicked so far.
    pub fn clicks(&self) -> Vec<String> {
        self.state().clicks.clone()
    }

    /// Every text submitted so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.state().submitted.clone()
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn open(&self) -> Result<Box<dyn SessionHandle>> {
        let mut state = self.state();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(Error::Browser("scripted browser failed to launch".to_string()));
        }
        state.opens += 1;
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
            lines: Vec::new(),
            rule: None,
            pending: None,
            comparison_sent: false,
            dead: false,
            closed: false,
        }))
    }
}

/// One scripted session. Fails every call once its connection is lost.
pub struct ScriptedSession {
    state: Arc<Mutex<ScriptState>>,
    lines: Vec<String>,
    rule: Option<Rule>,
    /// Reply lines still waiting on this many lookups.
    pending: Option<(usize, Vec<String>)>,
    comparison_sent: bool,
    dead: bool,
    closed: bool,
}

impl ScriptedSession {
    fn alive(&self) -> Result<()> {
        if self.dead || self.closed {
            return Err(Error::Browser(
                "CDP WebSocket closed, cannot send 'Runtime.evaluate'".to_string(),
            ));
        }
        Ok(())
    }

    fn render_pending(&mut self) {
        let Some((left, lines)) = self.pending.as_mut() else {
            return;
        };
        *left = left.saturating_sub(1);
        if *left == 0 {
            let lines = std::mem::take(lines);
            self.pending = None;
            self.lines.extend(lines);
        }
    }

    fn candidates(&self) -> Vec<(String, String)> {
        let state = lock(&self.state);
        let controls = state
            .controls
            .iter()
            .map(|c| (format!("control:{}", c), c.clone()));
        let lines = self
            .lines
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("line:{}", i), l.clone()));
        controls.chain(lines).collect()
    }

    fn submit_comparison(&mut self, text: &str) -> Result<()> {
        self.comparison_sent = true;
        let mut state = lock(&self.state);
        let rule = state
            .rules
            .iter_mut()
            .find(|r| !r.needle.is_empty() && text.contains(&r.needle));

        let Some(rule) = rule else {
            self.rule = None;
            self.lines.push("Analyzing...".to_string());
            return Ok(());
        };

        if rule.lose_session {
            rule.lose_session = false;
            self.dead = true;
            return Err(Error::Browser("CDP response channel closed".to_string()));
        }

        self.lines.push("Analyzing...".to_string());
        if rule.quota_notices > 0 {
            rule.quota_notices -= 1;
            self.lines.push(rule.quota_text.clone());
        }
        self.rule = Some(rule.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for ScriptedSession {
    async fn navigate(&mut self, _url: &str) -> Result<()> {
        self.alive()?;
        self.lines.clear();
        self.rule = None;
        self.pending = None;
        self.comparison_sent = false;
        lock(&self.state).navigations += 1;
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        self.alive()?;
        lock(&self.state).reloads += 1;
        Ok(())
    }

    async fn wait_for_element(&mut self, selector: &str, _timeout: Duration) -> Result<ElementRef> {
        self.alive()?;
        let mut state = lock(&self.state);
        if state.input_failures > 0 {
            state.input_failures -= 1;
            return Err(Error::Timeout(format!("'{}' not present", selector)));
        }
        Ok(ElementRef {
            ref_id: INPUT_REF.to_string(),
            text: None,
        })
    }

    async fn find_by_text(
        &mut self,
        text: &str,
        matcher: &dyn TextMatcher,
        _timeout: Duration,
    ) -> Result<ElementRef> {
        self.alive()?;
        self.render_pending();
        let (refs, texts): (Vec<String>, Vec<String>) = self.candidates().into_iter().unzip();
        let limit = matcher.candidate_limit(text);
        let eligible: Vec<String> = texts
            .iter()
            .map(|t| {
                if t.chars().count() <= limit {
                    t.clone()
                } else {
                    String::new()
                }
            })
            .collect();

        match matcher.best(text, &eligible) {
            Some((idx, matched)) => Ok(ElementRef {
                ref_id: refs[idx].clone(),
                text: Some(matched.to_string()),
            }),
            None => Err(Error::UiElementNotFound(format!("no element matching '{}'", text))),
        }
    }

    async fn click(&mut self, element: &ElementRef) -> Result<()> {
        self.alive()?;
        let label = element.text.clone().unwrap_or_else(|| element.ref_id.clone());
        lock(&self.state).clicks.push(label);
        Ok(())
    }

    async fn send_text(&mut self, element: &ElementRef, text: &str) -> Result<()> {
        self.alive()?;
        if element.ref_id != INPUT_REF {
            return Err(Error::Browser(format!("element {} is not editable", element.ref_id)));
        }
        let body = text.trim_end_matches('\n').to_string();
        lock(&self.state).submitted.push(body.clone());

        if !self.comparison_sent {
            return self.submit_comparison(&body);
        }
        if let Some(rule) = &self.rule {
            let reply: Vec<String> = rule.reply.lines().map(|l| l.to_string()).collect();
            if rule.reply_after > 0 {
                self.pending = Some((rule.reply_after, reply));
            } else {
                self.lines.extend(reply);
            }
        }
        Ok(())
    }

    async fn page_text(&mut self) -> Result<String> {
        self.alive()?;
        let mut state = lock(&self.state);
        state.page_reads += 1;
        if state.churn {
            self.lines.push(format!("streaming {}", state.page_reads));
        }
        let mut parts = state.controls.clone();
        parts.extend(self.lines.iter().cloned());
        Ok(parts.join("\n"))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            lock(&self.state).closes += 1;
        }
        Ok(())
    }
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
