//! Bounded client-side polling of the payment status endpoint.
//!
//! [`StatusPoller`] is a pure state machine: it is fed events (start, a poll
//! response, a timer firing, a manual "check now") and answers with the next
//! [`PollAction`]. [`run_poller`] drives it against a [`StatusSource`] on a
//! single task, so polls are strictly sequential.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::constants::{DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL, SESSION_HEADER};
use crate::payment::{PaymentStatus, StatusResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Confirmed,
    TimedOut,
    Error(String),
}

impl PollerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::TimedOut | Self::Error(_))
    }
}

/// Result of one status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed,
    Pending,
    /// The request did not complete; still consumes the attempt.
    TransportError(String),
    /// The server reported an error status.
    ServerError(String),
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    /// Send one status request now.
    Issue,
    /// Arm a timer; call [`StatusPoller::poll_due`] when it fires.
    Schedule(Duration),
    /// Payment confirmed; navigate to the resource. Emitted once.
    Redirect,
    /// Attempts exhausted; offer the manual check.
    ShowManualCheck,
    ShowError(String),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

#[derive(Debug)]
pub struct StatusPoller {
    config: PollerConfig,
    state: PollerState,
    attempts: u32,
    in_flight: bool,
    scheduled: bool,
    /// Manual check requested while a poll was in flight.
    manual_deferred: bool,
}

impl StatusPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            state: PollerState::Idle,
            attempts: 0,
            in_flight: false,
            scheduled: false,
            manual_deferred: false,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// Attempts used since the last start or manual reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn start(&mut self) -> PollAction {
        if self.state != PollerState::Idle {
            return PollAction::None;
        }
        self.state = PollerState::Polling;
        self.attempts = 0;
        self.issue()
    }

    pub fn on_response(&mut self, outcome: PollOutcome) -> PollAction {
        if !self.in_flight || self.state != PollerState::Polling {
            return PollAction::None;
        }
        self.in_flight = false;

        match outcome {
            PollOutcome::Confirmed => {
                self.state = PollerState::Confirmed;
                self.manual_deferred = false;
                PollAction::Redirect
            }
            PollOutcome::ServerError(message) => {
                self.state = PollerState::Error(message.clone());
                self.manual_deferred = false;
                PollAction::ShowError(message)
            }
            PollOutcome::Pending | PollOutcome::TransportError(_) => {
                if let PollOutcome::TransportError(e) = &outcome {
                    tracing::debug!(attempt = self.attempts, error = %e, "status poll failed");
                }
                if self.manual_deferred {
                    self.manual_deferred = false;
                    self.attempts = 0;
                    return self.issue();
                }
                if self.attempts >= self.config.max_attempts {
                    self.state = PollerState::TimedOut;
                    return PollAction::ShowManualCheck;
                }
                self.scheduled = true;
                PollAction::Schedule(self.config.interval)
            }
        }
    }

    /// The scheduled timer fired. Stale timers are ignored.
    pub fn poll_due(&mut self) -> PollAction {
        if self.state != PollerState::Polling || !self.scheduled || self.in_flight {
            return PollAction::None;
        }
        self.scheduled = false;
        self.issue()
    }

    /// "Check now": reset the counter and poll immediately.
    ///
    /// While a poll is in flight the check is deferred until it returns.
    pub fn manual_check(&mut self) -> PollAction {
        if self.state == PollerState::Confirmed {
            return PollAction::None;
        }
        if self.in_flight {
            self.manual_deferred = true;
            return PollAction::None;
        }
        self.state = PollerState::Polling;
        self.attempts = 0;
        self.scheduled = false;
        self.issue()
    }

    fn issue(&mut self) -> PollAction {
        self.attempts += 1;
        self.in_flight = true;
        PollAction::Issue
    }
}

/// Where poll responses come from.
pub trait StatusSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = PollOutcome> + Send;
}

/// Polls the status endpoint over HTTP.
pub struct HttpStatusSource {
    http: reqwest::Client,
    url: String,
    session: Option<String>,
}

impl HttpStatusSource {
    /// `base` is the status endpoint URL, e.g. `https://host/x402/status`.
    /// `expected_amount` is the decimal amount shown to the payer.
    pub fn new(
        http: reqwest::Client,
        base: &str,
        reference: &str,
        expected_amount: Option<&str>,
    ) -> Self {
        let mut url = format!("{base}?reference={}", urlencoding::encode(reference));
        if let Some(amount) = expected_amount {
            url.push_str("&expectedAmount=");
            url.push_str(&urlencoding::encode(amount));
        }
        Self {
            http,
            url,
            session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> PollOutcome {
        let mut request = self.http.get(&self.url);
        if let Some(session) = &self.session {
            request = request.header(SESSION_HEADER, session);
        }
        let resp = match request.send().await {
            Ok(r) => r,
            Err(e) => return PollOutcome::TransportError(e.to_string()),
        };
        let status = resp.status();
        match resp.json::<StatusResponse>().await {
            Ok(body) => match body.status {
                PaymentStatus::Confirmed => PollOutcome::Confirmed,
                PaymentStatus::Pending => PollOutcome::Pending,
                PaymentStatus::Error => PollOutcome::ServerError(body.message),
            },
            Err(e) => PollOutcome::TransportError(format!("HTTP {status}: {e}")),
        }
    }
}

/// Drive a poller to completion.
///
/// Manual checks arrive on `manual`; dropping its sender lets the driver
/// return once polling stops. Returns the final state.
pub async fn run_poller<S: StatusSource>(
    source: &S,
    config: PollerConfig,
    mut manual: mpsc::Receiver<()>,
) -> PollerState {
    let mut poller = StatusPoller::new(config);
    let mut action = poller.start();

    loop {
        action = match action {
            PollAction::Issue => {
                let fetch = source.fetch();
                tokio::pin!(fetch);
                let outcome = loop {
                    tokio::select! {
                        biased;
                        outcome = &mut fetch => break outcome,
                        Some(()) = manual.recv() => {
                            poller.manual_check();
                        }
                    }
                };
                poller.on_response(outcome)
            }
            PollAction::Schedule(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => poller.poll_due(),
                    Some(()) = manual.recv() => poller.manual_check(),
                }
            }
            PollAction::Redirect => return PollerState::Confirmed,
            PollAction::ShowManualCheck | PollAction::ShowError(_) => match manual.recv().await {
                Some(()) => poller.manual_check(),
                None => return poller.state().clone(),
            },
            PollAction::None => return poller.state().clone(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller() -> StatusPoller {
        StatusPoller::new(PollerConfig::default())
    }

    #[test]
    fn start_issues_one_request() {
        let mut p = poller();
        assert_eq!(p.start(), PollAction::Issue);
        assert_eq!(p.state(), &PollerState::Polling);
        assert_eq!(p.attempts(), 1);
        assert_eq!(p.start(), PollAction::None);
    }

    #[test]
    fn pending_schedules_next_poll() {
        let mut p = poller();
        p.start();
        assert_eq!(
            p.on_response(PollOutcome::Pending),
            PollAction::Schedule(Duration::from_millis(3000))
        );
        assert_eq!(p.poll_due(), PollAction::Issue);
        assert_eq!(p.poll_due(), PollAction::None, "no second poll while one is in flight");
    }

    #[test]
    fn confirmed_redirects_exactly_once() {
        let mut p = poller();
        p.start();
        assert_eq!(p.on_response(PollOutcome::Confirmed), PollAction::Redirect);
        assert_eq!(p.on_response(PollOutcome::Confirmed), PollAction::None);
        assert_eq!(p.poll_due(), PollAction::None);
        assert_eq!(p.manual_check(), PollAction::None);
    }

    #[test]
    fn transport_errors_consume_attempts() {
        let mut p = poller();
        p.start();
        for _ in 1..40 {
            assert!(matches!(
                p.on_response(PollOutcome::TransportError("offline".into())),
                PollAction::Schedule(_)
            ));
            assert_eq!(p.poll_due(), PollAction::Issue);
        }
        assert_eq!(p.attempts(), 40);
        assert_eq!(
            p.on_response(PollOutcome::TransportError("offline".into())),
            PollAction::ShowManualCheck
        );
        assert_eq!(p.state(), &PollerState::TimedOut);
    }

    #[test]
    fn manual_check_resets_counter_after_timeout() {
        let mut p = StatusPoller::new(PollerConfig {
            interval: Duration::from_millis(10),
            max_attempts: 1,
        });
        p.start();
        assert_eq!(p.on_response(PollOutcome::Pending), PollAction::ShowManualCheck);
        assert_eq!(p.manual_check(), PollAction::Issue);
        assert_eq!(p.state(), &PollerState::Polling);
        assert_eq!(p.attempts(), 1);
    }

    #[test]
    fn manual_check_while_in_flight_is_deferred() {
        let mut p = poller();
        p.start();
        assert_eq!(p.manual_check(), PollAction::None);
        assert!(p.in_flight());
        // The deferred check fires as soon as the in-flight poll returns.
        assert_eq!(p.on_response(PollOutcome::Pending), PollAction::Issue);
        assert_eq!(p.attempts(), 1);
    }

    #[test]
    fn manual_check_cancels_scheduled_poll() {
        let mut p = poller();
        p.start();
        p.on_response(PollOutcome::Pending);
        assert_eq!(p.manual_check(), PollAction::Issue);
        assert_eq!(p.poll_due(), PollAction::None, "stale timer must not fire");
    }

    #[test]
    fn server_error_stops_polling() {
        let mut p = poller();
        p.start();
        assert_eq!(
            p.on_response(PollOutcome::ServerError("Payment reference not found.".into())),
            PollAction::ShowError("Payment reference not found.".into())
        );
        assert!(p.state().is_terminal());
        assert_eq!(p.poll_due(), PollAction::None);
    }
}
