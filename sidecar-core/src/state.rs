//! State resolver: a pure function from {now, connectivity, signals,
//! queue snapshot, metrics} to a single operational state.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct Signals {
    pub auth_required_until: i64,
    pub challenge_until: i64,
    pub rate_limited_until: i64,
    pub degraded_until: i64,
}

impl Signals {
    /// The cooldown gate: the max of the four deadlines.
    pub fn gate(&self) -> i64 {
        self.auth_required_until
            .max(self.challenge_until)
            .max(self.rate_limited_until)
            .max(self.degraded_until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    AuthRequired,
    Challenge,
    RateLimited,
    Degraded,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateResolution {
    pub state: OperationalState,
    pub reasons: Vec<&'static str>,
    pub queue_depth: usize,
    pub error_rate: f64,
}

pub struct StateInput {
    pub now: i64,
    pub connectivity_ok: bool,
    pub signals: Signals,
    pub queue_depth: usize,
    pub error_rate: f64,
}

/// Resolve the operational state, honoring the fixed precedence
/// `auth_required > challenge > rate_limited > degraded > ready`.
pub fn resolve_state(input: &StateInput) -> StateResolution {
    let mut reasons = Vec::new();
    let auth_active = input.signals.auth_required_until > input.now;
    let challenge_active = input.signals.challenge_until > input.now;
    let rate_limited_active = input.signals.rate_limited_until > input.now;
    let degraded_cooldown_active = input.signals.degraded_until > input.now;
    let connectivity_failed = !input.connectivity_ok;

    if auth_active {
        reasons.push("auth_required_signal");
    }
    if challenge_active {
        reasons.push("challenge_signal");
    }
    if rate_limited_active {
        reasons.push("rate_limited_signal");
    }
    if connectivity_failed {
        reasons.push("connectivity_check_failed");
    }
    if degraded_cooldown_active {
        reasons.push("degraded_cooldown");
    }

    let state = if auth_active {
        OperationalState::AuthRequired
    } else if challenge_active {
        OperationalState::Challenge
    } else if rate_limited_active {
        OperationalState::RateLimited
    } else if connectivity_failed || degraded_cooldown_active {
        OperationalState::Degraded
    } else {
        OperationalState::Ready
    };

    StateResolution {
        state,
        reasons,
        queue_depth: input.queue_depth,
        error_rate: input.error_rate,
    }
}
