//! Reset-policy arithmetic shared by the read-only status path and the atomic
//! increment, so both always agree on what "now" looks like for a counter.

use chrono::{DateTime, Datelike, Duration, Months, Utc};

use super::catalog::{PeriodLength, ResetPolicy};
use super::models::{DenialReason, UsageCounter};

/// Counter state as of `now`, with the reset policy applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub counter: UsageCounter,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Evaluation {
    pub fn can_use_now(&self) -> bool {
        self.remaining > 0 && self.cooldown_until.is_none()
    }

    pub fn denial(&self) -> Option<DenialReason> {
        if self.cooldown_until.is_some() {
            Some(DenialReason::CooldownActive)
        } else if self.remaining == 0 {
            Some(DenialReason::QuotaExhausted)
        } else {
            None
        }
    }
}

/// Zero the count and move the window if the current one has elapsed.
pub fn roll_forward(
    counter: &UsageCounter,
    reset: ResetPolicy,
    now: DateTime<Utc>,
) -> UsageCounter {
    let mut next = counter.clone();
    match reset {
        ResetPolicy::Rolling { .. } => {
            if let (Some(last), Some(window)) = (counter.last_used_at, reset.rolling_window()) {
                if elapsed(last, window, now) && counter.count > 0 {
                    next.count = 0;
                    next.window_start = now;
                }
            }
        }
        ResetPolicy::Calendar { period } => {
            let start = period_start_at(counter.window_start, period, now);
            if start != counter.window_start {
                next.count = 0;
                next.window_start = start;
            }
        }
    }
    next
}

pub fn evaluate(
    counter: &UsageCounter,
    limit: u32,
    reset: ResetPolicy,
    now: DateTime<Utc>,
) -> Evaluation {
    let counter = roll_forward(counter, reset, now);
    let remaining = limit.saturating_sub(counter.count);
    let (reset_at, cooldown_until) = match reset {
        ResetPolicy::Rolling { .. } => {
            let until = counter
                .last_used_at
                .zip(reset.rolling_window())
                .and_then(|(last, window)| last.checked_add_signed(window))
                .filter(|until| now < *until);
            (until, until)
        }
        ResetPolicy::Calendar { period } => (advance(counter.window_start, period, 1), None),
    };
    Evaluation {
        counter,
        remaining,
        reset_at,
        cooldown_until,
    }
}

/// The check-then-act step of an increment. Returns whether the use was
/// admitted and the counter to persist.
pub fn admit(
    counter: &UsageCounter,
    limit: u32,
    reset: ResetPolicy,
    now: DateTime<Utc>,
) -> (bool, UsageCounter) {
    let evaluation = evaluate(counter, limit, reset, now);
    let mut next = evaluation.counter.clone();
    if !evaluation.can_use_now() {
        return (false, next);
    }
    next.count = next.count.saturating_add(1);
    next.last_used_at = Some(now);
    (true, next)
}

fn elapsed(last: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    last.checked_add_signed(window)
        .map_or(false, |until| now >= until)
}

pub fn advance(start: DateTime<Utc>, period: PeriodLength, steps: u32) -> Option<DateTime<Utc>> {
    match period {
        PeriodLength::Days(days) => {
            let days = i64::from(days).checked_mul(i64::from(steps))?;
            start.checked_add_signed(Duration::try_days(days)?)
        }
        PeriodLength::Months(months) => {
            start.checked_add_months(Months::new(months.checked_mul(steps)?))
        }
    }
}

/// Start of the period containing `now`, counting whole periods from `anchor`.
pub fn period_start_at(
    anchor: DateTime<Utc>,
    period: PeriodLength,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if now <= anchor || period.is_empty() {
        return anchor;
    }
    let mut steps = estimate_steps(anchor, period, now);
    while steps > 0 && advance(anchor, period, steps).map_or(true, |start| start > now) {
        steps -= 1;
    }
    while advance(anchor, period, steps.saturating_add(1)).map_or(false, |next| next <= now) {
        steps += 1;
    }
    advance(anchor, period, steps).unwrap_or(anchor)
}

fn estimate_steps(anchor: DateTime<Utc>, period: PeriodLength, now: DateTime<Utc>) -> u32 {
    match period {
        PeriodLength::Days(days) => {
            let whole_days = (now - anchor).num_days().max(0);
            u32::try_from(whole_days / i64::from(days.max(1))).unwrap_or(u32::MAX)
        }
        PeriodLength::Months(months) => {
            let diff =
                (now.year() - anchor.year()) * 12 + now.month() as i32 - anchor.month() as i32;
            u32::try_from(diff.max(0)).unwrap_or(0) / months.max(1)
        }
    }
}
