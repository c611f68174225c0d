use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use keel_core::{Deadline, KeelError, KeelResult};
use tracing::debug;

/// State that satisfied the predicate.
#[derive(Debug, Clone)]
pub struct Observed<S> {
    pub state: S,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Why a wait ended without the predicate holding.
#[derive(Debug, Clone)]
pub struct WaitFailure<S> {
    /// Last successfully observed state, if any observation succeeded.
    pub last: Option<S>,
    pub error: KeelError,
    pub polls: u32,
}

impl<S> WaitFailure<S> {
    pub fn into_error(self) -> KeelError { self.error }
}

impl<S: fmt::Display> fmt::Display for WaitFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last {
            Some(s) => write!(f, "{} (last observed: {})", self.error, s),
            None => write!(f, "{} (nothing observed)", self.error),
        }
    }
}

/// Poll `observe` until `predicate` holds or `deadline` passes.
///
/// The first evaluation happens immediately. Unavailable, Conflict, NotFound
/// and per-call Timeout observations are treated as "not yet" and polling continues;
/// any other error ends the wait. Cancelling the deadline interrupts the
/// current sleep rather than waiting out the interval.
pub async fn wait_until<S, F, Fut, P>(
    what: &str,
    mut observe: F,
    predicate: P,
    poll_interval: Duration,
    deadline: &Deadline,
) -> Result<Observed<S>, WaitFailure<S>>
where
    S: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = KeelResult<S>>,
    P: Fn(&S) -> bool,
{
    let t0 = Instant::now();
    let mut polls = 0u32;
    let mut last: Option<S> = None;
    let mut last_err: Option<KeelError> = None;
    loop {
        polls += 1;
        match deadline.run(what, observe()).await {
            Ok(state) => {
                if predicate(&state) {
                    debug!(what, polls, state = %state, "condition met");
                    return Ok(Observed { state, polls, elapsed: t0.elapsed() });
                }
                debug!(what, polls, state = %state, "not ready");
                last = Some(state);
                last_err = None;
            }
            Err(KeelError::Timeout(_)) if deadline.is_exceeded() => break,
            Err(e @ (KeelError::Unavailable(_) | KeelError::Conflict(_) | KeelError::NotFound(_) | KeelError::Timeout(_))) => {
                debug!(what, polls, error = %e, "transient observation error");
                last_err = Some(e);
            }
            Err(e) => return Err(WaitFailure { last, error: e, polls }),
        }
        if !deadline.sleep(poll_interval).await {
            break;
        }
    }
    let mut msg = match deadline.timeout_error(what) {
        KeelError::Timeout(m) => m,
        other => other.to_string(),
    };
    if let Some(s) = &last {
        msg = format!("{}; last observed: {}", msg, s);
    }
    if let Some(e) = &last_err {
        msg = format!("{}; last error: {}", msg, e);
    }
    Err(WaitFailure { last, error: KeelError::Timeout(msg), polls })
}
