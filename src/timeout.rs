//! Deadline bookkeeping for a single logical operation.
//!
//! A [`TimeoutContext`] is created once per operation (or once per cursor when a caller wants a
//! whole-lifetime budget) and consulted by every phase the operation passes through: server
//! selection, connection checkout, and socket I/O. Two strategies sit behind the same interface:
//!
//! * [`TimeoutContext::Csot`]: one absolute deadline. Every phase is bounded by the time left
//!   before the deadline, and running out in any phase produces the same
//!   [`ErrorKind::OperationTimeout`](crate::error::ErrorKind::OperationTimeout).
//! * [`TimeoutContext::Legacy`]: each phase has its own independent timeout and raises its own
//!   phase-specific error.

use std::time::{Duration, Instant};

use crate::{
    error::{Error, Result},
    options::TopologyOptions,
};

/// The timeout strategy for one logical operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TimeoutContext {
    /// A single deadline shared by every phase.
    Csot(CsotTimeoutContext),

    /// Independent per-phase timeouts.
    Legacy(LegacyTimeoutContext),
}

/// State for the shared-deadline strategy.
#[derive(Clone, Debug)]
pub struct CsotTimeoutContext {
    /// The configured budget. A zero budget means the operation has no deadline.
    timeout: Duration,

    /// `None` when the budget is unlimited or the context has been cleared.
    deadline: Option<Instant>,

    server_selection_timeout: Duration,

    min_round_trip_time: Duration,
}

/// State for the independent-timeouts strategy.
#[derive(Clone, Debug, Default)]
pub struct LegacyTimeoutContext {
    server_selection_timeout: Duration,
    wait_queue_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    max_time: Option<Duration>,
}

impl TimeoutContext {
    /// Build a context from the topology's options. A configured `timeout` selects the shared
    /// deadline strategy.
    pub fn new(options: &TopologyOptions) -> Self {
        Self::with_timeout(options, options.timeout)
    }

    /// Build a context using `timeout` as the operation's overall budget, falling back to the
    /// independent-timeouts strategy when it is `None`.
    pub fn with_timeout(options: &TopologyOptions, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self::csot(timeout, options.server_selection_timeout()),
            None => Self::legacy(
                options.server_selection_timeout(),
                options.wait_queue_timeout,
                options.socket_timeout,
                None,
            ),
        }
    }

    /// A shared-deadline context whose clock starts now.
    pub fn csot(timeout: Duration, server_selection_timeout: Duration) -> Self {
        Self::Csot(CsotTimeoutContext {
            timeout,
            deadline: deadline_after(timeout),
            server_selection_timeout,
            min_round_trip_time: Duration::ZERO,
        })
    }

    /// An independent-timeouts context. `max_time` is passed through to the server as-is.
    pub fn legacy(
        server_selection_timeout: Duration,
        wait_queue_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
        max_time: Option<Duration>,
    ) -> Self {
        let nonzero = |d: Option<Duration>| d.filter(|d| !d.is_zero());
        Self::Legacy(LegacyTimeoutContext {
            server_selection_timeout,
            wait_queue_timeout: nonzero(wait_queue_timeout),
            socket_timeout: nonzero(socket_timeout),
            max_time,
        })
    }

    /// Whether this context uses a single shared deadline.
    pub fn csot_enabled(&self) -> bool {
        matches!(self, Self::Csot(_))
    }

    /// The time left before the deadline, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Csot(csot) => csot
                .deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
            Self::Legacy(_) => None,
        }
    }

    /// The time left before the deadline, or an operation timeout error if it has passed.
    /// Contexts without a deadline return `Ok(None)`.
    pub fn remaining_time_or_error(&self) -> Result<Option<Duration>> {
        match self.remaining() {
            Some(remaining) if remaining.is_zero() => {
                Err(Error::operation_timeout("the operation's deadline has passed"))
            }
            other => Ok(other),
        }
    }

    /// How long server selection may wait.
    pub fn server_selection_timeout(&self) -> Duration {
        match self {
            Self::Csot(csot) => match self.remaining() {
                Some(remaining) => remaining.min(csot.server_selection_timeout),
                None => csot.server_selection_timeout,
            },
            Self::Legacy(legacy) => legacy.server_selection_timeout,
        }
    }

    /// How long a connection checkout may wait, if bounded.
    pub fn connection_checkout_timeout(&self) -> Option<Duration> {
        match self {
            Self::Csot(_) => self.remaining(),
            Self::Legacy(legacy) => legacy.wait_queue_timeout,
        }
    }

    /// The bound for one socket write.
    pub fn timeout_for_socket_write(&self) -> Result<Option<Duration>> {
        match self {
            Self::Csot(_) => self.remaining_time_or_error(),
            Self::Legacy(legacy) => Ok(legacy.socket_timeout),
        }
    }

    /// The bound for one socket read.
    pub fn timeout_for_socket_read(&self) -> Result<Option<Duration>> {
        self.timeout_for_socket_write()
    }

    /// The `maxTimeMS` value to attach to the next command, in milliseconds.
    ///
    /// With a shared deadline this is the remaining budget less the selected server's minimum
    /// round trip time; if nothing would be left, the command cannot possibly complete in time
    /// and an operation timeout error is returned instead.
    pub fn max_time_ms(&self) -> Result<Option<u64>> {
        match self {
            Self::Csot(csot) => match self.remaining() {
                Some(remaining) => {
                    if remaining <= csot.min_round_trip_time {
                        return Err(Error::operation_timeout(format!(
                            "remaining time {}ms is not enough to cover the minimum round trip \
                             time of {}ms",
                            remaining.as_millis(),
                            csot.min_round_trip_time.as_millis()
                        )));
                    }
                    let budget = remaining - csot.min_round_trip_time;
                    Ok(Some(u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)))
                }
                None => Ok(None),
            },
            Self::Legacy(legacy) => Ok(legacy
                .max_time
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))),
        }
    }

    /// Record the minimum round trip time of the server the operation is about to run on.
    pub fn set_min_round_trip_time(&mut self, min_round_trip_time: Option<Duration>) {
        if let Self::Csot(csot) = self {
            csot.min_round_trip_time = min_round_trip_time.unwrap_or(Duration::ZERO);
        }
    }

    pub(crate) fn min_round_trip_time(&self) -> Duration {
        match self {
            Self::Csot(csot) => csot.min_round_trip_time,
            Self::Legacy(_) => Duration::ZERO,
        }
    }

    /// Restart the deadline from now. Used by callers that budget each batch of a multi-batch
    /// operation separately but want to reuse one context.
    pub fn refresh(&mut self) {
        if let Self::Csot(csot) = self {
            csot.deadline = deadline_after(csot.timeout);
        }
    }

    /// A copy of this context with a freshly started deadline.
    pub fn refreshed(&self) -> Self {
        let mut refreshed = self.clone();
        refreshed.refresh();
        refreshed
    }

    /// Release the deadline once the operation has completed. Until the next
    /// [`refresh`](Self::refresh), phases are bounded only by their own ceilings.
    pub fn clear(&mut self) {
        if let Self::Csot(csot) = self {
            csot.deadline = None;
        }
    }

    /// Convert an expiry observed in one phase into the error this strategy reports. With a
    /// shared deadline every phase reports an operation timeout wrapping the phase's error;
    /// otherwise the phase error is returned unchanged.
    pub(crate) fn timeout_error(&self, phase_error: Error) -> Error {
        match self {
            Self::Csot(_) => Error::operation_timeout(phase_error.kind.to_string())
                .with_source(phase_error),
            Self::Legacy(_) => phase_error,
        }
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        return None;
    }
    Instant::now().checked_add(timeout)
}
