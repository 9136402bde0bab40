pub(crate) mod util;

use std::time::Duration;

pub(crate) use self::util::{
    event_buffer::{Event, EventBuffer},
    mock::{MockConnector, MockServer},
};

/// How long tests wait for an event that is expected to arrive.
pub(crate) const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
