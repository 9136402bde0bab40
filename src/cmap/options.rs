use std::time::Duration;

use crate::{
    event::{cmap::CmapEvent, EventHandler},
    options::TopologyOptions,
};

/// Contains the options for creating a connection pool.
#[derive(Clone, Default, Debug)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool may manage at once. Zero means there is
    /// no limit.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections the pool keeps open while it is ready.
    pub(crate) min_pool_size: Option<u32>,

    /// The maximum number of connections that may be establishing at once.
    pub(crate) max_connecting: Option<u32>,

    /// Connections idle for longer than this are closed.
    pub(crate) max_idle_time: Option<Duration>,

    /// Whether the pool is connected to a load balancer.
    pub(crate) load_balanced: bool,

    /// The handler for CMAP events.
    pub(crate) cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// Interval between background maintenance runs.
    pub(crate) maintenance_frequency: Option<Duration>,

    /// Whether the pool starts out ready instead of waiting for a monitor to mark it so.
    #[cfg(test)]
    pub(crate) ready: bool,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_topology_options(options: &TopologyOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            max_idle_time: options.max_idle_time,
            load_balanced: options.load_balanced(),
            cmap_event_handler: options.cmap_event_handler.clone(),
            maintenance_frequency: options.maintenance_frequency,
            #[cfg(test)]
            ready: false,
        }
    }
}
