use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    options::{ServerAddress, TopologyOptions},
    sdam::TopologyUpdater,
};

/// Contains the state for a given server in the topology.
///
/// A `Server` owns the connection pool for its address. Its monitor runs until the `Server` is
/// dropped or its topology shuts down.
#[derive(Debug)]
pub struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,

    /// Cancelled to stop the monitors watching this server.
    monitor_shutdown: CancellationToken,
}

impl Server {
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress, operation_count: u32) -> Self {
        Self {
            address: address.clone(),
            pool: ConnectionPool::new_mocked(address),
            operation_count: AtomicU32::new(operation_count),
            monitor_shutdown: CancellationToken::new(),
        }
    }

    /// Create a new reference counted `Server`, including its connection pool.
    pub(crate) fn new(
        address: ServerAddress,
        options: &TopologyOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        topology_id: ObjectId,
    ) -> Arc<Server> {
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                connection_establisher,
                topology_updater,
                topology_id,
                ConnectionPoolOptions::from_topology_options(options),
            ),
            address,
            operation_count: AtomicU32::new(0),
            monitor_shutdown: CancellationToken::new(),
        })
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The connection pool for this server.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The number of operations currently using this server.
    pub fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// A token that fires once this server stops being monitored.
    pub(crate) fn monitor_shutdown(&self) -> CancellationToken {
        self.monitor_shutdown.clone()
    }

    pub(crate) fn stop_monitoring(&self) {
        self.monitor_shutdown.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.monitor_shutdown.cancel();
    }
}
