use std::{sync::Arc, time::Duration};

use super::{
    conn::{
        pooled::PooledConnection,
        Connection,
        ConnectionGeneration,
        Connector,
        LoadBalancedGeneration,
        PendingConnection,
        StreamDescription,
        Transport,
    },
    worker::PoolGeneration,
};
use crate::{
    error::{Error, ErrorKind, Result},
    hello::{hello_command, HelloReply},
    options::{ServerAddress, TopologyOptions},
    runtime,
    sdam::HandshakePhase,
};

/// Contains the logic to establish a connection: opening the stream through the configured
/// [`Connector`] and running the initial handshake on it.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    connector: Arc<dyn Connector>,

    /// Bounds opening the stream and the initial handshake. `None` disables the bound.
    connect_timeout: Option<Duration>,

    load_balanced: bool,
}

impl std::fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("connect_timeout", &self.connect_timeout)
            .field("load_balanced", &self.load_balanced)
            .finish_non_exhaustive()
    }
}

impl ConnectionEstablisher {
    pub(crate) fn new(connector: Arc<dyn Connector>, options: &TopologyOptions) -> Self {
        Self {
            connector,
            connect_timeout: options.connect_timeout(),
            load_balanced: options.load_balanced(),
        }
    }

    async fn make_stream(&self, address: &ServerAddress) -> Result<Box<dyn Transport>> {
        runtime::maybe_timeout(self.connect_timeout, self.connector.dial(address)).await?
    }

    /// Run the initial hello on a freshly opened connection and cache what it reported.
    async fn handshake(&self, connection: &mut Connection) -> Result<HelloReply> {
        let command = hello_command(Some(self.load_balanced), None, None);
        let reply = connection.send_hello(&command, self.connect_timeout).await?;
        connection.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        Ok(reply)
    }

    /// Establishes a connection.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<PooledConnection, EstablishError> {
        let pool_gen = pending_connection.generation.clone();
        let address = pending_connection.address.clone();

        let stream = self
            .make_stream(&address)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_gen.clone()))?;

        let mut connection = PooledConnection::new(pending_connection, stream);
        let handshake_result = self.handshake(&mut connection).await;

        // If the handshake response had a `serviceId` field, this is a connection to a load
        // balancer and must derive its generation from the service_generations map.
        match (&pool_gen, connection.service_id()) {
            (PoolGeneration::Normal(_), _) => {}
            (PoolGeneration::LoadBalanced(gen_map), Some(service_id)) => {
                connection.generation = LoadBalancedGeneration {
                    generation: *gen_map.get(&service_id).unwrap_or(&0),
                    service_id,
                }
                .into();
            }
            (PoolGeneration::LoadBalanced(_), None) => {
                // If the handshake succeeded and there isn't a service id, return a special error.
                // If the handshake failed, just return the error from that instead.
                if handshake_result.is_ok() {
                    return Err(EstablishError::post_hello(
                        ErrorKind::IncompatibleServer {
                            message: "attempted to initialize in load balancing mode, but the \
                                      server does not support this mode"
                                .to_string(),
                        }
                        .into(),
                        connection.generation,
                    ));
                }
            }
        }

        handshake_result.map_err(|e| {
            if connection.stream_description().is_err() {
                EstablishError::pre_hello(e, pool_gen)
            } else {
                EstablishError::post_hello(e, connection.generation)
            }
        })?;

        Ok(connection)
    }

    /// Establishes a monitoring connection.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.make_stream(&address).await?;
        let mut connection = Connection::new_monitoring(address, stream, id);
        let hello_reply = self.handshake(&mut connection).await?;
        Ok((connection, hello_reply))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
