pub(crate) mod pooled;
mod stream_description;

use std::{
    fmt,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub(crate) use self::stream_description::StreamDescription;
use super::worker::PoolGeneration;
use crate::{
    bson::{oid::ObjectId, Document},
    error::{Error, Result},
    event::cmap::{CmapEventEmitter, ConnectionCreatedEvent},
    hello::{parse_hello_reply, HelloCommand, HelloReply},
    options::ServerAddress,
    runtime,
    timeout::TimeoutContext,
};

/// Opens byte streams to servers.
///
/// The engine never encodes database commands itself: it asks a `Connector` for a stream and then
/// drives the stream through the [`Transport`] methods.
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream to the given server.
    fn dial<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<Box<dyn Transport>>>;
}

/// One open stream to a server.
pub trait Transport: Send + 'static {
    /// Run a `hello` (or legacy hello) command and return the server's raw reply.
    fn hello<'a>(&'a mut self, command: &'a HelloCommand) -> BoxFuture<'a, Result<Document>>;

    /// Write one already-encoded message to the stream.
    fn write_message<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Read the next complete message from the stream.
    fn read_message(&mut self) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A client-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection. Available on server
    /// versions 4.2+.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around a [`Transport`] that tracks the state the pool and the monitors need.
pub struct Connection {
    /// Client-generated ID for the connection.
    pub(crate) id: u32,

    /// Server-generated ID for the connection.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    pub(crate) time_created: Instant,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Whether or not a command is currently being run on this connection. This is set to `true`
    /// right before sending bytes to the server and set back to `false` once a full response has
    /// been read.
    command_executing: bool,

    /// Stores a network error encountered while reading or writing. Errors from the server or
    /// from deserializing replies are not stored, since they leave the stream usable.
    error: Option<Error>,

    /// Fired when the pool that owns this connection is cleared with interruption.
    interrupt: CancellationToken,

    stream: Option<Box<dyn Transport>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("address", &self.address)
            .field("command_executing", &self.command_executing)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(
        address: ServerAddress,
        stream: Box<dyn Transport>,
        id: u32,
        time_created: Instant,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            time_created,
            stream_description: None,
            command_executing: false,
            error: None,
            interrupt,
            stream: Some(stream),
        }
    }

    /// Create a connection intended for monitoring purposes. Monitoring connections are never
    /// pooled and are never interrupted.
    pub(crate) fn new_monitoring(
        address: ServerAddress,
        stream: Box<dyn Transport>,
        id: u32,
    ) -> Self {
        Self::new(address, stream, id, Instant::now(), CancellationToken::new())
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Helper to mark that the connection has been checked out, runs a command, etc.
    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Whether this connection has encountered a network error.
    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Get the stream description from the handshake, returning an error if it hasn't been set.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    /// Run a hello (or legacy hello) command on this connection, bounding the whole round trip
    /// by `timeout` if one is given.
    pub(crate) async fn send_hello(
        &mut self,
        command: &HelloCommand,
        timeout: Option<Duration>,
    ) -> Result<HelloReply> {
        let mut stream = self.begin_io()?;
        let result = drive(&self.interrupt, timeout, stream.hello(command)).await;
        self.finish_io(stream, &result);

        let reply = parse_hello_reply(self.address.clone(), result?)?;
        self.server_id = reply.command_response.connection_id;
        Ok(reply)
    }

    /// Write an already-encoded message and read the server's reply, honouring the deadlines of
    /// the given timeout context.
    pub(crate) async fn send_message(
        &mut self,
        message: &[u8],
        timeout_context: &TimeoutContext,
    ) -> Result<Vec<u8>> {
        let write_timeout = timeout_context.timeout_for_socket_write()?;
        // A send that cannot complete before the deadline is not attempted.
        timeout_context.max_time_ms()?;

        let mut stream = self.begin_io()?;
        let result = drive(&self.interrupt, write_timeout, stream.write_message(message)).await;
        self.finish_io(stream, &result);
        result.map_err(|e| timeout_context_error(timeout_context, e))?;

        let read_timeout = timeout_context.timeout_for_socket_read()?;
        let mut stream = self.begin_io()?;
        let result = drive(&self.interrupt, read_timeout, stream.read_message()).await;
        self.finish_io(stream, &result);
        result.map_err(|e| timeout_context_error(timeout_context, e))
    }

    /// Take the stream out for one transport call and mark the connection as executing.
    ///
    /// If the call's future is dropped before `finish_io` runs, the stream is lost and the
    /// connection stays marked as executing, so the pool closes it on check-in.
    fn begin_io(&mut self) -> Result<Box<dyn Transport>> {
        if let Some(ref error) = self.error {
            return Err(Error::internal(format!(
                "attempted to use connection {} after it failed with: {error}",
                self.id
            )));
        }
        let stream = self.stream.take().ok_or_else(|| {
            Error::internal(format!("connection {} has no stream", self.id))
        })?;
        self.command_executing = true;
        Ok(stream)
    }

    /// Put the stream back after a transport call, recording any network error it failed with.
    fn finish_io<T>(&mut self, stream: Box<dyn Transport>, result: &Result<T>) {
        self.stream = Some(stream);
        match result {
            Err(e) if e.is_network_error() => self.error = Some(e.clone()),
            _ => self.command_executing = false,
        }
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to
    /// the pool.
    pub(crate) fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            command_executing: self.command_executing,
            error: self.error.take(),
            interrupt: self.interrupt.clone(),
            stream: self.stream.take(),
        }
    }
}

/// Run one transport future, racing it against the pool's interrupt signal and the given timeout.
async fn drive<T>(
    interrupt: &CancellationToken,
    timeout: Option<Duration>,
    io: BoxFuture<'_, Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => Err(Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection interrupted because its pool was cleared",
        ))),
        result = runtime::maybe_timeout(timeout, io) => result.and_then(|r| r),
    }
}

fn timeout_context_error(timeout_context: &TimeoutContext, error: Error) -> Error {
    if error.is_network_timeout() {
        timeout_context.timeout_error(error)
    } else {
        error
    }
}

/// Struct encapsulating the information needed to establish a `Connection`.
///
/// Creating a `PendingConnection` contributes towards the total connection count of a pool, despite
/// not actually making a TCP connection to the pool's endpoint. It stands for a connection
/// that has not been opened yet.
#[derive_where(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    #[derive_where(skip)]
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
    pub(crate) interrupt: CancellationToken,
}

impl PendingConnection {
    /// Helper to create a `ConnectionCreatedEvent` for the connection.
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn into_connection(self, stream: Box<dyn Transport>) -> Connection {
        Connection::new(
            self.address,
            stream,
            self.id,
            self.time_created,
            self.interrupt,
        )
    }
}

/// The generation a connection was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionGeneration {
    Normal(u32),
    LoadBalanced(Option<LoadBalancedGeneration>),
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::Normal(_) => None,
            ConnectionGeneration::LoadBalanced(gen) => gen.map(|gen| gen.service_id),
        }
    }

    pub(crate) fn is_stale(self, current_generation: &PoolGeneration) -> bool {
        match (self, current_generation) {
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != *pgen,
            (ConnectionGeneration::LoadBalanced(cgen), PoolGeneration::LoadBalanced(gen_map)) => {
                if let Some(cgen) = cgen {
                    cgen.generation != *gen_map.get(&cgen.service_id).unwrap_or(&0)
                } else {
                    // A connection without a service id never finished its handshake and has
                    // nothing to compare against.
                    false
                }
            }
            _ => true,
        }
    }
}

impl From<LoadBalancedGeneration> for ConnectionGeneration {
    fn from(gen: LoadBalancedGeneration) -> Self {
        ConnectionGeneration::LoadBalanced(Some(gen))
    }
}

/// The generation of a connection to a load balancer, which is tracked per backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadBalancedGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: ObjectId,
}
