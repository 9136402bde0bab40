use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use crate::{
    bson::{doc, oid::ObjectId, Document},
    cmap::{Connector, Transport},
    error::{Error, Result},
    hello::HelloCommand,
    options::ServerAddress,
    runtime,
};

/// The scripted behavior of one server behind a [`MockConnector`].
#[derive(Clone, Debug)]
pub(crate) struct MockServer {
    /// The reply sent to every hello. `None` makes hellos fail with a network error.
    reply: Option<Document>,

    /// Whether dialing the server fails outright.
    refuse: bool,

    /// Added to every hello round trip.
    latency: Duration,

    /// Added before every message read.
    message_delay: Duration,

    /// When set, replies carry a topology version so monitors stream.
    process_id: Option<ObjectId>,
}

impl MockServer {
    pub(crate) fn with_reply(reply: Document) -> Self {
        Self {
            reply: Some(reply),
            refuse: false,
            latency: Duration::ZERO,
            message_delay: Duration::ZERO,
            process_id: None,
        }
    }

    pub(crate) fn standalone() -> Self {
        Self::with_reply(base_reply())
    }

    pub(crate) fn mongos() -> Self {
        let mut reply = base_reply();
        reply.insert("msg", "isdbgrid");
        Self::with_reply(reply)
    }

    pub(crate) fn rs_primary(set_name: &str, hosts: &[&str]) -> Self {
        let mut reply = base_reply();
        reply.insert("setName", set_name);
        reply.insert("hosts", hosts.to_vec());
        reply.insert("primary", hosts.first().copied().unwrap_or_default());
        Self::with_reply(reply)
    }

    pub(crate) fn rs_secondary(set_name: &str, hosts: &[&str]) -> Self {
        let mut reply = base_reply();
        reply.insert("isWritablePrimary", false);
        reply.insert("secondary", true);
        reply.insert("setName", set_name);
        reply.insert("hosts", hosts.to_vec());
        Self::with_reply(reply)
    }

    /// A load balancer fronting a single backend service.
    pub(crate) fn load_balancer(service_id: ObjectId) -> Self {
        let mut reply = base_reply();
        reply.insert("msg", "isdbgrid");
        reply.insert("serviceId", service_id);
        Self::with_reply(reply)
    }

    /// A server that accepts connections but fails every hello.
    pub(crate) fn failing() -> Self {
        Self {
            reply: None,
            ..Self::standalone()
        }
    }

    /// A server that refuses connections.
    pub(crate) fn down() -> Self {
        Self {
            refuse: true,
            ..Self::failing()
        }
    }

    pub(crate) fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = delay;
        self
    }

    pub(crate) fn streaming(mut self) -> Self {
        self.process_id = Some(ObjectId::new());
        self
    }
}

fn base_reply() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "logicalSessionTimeoutMinutes": 30_i64,
    }
}

#[derive(Debug, Default)]
struct MockState {
    servers: HashMap<ServerAddress, MockServer>,

    /// Bumped whenever any server changes, so awaitable hellos can observe the change.
    counter: i64,
}

/// An in-memory [`Connector`] whose servers are scripted by the test.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
    changed: Arc<Notify>,
    dials: Arc<AtomicUsize>,
    hellos: Arc<AtomicU32>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(self, address: &str, server: MockServer) -> Self {
        self.set(address, server);
        self
    }

    /// Replace the behavior of the server at `address`. Streams already open to it see the
    /// change on their next call.
    pub(crate) fn set(&self, address: &str, server: MockServer) {
        let address = parse(address);
        {
            let mut state = self.state.lock().unwrap();
            state.counter += 1;
            state.servers.insert(address, server);
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn remove(&self, address: &str) {
        self.state.lock().unwrap().servers.remove(&parse(address));
        self.changed.notify_waiters();
    }

    /// The number of streams opened so far.
    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// The number of hellos answered so far.
    pub(crate) fn hello_count(&self) -> u32 {
        self.hellos.load(Ordering::SeqCst)
    }

    fn lookup(&self, address: &ServerAddress) -> Option<(MockServer, i64)> {
        let state = self.state.lock().unwrap();
        state
            .servers
            .get(address)
            .map(|server| (server.clone(), state.counter))
    }
}

fn parse(address: &str) -> ServerAddress {
    ServerAddress::parse(address).unwrap()
}

impl Connector for MockConnector {
    fn dial<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match self.lookup(address) {
                Some((server, _)) if !server.refuse => Ok(Box::new(MockTransport {
                    connector: self.clone(),
                    address: address.clone(),
                    pending: Vec::new(),
                }) as Box<dyn Transport>),
                _ => Err(std::io::ErrorKind::ConnectionRefused.into()),
            }
        })
    }
}

/// One stream opened by a [`MockConnector`]. Messages written to it are echoed back.
struct MockTransport {
    connector: MockConnector,
    address: ServerAddress,
    pending: Vec<Vec<u8>>,
}

impl MockTransport {
    fn current(&self) -> Result<(MockServer, i64)> {
        match self.connector.lookup(&self.address) {
            Some((server, counter)) if !server.refuse => Ok((server, counter)),
            _ => Err(std::io::ErrorKind::ConnectionReset.into()),
        }
    }

    fn reply(server: &MockServer, counter: i64) -> Result<Document> {
        let mut reply = server
            .reply
            .clone()
            .ok_or_else(|| Error::from(std::io::ErrorKind::ConnectionReset))?;
        if let Some(process_id) = server.process_id {
            reply.insert(
                "topologyVersion",
                doc! { "processId": process_id, "counter": counter },
            );
        }
        Ok(reply)
    }
}

impl Transport for MockTransport {
    fn hello<'a>(&'a mut self, command: &'a HelloCommand) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move {
            let (_, counter) = self.current()?;

            // An awaitable hello parks until the server changes or the await time elapses.
            if let Ok(known) = command.body.get_document("topologyVersion") {
                if known.get_i64("counter").ok() == Some(counter) {
                    let max_await = command
                        .body
                        .get_i64("maxAwaitTimeMS")
                        .map(|ms| Duration::from_millis(ms as u64))
                        .unwrap_or(Duration::from_secs(10));
                    let _ = runtime::timeout(max_await, self.connector.changed.notified()).await;
                }
            }

            let (server, counter) = self.current()?;
            if !server.latency.is_zero() {
                runtime::delay_for(server.latency).await;
            }
            self.connector.hellos.fetch_add(1, Ordering::SeqCst);
            Self::reply(&server, counter)
        })
    }

    fn write_message<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.current()?;
            self.pending.push(message.to_vec());
            Ok(())
        })
    }

    fn read_message(&mut self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let (server, _) = self.current()?;
            if !server.message_delay.is_zero() {
                runtime::delay_for(server.message_delay).await;
            }
            if self.pending.is_empty() {
                return Err(Error::invalid_response("no message was written"));
            }
            Ok(self.pending.remove(0))
        })
    }
}
