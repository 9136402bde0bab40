//! Topology discovery, server monitoring, server selection and connection pooling for MongoDB
//! deployments.
//!
//! This crate is the connectivity core of a MongoDB client. It keeps a live picture of a
//! deployment (a standalone server, a replica set, a sharded cluster or a load balancer), picks a
//! suitable server for each operation, and hands out pooled connections to it. It does not speak
//! the database's command protocol itself: byte streams are opened through a user-supplied
//! [`Connector`], and everything past the initial `hello` handshake is opaque to the engine.
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongodb_connectivity::{
//! #     error::Result, options::{ServerAddress, TopologyOptions}, Connector, SelectServerOptions,
//! #     TimeoutContext, Topology,
//! # };
//! # async fn run(connector: Arc<dyn Connector>) -> Result<()> {
//! let options = TopologyOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .build();
//! let topology = Topology::new(options.clone(), connector)?;
//!
//! let mut timeout_context = TimeoutContext::new(&options);
//! let server = topology
//!     .select_server(None, &mut timeout_context, SelectServerOptions::default())
//!     .await?;
//! let mut connection = server.pool().check_out(&timeout_context, None).await?;
//! let reply = connection.send_message(b"ping", &timeout_context).await;
//! if let Err(ref error) = reply {
//!     topology.handle_connection_error(&connection, error.clone()).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Monitoring
//!
//! Every state change is reported through the handlers configured on
//! [`TopologyOptions`](options::TopologyOptions) (see the [`event`] module) and logged with
//! [`tracing`] under the `mongodb_connectivity::topology`, `mongodb_connectivity::server_selection`
//! and `mongodb_connectivity::connection` targets.

#![warn(missing_docs)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod cmap;
pub mod error;
pub mod event;
mod hello;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod session;
mod timeout;
mod trace;

#[cfg(test)]
mod test;

pub use tokio_util::sync::CancellationToken;

pub use crate::{
    cmap::{ConnectionInfo, ConnectionPool, Connector, PooledConnection, Transport},
    hello::{HelloCommand, HelloCommandResponse, HelloReply, LastWrite},
    sdam::{
        SelectServerOptions,
        SelectedServer,
        Server,
        ServerDescription,
        ServerInfo,
        ServerType,
        SessionSupportStatus,
        Topology,
        TopologyDescription,
        TopologyType,
        TopologyVersion,
        TransactionSupportStatus,
    },
    selection_criteria::{
        Predicate,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
    session::{ClusterTime, Session},
    timeout::{CsotTimeoutContext, LegacyTimeoutContext, TimeoutContext},
};
