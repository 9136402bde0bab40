mod description;
mod monitor;
pub(crate) mod public;
mod server;
mod topology;

pub use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{
            server_selection::SelectedServer,
            SessionSupportStatus,
            TopologyDescription,
            TransactionSupportStatus,
        },
    },
    public::{ServerInfo, ServerType, TopologyType},
    server::Server,
    topology::{SelectServerOptions, Topology},
};

pub(crate) use self::{
    monitor::{Monitor, RttInfo},
    topology::{HandshakePhase, TopologyUpdater, TopologyWatcher},
};
