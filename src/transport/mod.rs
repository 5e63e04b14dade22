pub mod broker;
pub mod local;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use broker::BrokerTransport;
pub use local::LocalTransport;
pub use memory::MemoryBroker;
pub use tcp::{TcpBrokerClient, TcpBrokerConfig};
pub use traits::{BrokerClient, Transport, TransportError};
