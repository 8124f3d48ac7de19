pub mod error;
pub mod protocol;
pub mod resolver;
pub mod tcp;
pub mod wire;

pub use error::{NetError, NetResult};
pub use protocol::{AdminProtocol, DataProtocol, ProtocolConnector};
pub use resolver::{AddressResolver, DnsResolver};
pub use tcp::TcpConnector;
pub use wire::{WireRequest, WireResponse};
