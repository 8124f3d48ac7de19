pub mod hostport;
pub mod ids;

// Re-export commonly used items at the crate root.
pub use hostport::{HostPort, HostPortParseError};
pub use ids::{BlockId, GenerationStamp, NamespaceId};
