//! Core proxy components

pub mod control;
pub mod netio;
pub mod registry;
pub mod relay;
pub mod router;
pub mod sinks;

pub use netio::{BufferPool, HANDSHAKE_BUFFER_SIZE};
pub use registry::{ConnInfo, ConnectionRegistry};
pub use relay::RelayEngine;
pub use router::{ModuleTarget, RouteSnapshot, RouteTable};
pub use sinks::FileSink;
