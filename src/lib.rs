//! Whirlpool — point-to-point VPN worker node
//!
//! Speaks two obfuscated wire protocols with authenticated clients
//! ("viridians"): PORT, reliable and stream-oriented over TCP, and TYPHOON,
//! unreliable and adaptively timed over UDP. Client traffic is decrypted,
//! masqueraded onto a tunnel interface, and replies flow back encrypted on
//! the per-peer socket that names the session.

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod ipv4;
pub mod node;
pub mod port;
pub mod proto;
pub mod token;
pub mod tunnel;
pub mod typhoon;
pub mod viridian;

// Re-exports
pub use buffer::{Buffer, BufferError, PacketPool};
pub use config::{ConfigError, NodeConfig, NodeKeys, PortConfig, TyphoonConfig};
pub use crypto::{Asymmetric, CryptoError, Symmetric, SymmetricKey};
pub use node::Node;
pub use proto::{Protocol, ProtocolError, ReturnCode};
pub use token::{TokenError, ViridianToken};
pub use tunnel::{TunnelHandle, TunnelIo, TunnelNetwork};
pub use viridian::{RegistrationError, SessionHandle, ViridianDirectory, ViridianInfo};
