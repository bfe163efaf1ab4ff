//! Wire protocol: frame codec, payload sub-parsers, and command constants.

pub mod constants;
pub mod packet;
pub mod payload;

pub use constants::{has_opt, mode_of, DEFAULT_PORT, PROTOCOL_VERSION};
pub use packet::{decode, encode, Packet};
pub use payload::{FileDescriptor, PresenceInfo};
