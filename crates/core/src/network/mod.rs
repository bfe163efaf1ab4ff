//! UDP control plane: socket ownership, frame transmission, and the
//! receive/dispatch loop.

pub mod udp;

pub use udp::{ControlChannel, Dispatcher, Identity};
