//! Ed25519/FIDO2 authentication coprocessor, served over 9P2000.
//!
//! [`core`] holds the key-ring, key, and conversation types; [`rpc`]
//! drives the `start`/`read`/`write` state machine against them;
//! [`crypto`] supplies the Ed25519 and (mocked) FIDO2 primitives; [`fs`]
//! exposes the whole thing as a `ninep::srv::Filesystem` with the
//! `/ctl`, `/rpc`, `/log`, `/key` file surface.

pub mod core;
pub mod crypto;
pub mod fs;
pub mod rpc;

pub use fs::AuthFs;
pub use rpc::Engine;
