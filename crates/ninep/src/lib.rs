#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol engine.
//!
//! This crate provides a tokio-based implementation of the 9P2000 wire
//! protocol: a codec, dial-string parsing, a client session, and a
//! server dispatch loop generic over a [`srv::Filesystem`] backend. It
//! implements plain 9P2000 only — no `.u` or `.L` extensions.
//!
//! # Getting started
//!
//! To serve a filesystem:
//!
//! 1. Define a type for your per-fid state (or use `()`).
//! 2. Implement [`srv::Filesystem`] for your filesystem type.
//! 3. Call [`srv::srv_async`] with a parsed [`dial::Dial`] address.
//!
//! To act as a client, parse a [`dial::Dial`] address, connect, and
//! drive a [`client::Client`] session over the resulting socket.
//!
//! ```no_run
//! use ninep::{srv::{Filesystem, FId, srv_async}, dial::Dial, Result, FCall, Qid, QidType};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[derive(Default)]
//! struct MyFId;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = MyFId;
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::Rattach { qid: Qid { typ: QidType::DIR, version: 0, path: 0 } })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fs = MyFs;
//!     let dial = Dial::parse("tcp!127.0.0.1!564", None)?;
//!     srv_async(fs, &dial).await
//! }
//! ```
//!
//! # Message flow
//!
//! 1. `Tversion`/`Rversion` — negotiate `msize` and the protocol version.
//! 2. `Tauth`/`Rauth` (optional) — establish an auth fid.
//! 3. `Tattach`/`Rattach` — attach a fid to the filesystem root.
//! 4. Operations — `walk`, `open`, `read`, `write`, `stat`, ...
//! 5. `Tclunk` — release fids when done with them.
//!
//! # Fid management
//!
//! A fid is a client-chosen 32-bit handle naming a file or directory.
//! Fids are introduced by `Tauth`, `Tattach`, and `Twalk`, persist until
//! `Tclunk`, and are unique per connection. A connection's fid table is
//! reset by `Tversion`.
//!
//! # Error handling
//!
//! Fallible [`srv::Filesystem`] methods return [`error::Error`]; the
//! dispatch loop converts that into `Rerror` automatically, using
//! `Error::wire_message()` as `ename`.
//!
//! # Transport
//!
//! [`dial::Dial`] parses `"tcp!host!port"` and `"unix!path"` addresses.
pub mod client;
pub mod dial;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
