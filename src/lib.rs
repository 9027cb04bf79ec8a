#![forbid(unsafe_code)]
//! Asynchronous 9P2000 / 9P2000.u server core for Rust.
//!
//! This crate provides a tokio-based implementation of the 9P2000 protocol
//! and its 9P2000.u extension: message framing, the wire codec, and the
//! per-connection dispatch loop (in-flight request table, `Tflush`
//! cancellation, `Tversion` renegotiation). It does not ship a filesystem;
//! callers supply one by implementing [`srv::Filesystem`].
//!
//! # Overview
//!
//! 9P was developed for the Plan 9 distributed operating system and is
//! still the protocol Linux's v9fs client, QEMU's virtio-9p, and various
//! container runtimes speak to mount a remote or synthetic filesystem. This
//! crate speaks 9P2000 (RFC-less but IXP-documented) and 9P2000.u (numeric
//! uid/gid/muid, symlinks, and an errno-qualified `Rerror`); 9P2000.L is out
//! of scope, though its message codes are recognized on the wire and answered
//! with a non-fatal "not implemented" rather than closing the connection.
//!
//! # Getting Started
//!
//! To serve a 9P filesystem:
//!
//! 1. Define a type to hold your per-fid state (or use `()` for stateless fids).
//! 2. Implement [`srv::Filesystem`] for your backend, overriding whichever
//!    operations it supports; every method defaults to `EOPNOTSUPP`.
//! 3. Start serving with [`srv::srv_async`] (or [`srv::dispatch`] directly,
//!    against an already-accepted connection).
//!
//! # Example
//!
//! ```no_run
//! use n9p::srv::{Filesystem, FId, srv_async};
//! use n9p::{Qid, QidType};
//! use n9p::utils::Result;
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<Qid> {
//!         Ok(Qid { typ: QidType::DIR, version: 0, path: 0 })
//!     }
//!
//!     // Override rwalk/ropen/rread/... as your filesystem supports them.
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message flow
//!
//! 1. **Version negotiation**: client sends `Tversion`, server replies
//!    `Rversion` with `min(client_msize, server_msize)` and either the
//!    agreed dialect string or `"unknown"`.
//! 2. **Authentication** (optional): `Tauth`/`Rauth`.
//! 3. **Attach**: client attaches to the filesystem root with `Tattach`.
//! 4. **Operations**: `Twalk`, `Topen`, `Tcreate`, `Tread`, `Twrite`,
//!    `Tstat`, `Twstat`.
//! 5. **Cleanup**: `Tclunk` (or `Tremove`) invalidates the fid.
//!
//! Any request may be abandoned with `Tflush`; the core cancels the
//! in-flight task and guarantees the original reply, if it was already on
//! its way out, is dropped rather than sent after the `Rflush`.
//!
//! ## Fid management
//!
//! A fid is a client-chosen 32-bit handle naming a node on the server. The
//! core, not the backend, owns the fid table:
//!
//! - `Tauth`/`Tattach`/`Twalk` are the only ways a fid becomes bound.
//! - A `Twalk` of one or more names only binds `newfid` if every name
//!   resolved; binds it unconditionally for a zero-name alias walk.
//! - `Tclunk` and `Tremove` unbind the fid regardless of whether the
//!   backend call itself succeeded.
//!
//! # Error Handling
//!
//! Backends return [`utils::Result`], i.e. [`error::Error`]. Most errors
//! become an `Rerror` (carrying an errno under 9P2000.u) and the connection
//! continues; only [`error::Error::Protocol`] (malformed frames, duplicate
//! tags) closes it. See [`error::Error::is_fatal`].
//!
//! # Transport
//!
//! [`srv::srv_async`] accepts a `proto!addr!port` listen spec:
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!0.0.0.0!564"`)
//! - **Unix domain sockets**: `"unix!path!0"` (e.g. `"unix!/tmp/n9p.sock!0"`)
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod dialect;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod stat;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
