//! sprync-transport: how the driver reaches a sprite.
//!
//! [`api::Client`] speaks the hosted control API (file read/write,
//! sprite info, command exec over HTTP or WebSocket). [`wsconn::WsConn`]
//! demuxes the exec channel's binary-prefixed streams. [`Session`] ties
//! the two together into a live remote agent.

pub mod api;
pub mod session;
pub mod wsconn;

pub use api::{Client, SpriteInfo};
pub use session::{scratch_path, tar_ext, PackResult, Session, TransferResult};
pub use wsconn::WsConn;
