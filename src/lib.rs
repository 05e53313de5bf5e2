//! A stream-multiplexing session layered over a single reliable,
//! full-duplex transport.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod bucket;
mod config;
mod error;
mod frame;
mod registry;
mod send;
mod session;
mod stream;
mod stream_id;

pub use config::Config;
pub use error::{Error, Result};
pub use frame::OpCode;
pub use session::Session;
pub use stream::MuxStream;
