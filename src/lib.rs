//! Download scheduling core for the Synapse BitTorrent client.
//!
//! Block selection (the picker chain), choke/unchoke slot allocation and the
//! single threaded task scheduler that serializes every mutation of torrent
//! state. Wire framing, disk I/O, trackers and DHT live elsewhere and talk to
//! this crate through `torrent::Torrent`'s event methods and the `Disk` trait.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;
#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[macro_use]
pub mod log;
#[macro_use]
pub mod util;
pub mod config;
pub mod control;
pub mod errors;
pub mod stat;
pub mod torrent;

pub use crate::config::Config;
pub use crate::control::Scheduler;
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::log::LogLevel;
pub use crate::torrent::{Disk, Torrent};
