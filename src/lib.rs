// src/lib.rs
//! Demultiplexes an MPEG transport stream into timestamped elementary-stream
//! access units (MPEG audio, HEVC video, DVB subtitles, teletext) and serves
//! them to TCP subscribers over a small binary protocol.

pub mod streamer {
    pub use crate::server::{Options, run};
}

pub mod bitreader;
pub mod constants;
pub mod demux;
pub mod network;
pub mod parsers;
pub mod protocol;
pub mod psi;
pub mod server;
pub mod types;
