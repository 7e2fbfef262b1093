//! Shared types for the demultiplexer and its elementary-stream parsers

use serde::Serialize;

/// Timestamps recovered from a PES packet header. Only meaningful on the
/// first payload fragment of a PES packet; later fragments carry `None`.
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub pts: u64,
    pub dts: u64,
    /// Elementary-stream bytes announced by the PES header (0 = unbounded,
    /// as video PES packets typically declare)
    pub payload_length: usize,
}

/// One demultiplexed access unit. `data` borrows parser-owned storage and
/// stays valid until the next `append` on that parser.
#[derive(Debug)]
pub struct StreamPacket<'a> {
    pub pid: u16,
    pub data: &'a [u8],
    /// Duration in 90 kHz clock ticks
    pub duration: u32,
    pub dts: u64,
    pub pts: u64,
    /// Latched once when the stream's reported format changed; the consumer
    /// sends a one-time stream-change announcement on this edge.
    pub stream_change: bool,
}

/// Result of one `parse` call: at most one primary access unit plus an
/// optional side-data unit (RDS extracted from an audio frame).
#[derive(Debug, Default)]
pub struct ParsedFrames<'a> {
    pub packet: Option<StreamPacket<'a>>,
    pub side: Option<StreamPacket<'a>>,
}

/// Audio stream parameters reported to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioInfo {
    pub channels: u32,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,
}

/// Video stream parameters reported to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoInfo {
    /// Frame duration in `fps_rate` units
    pub fps_scale: u32,
    pub fps_rate: u32,
    pub height: u32,
    pub width: u32,
    /// Display aspect ratio
    pub aspect: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamInfo {
    Audio(AudioInfo),
    Video(VideoInfo),
}

/// Codec family carried on a PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    MpegAudio,
    Hevc,
    Subtitle,
    Teletext,
    /// Ancillary RDS sub-stream split out of an MPEG audio stream
    Rds,
}

/// Snapshot row of the demultiplexer's stream table, used for the
/// stream-change announcement and the periodic status report
#[derive(Debug, Clone, Serialize)]
pub struct StreamEntry {
    pub pid: u16,
    pub kind: StreamKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<StreamInfo>,
}
