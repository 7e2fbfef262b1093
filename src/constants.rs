//! Constants for MPEG-TS demultiplexing and access-unit streaming

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// PES packet constants
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// PTS/DTS run at 90 kHz
pub const PTS_CLOCK_HZ: u64 = 90_000;

/// Sentinel for "no timestamp available" (reserved max value)
pub const NOPTS_VALUE: u64 = u64::MAX;

/// Microsecond timebase used for frame-duration bookkeeping
pub const TIME_BASE_US: i64 = 1_000_000;

/// Fallback video frame duration when no DTS delta is known (20 ms, in µs)
pub const NOMINAL_FRAME_DURATION_US: i64 = 20_000;

/// Samples per MPEG audio frame used for duration derivation
pub const MPEG_AUDIO_SAMPLES_PER_FRAME: u64 = 1152;

/// Initial rolling-buffer sizes per codec family. Video needs a large buffer
/// because one coded picture must fit completely before it can be cut.
pub const AUDIO_PES_BUFFER_INITIAL: usize = 2048;
pub const VIDEO_PES_BUFFER_INITIAL: usize = 240_000;
pub const SUBTITLE_PES_BUFFER_INITIAL: usize = 4000;
pub const TELETEXT_PES_BUFFER_INITIAL: usize = 4000;

/// Hard caps beyond which a stream is considered corrupt
pub const AUDIO_PES_BUFFER_MAX: usize = 64 * 1024;
pub const VIDEO_PES_BUFFER_MAX: usize = 4_000_000;
pub const SUBTITLE_PES_BUFFER_MAX: usize = 256 * 1024;
pub const TELETEXT_PES_BUFFER_MAX: usize = 256 * 1024;

/// RDS ancillary-data buffer management
pub const RDS_BUFFER_INITIAL: usize = 384;
pub const MAX_RDS_BUFFER_SIZE: usize = 100_000;

/// A single NAL unit larger than this means the video stream is corrupt
pub const MAX_NAL_UNIT_SIZE: usize = 500_000;

/// PMT stream types handled by the demultiplexer
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_PES_PRIVATE: u8 = 0x06;
pub const STREAM_TYPE_HEVC: u8 = 0x24;

/// DVB descriptor tags used to tell teletext from subtitles on type 0x06
pub const DESCRIPTOR_TELETEXT: u8 = 0x56;
pub const DESCRIPTOR_SUBTITLING: u8 = 0x59;
