//! HEVC elementary-stream parser.
//!
//! Scans the rolling buffer for start-code prefixes with a 32-bit shift
//! register, classifies each complete NAL unit and parses parameter sets
//! and slice headers (escape-removal bit reader, straight over the buffered
//! bytes) to find access-unit boundaries. One access unit is emitted per
//! completed picture, with DTS/PTS taken from the PES epoch the picture's
//! first slice falls into and geometry reported through the change-detecting
//! stream-info setter.

use log::{debug, warn};

use crate::bitreader::BitReader;
use crate::constants::{
    MAX_NAL_UNIT_SIZE, NOMINAL_FRAME_DURATION_US, NOPTS_VALUE, PTS_CLOCK_HZ, TIME_BASE_US,
    VIDEO_PES_BUFFER_INITIAL, VIDEO_PES_BUFFER_MAX,
};
use crate::demux::rescale;
use crate::parsers::PesBuffer;
use crate::types::{ParsedFrames, PesHeader, StreamPacket, VideoInfo};

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const NAL_AUD: u8 = 35;
const NAL_EOS: u8 = 36;
const NAL_FILLER: u8 = 38;
const NAL_SEI_PREFIX: u8 = 39;

/// Bits of the profile_tier_level general profile block (level byte apart)
const PTL_PROFILE_BITS: usize = 8 + 32 + 4 + 43 + 1;

#[derive(Clone, Copy, Default)]
struct VclNal {
    pps_id: u32,
    first_slice_in_pic: bool,
}

#[derive(Clone, Copy, Default)]
struct PpsData {
    sps_id: u32,
    dependent_slice_segments: bool,
}

enum NalScan {
    /// NAL handled, keep scanning
    Continue,
    /// Next start code not in the buffer yet, or an access unit was just
    /// completed; stop scanning for this call
    Stop,
    /// Stream discontinuity, the parser reset itself
    Aborted,
}

pub struct HevcParser {
    pid: u16,
    pes: PesBuffer,
    start_code: u32,
    need_sps: bool,
    need_pps: bool,
    found_frame: bool,
    vcl_nal: VclNal,
    pps: [PpsData; 64],
    /// Layer/temporal ids of the last NAL header, kept for logging only
    nal_layer_id: u8,
    nal_temporal_id: i8,
    width: u32,
    height: u32,
    pixel_aspect: (u32, u32),
    dts: u64,
    pts: u64,
    /// Frame duration latched from the first computed DTS delta
    fps_scale: u32,
    info: Option<VideoInfo>,
}

impl HevcParser {
    pub fn new(pid: u16) -> Self {
        HevcParser {
            pid,
            pes: PesBuffer::new(VIDEO_PES_BUFFER_INITIAL, VIDEO_PES_BUFFER_MAX),
            start_code: 0xffff_ffff,
            need_sps: true,
            need_pps: true,
            found_frame: false,
            vcl_nal: VclNal::default(),
            pps: [PpsData::default(); 64],
            nal_layer_id: 0,
            nal_temporal_id: 0,
            width: 0,
            height: 0,
            pixel_aspect: (0, 1),
            dts: NOPTS_VALUE,
            pts: NOPTS_VALUE,
            fps_scale: 0,
            info: None,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn stream_info(&self) -> Option<VideoInfo> {
        self.info
    }

    pub fn append(&mut self, data: &[u8], header: Option<&PesHeader>) -> bool {
        self.pes.append(data, header)
    }

    pub fn reset(&mut self) {
        self.pes.clear();
        self.start_code = 0xffff_ffff;
        self.need_sps = true;
        self.need_pps = true;
        self.found_frame = false;
        self.vcl_nal = VclNal::default();
        self.pps = [PpsData::default(); 64];
        self.width = 0;
        self.height = 0;
        self.pixel_aspect = (0, 1);
        self.fps_scale = 0;
    }

    pub fn parse(&mut self) -> ParsedFrames<'_> {
        let mut out = ParsedFrames::default();
        if self.pes.len() < 10 {
            return out;
        }

        let mut frame_complete = false;
        let mut p = self.pes.parser_ptr;
        let mut startcode = self.start_code;

        while self.pes.len() > p + 3 {
            if startcode & 0x00ff_ffff == 0x0000_0001 {
                match self.parse_nal(p, &mut frame_complete) {
                    NalScan::Continue => {}
                    NalScan::Stop => break,
                    NalScan::Aborted => return out,
                }
            }
            startcode = startcode << 8 | self.pes.buf[p] as u32;
            p += 1;
        }
        self.pes.parser_ptr = p;
        self.start_code = startcode;

        if frame_complete {
            // rewind the scan; the cut-off tail starts with the next
            // picture's start code and is rescanned from the beginning
            self.start_code = 0xffff_ffff;
            self.pes.parser_ptr = 0;
            self.found_frame = false;

            if !self.need_sps {
                let duration = if self.pes.cur_dts != NOPTS_VALUE
                    && self.pes.prev_dts != NOPTS_VALUE
                    && self.pes.cur_dts > self.pes.prev_dts
                {
                    (self.pes.cur_dts - self.pes.prev_dts) as u32
                } else {
                    rescale(NOMINAL_FRAME_DURATION_US, PTS_CLOCK_HZ as i64, TIME_BASE_US) as u32
                };
                if self.fps_scale == 0 {
                    self.fps_scale = rescale(duration as i64, TIME_BASE_US, PTS_CLOCK_HZ as i64) as u32;
                }

                let par = self.pixel_aspect.0 as f64 / self.pixel_aspect.1 as f64;
                let dar = par * self.width as f64 / self.height as f64;
                let stream_change = self.set_video_information(dar);
                if stream_change {
                    debug!(
                        "pid {}: video format {}x{} dar {:.3} frame duration {}",
                        self.pid, self.width, self.height, dar, self.fps_scale
                    );
                }

                out.packet = Some(StreamPacket {
                    pid: self.pid,
                    data: &self.pes.buf[..self.pes.next_frame_ptr],
                    duration,
                    dts: self.dts,
                    pts: self.pts,
                    stream_change,
                });
            }
        }
        out
    }

    /// Handle the NAL unit whose header starts at `nal_start` (the byte
    /// right after its start code).
    fn parse_nal(&mut self, nal_start: usize, frame_complete: &mut bool) -> NalScan {
        // delimit the unit by the next start code
        let nal_len = {
            let buf = &self.pes.buf[nal_start..];
            let mut sc = 0xffff_ffffu32;
            let mut q = 0usize;
            let mut len = 0usize;
            while q < buf.len() {
                sc = sc << 8 | buf[q] as u32;
                q += 1;
                if sc & 0x00ff_ffff == 0x0000_0001 {
                    len = q - 3;
                    break;
                }
            }
            len
        };
        if nal_len == 0 {
            return NalScan::Stop;
        }
        if nal_len > MAX_NAL_UNIT_SIZE {
            warn!(
                "pid {}: NAL unit of {} bytes, resetting parser",
                self.pid, nal_len
            );
            self.reset();
            return NalScan::Aborted;
        }
        if nal_len < 2 {
            return NalScan::Continue;
        }

        let header = (self.pes.buf[nal_start] as u16) << 8 | self.pes.buf[nal_start + 1] as u16;
        if header & 0x8000 != 0 {
            return NalScan::Continue; // forbidden zero bit set
        }
        let nal_type = ((header & 0x7e00) >> 9) as u8;
        self.nal_layer_id = ((header & 0x01f8) >> 3) as u8;
        self.nal_temporal_id = (header & 0x07) as i8 - 1;

        match nal_type {
            0..=9 | 16..=21 => {
                if self.need_sps || self.need_pps {
                    self.found_frame = true;
                    return NalScan::Continue;
                }
                let Some(vcl) = self.parse_slice_header(nal_start, nal_len, nal_type) else {
                    return NalScan::Continue;
                };
                if self.found_frame && self.is_first_vcl_nal(&vcl) {
                    *frame_complete = true;
                    self.pes.next_frame_ptr = nal_start - 3;
                    return NalScan::Stop;
                }
                if !self.found_frame {
                    // a slice that began before the current PES header was
                    // seen belongs to the previous timestamp epoch
                    if nal_start as i64 - 3 >= self.pes.time_pos {
                        self.dts = self.pes.cur_dts;
                        self.pts = self.pes.cur_pts;
                    } else {
                        self.dts = self.pes.prev_dts;
                        self.pts = self.pes.prev_pts;
                    }
                }
                self.vcl_nal = vcl;
                self.found_frame = true;
            }
            NAL_SEI_PREFIX => {
                if self.found_frame {
                    *frame_complete = true;
                    self.pes.next_frame_ptr = nal_start - 3;
                    return NalScan::Stop;
                }
            }
            NAL_VPS => {}
            NAL_SPS => {
                if self.found_frame {
                    *frame_complete = true;
                    self.pes.next_frame_ptr = nal_start - 3;
                    return NalScan::Stop;
                }
                if !self.parse_sps(nal_start, nal_len) {
                    return NalScan::Continue;
                }
                self.need_sps = false;
            }
            NAL_PPS => {
                if self.found_frame {
                    *frame_complete = true;
                    self.pes.next_frame_ptr = nal_start - 3;
                    return NalScan::Stop;
                }
                if !self.parse_pps(nal_start, nal_len) {
                    return NalScan::Continue;
                }
                self.need_pps = false;
            }
            NAL_AUD => {
                if self.found_frame && self.pes.prev_pts != NOPTS_VALUE {
                    *frame_complete = true;
                    self.pes.next_frame_ptr = nal_start - 3;
                    return NalScan::Stop;
                }
            }
            NAL_EOS => {
                if self.found_frame {
                    *frame_complete = true;
                    // end-of-sequence stays inside the completed unit
                    self.pes.next_frame_ptr = nal_start + 2;
                    return NalScan::Stop;
                }
            }
            NAL_FILLER => {}
            _ => {
                debug!(
                    "pid {}: unhandled NAL type {} (layer {} temporal {})",
                    self.pid, nal_type, self.nal_layer_id, self.nal_temporal_id
                );
            }
        }
        NalScan::Continue
    }

    fn is_first_vcl_nal(&self, vcl: &VclNal) -> bool {
        self.vcl_nal.pps_id != vcl.pps_id || vcl.first_slice_in_pic
    }

    fn parse_slice_header(&self, nal_start: usize, nal_len: usize, nal_type: u8) -> Option<VclNal> {
        let nal = &self.pes.buf[nal_start..nal_start + nal_len];
        let mut bs = BitReader::new_ep3(nal, nal_len * 8);

        let first_slice_in_pic = bs.read_bits1() != 0;
        if (16..=23).contains(&nal_type) {
            bs.read_bits1(); // no_output_of_prior_pics_flag (IRAP only)
        }
        let pps_id = bs.read_golomb_ue();
        if bs.is_error() {
            return None;
        }
        Some(VclNal {
            pps_id,
            first_slice_in_pic,
        })
    }

    fn parse_sps(&mut self, nal_start: usize, nal_len: usize) -> bool {
        let (width, height);
        {
            let nal = &self.pes.buf[nal_start..nal_start + nal_len];
            let mut bs = BitReader::new_ep3(nal, nal_len * 8);

            bs.read_bits(4); // sps_video_parameter_set_id
            let max_sub_layers = bs.read_bits(3) as usize;
            bs.read_bits1(); // sps_temporal_id_nesting_flag

            // profile_tier_level: general profile block, then the level byte
            bs.skip_bits(PTL_PROFILE_BITS);
            bs.skip_bits(8);
            let mut profile_present = [false; 8];
            let mut level_present = [false; 8];
            for i in 0..max_sub_layers {
                profile_present[i] = bs.read_bits1() != 0;
                level_present[i] = bs.read_bits1() != 0;
            }
            if max_sub_layers > 0 {
                for _ in max_sub_layers..8 {
                    bs.skip_bits(2); // reserved_zero_2bits
                }
            }
            for i in 0..max_sub_layers {
                if profile_present[i] {
                    bs.skip_bits(PTL_PROFILE_BITS);
                }
                if level_present[i] {
                    bs.skip_bits(8);
                }
            }

            bs.read_golomb_ue(); // sps_seq_parameter_set_id
            let chroma_format_idc = bs.read_golomb_ue();
            if chroma_format_idc == 3 {
                bs.read_bits1(); // separate_colour_plane_flag
            }
            width = bs.read_golomb_ue();
            height = bs.read_golomb_ue();
            if bs.is_error() {
                return false;
            }
        }
        self.width = width;
        self.height = height;
        // square pixels assumed; VUI is not parsed
        self.pixel_aspect.0 = 1;
        true
    }

    fn parse_pps(&mut self, nal_start: usize, nal_len: usize) -> bool {
        let (pps_id, sps_id, dependent);
        {
            let nal = &self.pes.buf[nal_start..nal_start + nal_len];
            let mut bs = BitReader::new_ep3(nal, nal_len * 8);
            pps_id = bs.read_golomb_ue() as usize;
            sps_id = bs.read_golomb_ue();
            dependent = bs.read_bits1() != 0;
            if bs.is_error() {
                return false;
            }
        }
        if pps_id >= self.pps.len() {
            return false;
        }
        self.pps[pps_id] = PpsData {
            sps_id,
            dependent_slice_segments: dependent,
        };
        debug!(
            "pid {}: PPS {} references SPS {} (dependent slice segments: {})",
            self.pid, pps_id, self.pps[pps_id].sps_id, self.pps[pps_id].dependent_slice_segments
        );
        true
    }

    fn set_video_information(&mut self, dar: f64) -> bool {
        let next = VideoInfo {
            fps_scale: self.fps_scale,
            fps_rate: TIME_BASE_US as u32,
            height: self.height,
            width: self.width,
            aspect: dar,
        };
        if self.info == Some(next) {
            false
        } else {
            self.info = Some(next);
            true
        }
    }
}
