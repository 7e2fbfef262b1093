//! PAT/PMT section parsing with CRC-32 (MPEG-2) validation.
//!
//! Only the two tables the demultiplexer needs are handled. PMT elementary
//! stream entries keep their descriptor tags scanned, because stream type
//! 0x06 (PES private data) is ambiguous: the teletext (0x56) or subtitling
//! (0x59) descriptor decides which parser the PID gets.

use crc::{CRC_32_MPEG_2, Crc};

use crate::constants::{DESCRIPTOR_SUBTITLING, DESCRIPTOR_TELETEXT};

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// One validated PSI section: fixed header decoded, CRC checked.
struct SectionReader<'a> {
    table_id: u8,
    version: u8,
    current_next: bool,
    /// transport_stream_id for the PAT, program_number for a PMT
    id_extension: u16,
    /// bytes between the fixed header and the CRC
    body: &'a [u8],
}

impl<'a> SectionReader<'a> {
    /// Validates pointer field, section length and CRC-32.
    fn new(payload: &'a [u8]) -> anyhow::Result<Self> {
        if payload.is_empty() {
            anyhow::bail!("empty section payload");
        }
        let pointer = payload[0] as usize;
        let start = 1 + pointer;
        if payload.len() < start + 8 {
            anyhow::bail!("short section");
        }

        let table_id = payload[start];
        let section_length =
            ((payload[start + 1] & 0x0F) as usize) << 8 | payload[start + 2] as usize;
        if section_length < 9 {
            anyhow::bail!("invalid section_length");
        }
        let end = start + 3 + section_length;
        if end > payload.len() {
            anyhow::bail!("truncated section");
        }

        let crc_calc = CRC_MPEG.checksum(&payload[start..end - 4]);
        let crc_sent = u32::from_be_bytes(payload[end - 4..end].try_into()?);
        if crc_calc != crc_sent {
            anyhow::bail!("section CRC-32 mismatch");
        }

        Ok(Self {
            table_id,
            version: (payload[start + 5] & 0x3E) >> 1,
            current_next: payload[start + 5] & 0x01 != 0,
            id_extension: u16::from_be_bytes(payload[start + 3..start + 5].try_into()?),
            body: &payload[start + 8..end - 4],
        })
    }
}

#[derive(Debug, Clone)]
pub struct PatSection {
    pub version: u8,
    pub current_next: bool,
    pub programs: Vec<PatEntry>,
}

#[derive(Debug, Clone)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

pub fn parse_pat(payload: &[u8]) -> anyhow::Result<PatSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x00 {
        anyhow::bail!("not a PAT section");
    }

    let mut programs = Vec::new();
    let mut idx = 0;
    while idx + 4 <= sec.body.len() {
        let program_number = u16::from_be_bytes(sec.body[idx..idx + 2].try_into()?);
        let pid = ((sec.body[idx + 2] & 0x1F) as u16) << 8 | sec.body[idx + 3] as u16;
        idx += 4;
        // program 0 maps to the NIT, not a PMT
        if program_number != 0 {
            programs.push(PatEntry {
                program_number,
                pmt_pid: pid,
            });
        }
    }
    Ok(PatSection {
        version: sec.version,
        current_next: sec.current_next,
        programs,
    })
}

#[derive(Debug, Clone)]
pub struct PmtSection {
    pub version: u8,
    pub program_number: u16,
    pub pcr_pid: u16,
    pub streams: Vec<EsEntry>,
}

#[derive(Debug, Clone)]
pub struct EsEntry {
    pub stream_type: u8,
    pub pid: u16,
    pub has_teletext_descriptor: bool,
    pub has_subtitling_descriptor: bool,
}

pub fn parse_pmt(payload: &[u8]) -> anyhow::Result<PmtSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x02 {
        anyhow::bail!("not a PMT section");
    }
    let b = sec.body;
    if b.len() < 4 {
        anyhow::bail!("PMT body too short");
    }

    let pcr_pid = ((b[0] & 0x1F) as u16) << 8 | b[1] as u16;
    let program_info_length = ((b[2] & 0x0F) as usize) << 8 | b[3] as usize;
    let mut idx = 4 + program_info_length;

    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stream_type = b[idx];
        let pid = ((b[idx + 1] & 0x1F) as u16) << 8 | b[idx + 2] as u16;
        let es_info_length = ((b[idx + 3] & 0x0F) as usize) << 8 | b[idx + 4] as usize;
        idx += 5;

        let mut entry = EsEntry {
            stream_type,
            pid,
            has_teletext_descriptor: false,
            has_subtitling_descriptor: false,
        };
        let desc_end = (idx + es_info_length).min(b.len());
        let mut d = idx;
        while d + 2 <= desc_end {
            let tag = b[d];
            let len = b[d + 1] as usize;
            match tag {
                DESCRIPTOR_TELETEXT => entry.has_teletext_descriptor = true,
                DESCRIPTOR_SUBTITLING => entry.has_subtitling_descriptor = true,
                _ => {}
            }
            d += 2 + len;
        }
        streams.push(entry);
        idx += es_info_length;
    }

    Ok(PmtSection {
        version: sec.version,
        program_number: sec.id_extension,
        pcr_pid,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wrap `body` into a section payload with pointer byte and valid CRC
    fn section(table_id: u8, id_extension: u16, body: &[u8]) -> Vec<u8> {
        let section_length = 5 + body.len() + 4;
        let mut sec = vec![
            table_id,
            0xB0 | ((section_length >> 8) & 0x0F) as u8,
            (section_length & 0xFF) as u8,
        ];
        sec.extend_from_slice(&id_extension.to_be_bytes());
        sec.push(0xC1); // version 0, current_next set
        sec.push(0x00); // section_number
        sec.push(0x00); // last_section_number
        sec.extend_from_slice(body);
        let crc = CRC_MPEG.checksum(&sec);
        sec.extend_from_slice(&crc.to_be_bytes());

        let mut payload = vec![0x00]; // pointer field
        payload.extend_from_slice(&sec);
        payload
    }

    #[test]
    fn pat_lists_programs_and_skips_nit() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x00, 0xE0, 0x10]); // program 0 -> NIT
        body.extend_from_slice(&[0x00, 0x01, 0xE1, 0x00]); // program 1 -> 0x100
        let pat = parse_pat(&section(0x00, 1, &body)).expect("pat");
        assert_eq!(pat.programs.len(), 1);
        assert_eq!(pat.programs[0].program_number, 1);
        assert_eq!(pat.programs[0].pmt_pid, 0x100);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let body = [0x00, 0x01, 0xE1, 0x00];
        let mut payload = section(0x00, 1, &body);
        let n = payload.len();
        payload[n - 1] ^= 0xFF;
        assert!(parse_pat(&payload).is_err());
    }

    #[test]
    fn pmt_scans_es_descriptors() {
        let mut body = vec![0xE1, 0x01]; // pcr pid 0x101
        body.extend_from_slice(&[0xF0, 0x00]); // no program descriptors
        // HEVC video on 0x101
        body.extend_from_slice(&[0x24, 0xE1, 0x01, 0xF0, 0x00]);
        // MPEG-2 audio on 0x102
        body.extend_from_slice(&[0x04, 0xE1, 0x02, 0xF0, 0x00]);
        // private data with teletext descriptor on 0x103
        body.extend_from_slice(&[0x06, 0xE1, 0x03, 0xF0, 0x02, 0x56, 0x00]);
        // private data with subtitling descriptor on 0x104
        body.extend_from_slice(&[0x06, 0xE1, 0x04, 0xF0, 0x02, 0x59, 0x00]);

        let pmt = parse_pmt(&section(0x02, 7, &body)).expect("pmt");
        assert_eq!(pmt.program_number, 7);
        assert_eq!(pmt.pcr_pid, 0x101);
        assert_eq!(pmt.streams.len(), 4);
        assert_eq!(pmt.streams[0].stream_type, 0x24);
        assert!(pmt.streams[2].has_teletext_descriptor);
        assert!(!pmt.streams[2].has_subtitling_descriptor);
        assert!(pmt.streams[3].has_subtitling_descriptor);
    }
}
