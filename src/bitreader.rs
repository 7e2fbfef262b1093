//! Sequential MSB-first bit reader over a borrowed byte buffer.
//!
//! Used to pick apart compressed headers embedded in elementary streams
//! (MPEG audio frame headers, HEVC parameter sets and slice headers). The
//! reader carries a sticky error flag: once a read or skip runs past the
//! declared bit length, every later read returns 0 and `is_error()` stays
//! set, so callers can issue a whole sequence of reads and check validity
//! once at the end.
//!
//! The escape-removal mode transparently drops HEVC emulation-prevention
//! bytes (`0x03` after `0x00 0x00`) while scanning, without building an
//! unescaped copy of the buffer. Detection is gated on the cursor being
//! byte-aligned: the three bytes ending at the current byte are inspected
//! only at the instant the cursor lands exactly on a byte boundary. That
//! matches the decoder this stream format was bring-up tested against and
//! must not be tightened to an always-on check.

pub struct BitReader<'a> {
    data: &'a [u8],
    /// Cursor in bits
    offset: usize,
    /// Total length in bits
    len: usize,
    error: bool,
    ep3: bool,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], bits: usize) -> Self {
        BitReader {
            data,
            offset: 0,
            len: bits,
            error: false,
            ep3: false,
        }
    }

    /// Escape-removal mode. `data` must point at the start of a NAL unit;
    /// the cursor begins 2 bytes in, past the NAL header, which also seeds
    /// the 3-byte look-back window used for escape detection.
    pub fn new_ep3(data: &'a [u8], bits: usize) -> Self {
        BitReader {
            data,
            offset: 16,
            len: bits,
            error: false,
            ep3: true,
        }
    }

    /// When byte-aligned, skip an emulation-prevention byte sitting under
    /// the cursor (the byte here is 0x03 and the two before it are zero).
    #[inline]
    fn skip_escape_byte(&mut self) {
        if self.offset & 7 != 0 {
            return;
        }
        let at = self.offset >> 3;
        if at >= 2
            && at < self.data.len()
            && self.data[at] == 3
            && self.data[at - 1] == 0
            && self.data[at - 2] == 0
        {
            self.offset += 8;
        }
    }

    pub fn skip_bits(&mut self, num: usize) {
        let mut num = num;
        if self.ep3 {
            while num > 0 {
                self.skip_escape_byte();

                if self.offset & 7 == 0 && num >= 8 {
                    // byte boundary, move a whole byte at once
                    self.offset += 8;
                    num -= 8;
                } else {
                    let to_boundary = 8 - (self.offset & 7);
                    if to_boundary <= num {
                        self.offset += to_boundary;
                        num -= to_boundary;
                    } else {
                        self.offset += num;
                        num = 0;
                    }
                }

                if self.offset >= self.len {
                    self.error = true;
                    break;
                }
            }
            return;
        }

        self.offset += num;
        if self.offset > self.len {
            self.offset = self.len;
            self.error = true;
        }
    }

    /// Read `num` bits (0..=32), MSB first. On overrun the sticky error
    /// flag is set and 0 is returned; partial bits are discarded.
    pub fn read_bits(&mut self, num: u32) -> u32 {
        debug_assert!(num <= 32);
        let mut num = num;
        let mut r = 0u32;

        while num > 0 {
            if self.ep3 {
                self.skip_escape_byte();
            }

            if self.offset >= self.len {
                self.error = true;
                return 0;
            }

            num -= 1;
            if self.data[self.offset >> 3] & (1 << (7 - (self.offset & 7))) != 0 {
                r |= 1 << num;
            }
            self.offset += 1;
        }
        r
    }

    /// Like [`read_bits`](Self::read_bits) but leaves the cursor in place.
    /// No escape handling here; callers peek raw buffer bits.
    pub fn show_bits(&mut self, num: u32) -> u32 {
        debug_assert!(num <= 32);
        let mut num = num;
        let mut r = 0u32;
        let mut offs = self.offset;

        while num > 0 {
            if offs >= self.len {
                self.error = true;
                return 0;
            }

            num -= 1;
            if self.data[offs >> 3] & (1 << (7 - (offs & 7))) != 0 {
                r |= 1 << num;
            }
            offs += 1;
        }
        r
    }

    #[inline]
    pub fn read_bits1(&mut self) -> u32 {
        self.read_bits(1)
    }

    /// Unsigned Exp-Golomb: count leading zero bits, then read as many
    /// suffix bits. More than `max_bits` leading zeros is malformed input
    /// and yields 0; the surrounding parse should be treated as suspect.
    pub fn read_golomb_ue_capped(&mut self, max_bits: u32) -> u32 {
        let mut lzb: i32 = -1;
        let mut bits = 0u32;

        loop {
            if bits > max_bits {
                return 0;
            }
            let b = self.read_bits1();
            lzb += 1;
            bits += 1;
            if b != 0 {
                break;
            }
        }

        ((1u64 << lzb) - 1) as u32 + self.read_bits(lzb as u32)
    }

    #[inline]
    pub fn read_golomb_ue(&mut self) -> u32 {
        self.read_golomb_ue_capped(32)
    }

    /// Signed Exp-Golomb via the standard even/odd mapping.
    pub fn read_golomb_se(&mut self) -> i32 {
        let v = self.read_golomb_ue();
        if v == 0 {
            return 0;
        }

        let positive = v & 1 != 0;
        let v = ((v + 1) >> 1) as i32;
        if positive { v } else { -v }
    }

    pub fn length(&self) -> usize {
        self.len
    }

    /// Bits left before the declared end. Unknowable in escape-removal mode
    /// (the number of remaining escape bytes would require a full scan).
    pub fn remaining_bits(&self) -> Option<usize> {
        if self.ep3 {
            return None;
        }
        Some(self.len.saturating_sub(self.offset))
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}
