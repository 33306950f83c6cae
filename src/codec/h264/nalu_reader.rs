// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

/// A bit reader for h264 RBSP data. Emulation-prevention bytes are dropped transparently, so
/// callers see the same bits whether they hand over an escaped NAL payload or an already unescaped
/// SEI payload.
pub(crate) struct NaluReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    /// Number of epbs (i.e. 0x000003) we found.
    num_epb: usize,
}

#[derive(Debug, Error)]
pub(crate) enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("byte read requested while not byte aligned")]
    NotByteAligned,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Reads one whole byte. Fails if the reader is not byte aligned.
    pub fn read_byte(&mut self) -> Result<u8, ReadBitsError> {
        if !self.is_byte_aligned() {
            return Err(ReadBitsError::NotByteAligned);
        }

        self.read_bits(8)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Whether the next unread bit is the first bit of a byte.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte % 8 == 0
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        if self.data.chunk().iter().any(|byte| *byte != 0) {
            return true;
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Reads an Exp-Golomb coded unsigned value, see 9.1.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream: Exp-Golomb prefix too long"));
            }
        }

        let mut value: u32 = (1 << num_bits) - 1;

        // Check for overflow
        if num_bits == 31 {
            if self.read_bits::<u32>(num_bits)? != 0 {
                return Err(anyhow!("Invalid stream: Exp-Golomb value overflows"));
            }
        } else if num_bits > 0 {
            value += self.read_bits::<u32>(num_bits)?;
        }

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    /// Reads an Exp-Golomb coded unsigned value that must not exceed `max`.
    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()?;
        if ue > max {
            return Err(anyhow!(
                "Value out of bounds: expected at most {}, got {}",
                max,
                ue
            ));
        }

        U::try_from(ue).map_err(|_| anyhow!("Conversion error"))
    }

    fn update_curr_byte(&mut self) -> Result<(), ReadBitsError> {
        if !self.data.has_remaining() {
            return Err(ReadBitsError::OutOfBits);
        }
        let mut byte = self.data.get_u8();

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // We found an epb
            self.num_epb += 1;
            if !self.data.has_remaining() {
                return Err(ReadBitsError::OutOfBits);
            }
            byte = self.data.get_u8();
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NaluReader;

    #[test]
    fn read_bits_across_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = NaluReader::new(&RBSP);
        assert!(!reader.read_bit().unwrap());
        assert_eq!(reader.num_bits_left(), 47);

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());

        assert!(reader.read_bit().unwrap());
        assert!(!reader.read_bit().unwrap());
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn emulation_prevention_is_skipped() {
        const ESCAPED: [u8; 5] = [0x00, 0x00, 0x03, 0x01, 0x80];

        let mut reader = NaluReader::new(&ESCAPED);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x000001);
        assert_eq!(reader.num_epb(), 1);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn exp_golomb() {
        // 1 | 010 | 011 | 00100 | 0001000
        const RBSP: [u8; 3] = [0b1010_0110, 0b0100_0001, 0b0000_0000];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 3);
        assert!(reader.read_ue_max::<u32>(6).is_err());
    }

    #[test]
    fn byte_alignment() {
        const RBSP: [u8; 2] = [0xab, 0xcd];

        let mut reader = NaluReader::new(&RBSP);
        assert!(reader.is_byte_aligned());
        assert_eq!(reader.read_byte().unwrap(), 0xab);
        assert!(reader.read_bit().unwrap());
        assert!(!reader.is_byte_aligned());
        assert!(reader.read_byte().is_err());
    }

    #[test]
    fn out_of_bits() {
        let mut reader = NaluReader::new(&[0u8; 0]);
        assert!(reader.read_bit().is_err());
        assert!(!reader.has_more_rsbp_data());
    }
}
