//! Bit-level packing of quantization codes
//!
//! Codes are written least-significant bit first: the first value occupies the
//! low bits of byte 0, the next value continues where the previous one ended.

/// Writes variable-width unsigned values into a byte buffer
pub struct BitstringWriter<'a> {
    code: &'a mut [u8],
    offset: usize,
}

impl<'a> BitstringWriter<'a> {
    /// Wrap `code`, which is cleared before writing
    pub fn new(code: &'a mut [u8]) -> Self {
        code.fill(0);
        Self { code, offset: 0 }
    }

    /// Append the low `nbit` bits of `x`
    pub fn write(&mut self, mut x: u64, nbit: usize) {
        debug_assert!(nbit <= 64);
        debug_assert!(self.offset + nbit <= self.code.len() * 8);
        if nbit < 64 {
            x &= (1u64 << nbit) - 1;
        }

        let mut remaining = nbit;
        while remaining > 0 {
            let byte = self.offset / 8;
            let shift = self.offset % 8;
            let take = (8 - shift).min(remaining);
            self.code[byte] |= ((x & ((1u64 << take) - 1)) as u8) << shift;
            x >>= take;
            self.offset += take;
            remaining -= take;
        }
    }

    /// Number of bits written so far
    pub fn bits_written(&self) -> usize {
        self.offset
    }
}

/// Reads variable-width unsigned values written by [`BitstringWriter`]
pub struct BitstringReader<'a> {
    code: &'a [u8],
    offset: usize,
}

impl<'a> BitstringReader<'a> {
    /// Start reading at bit 0 of `code`
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, offset: 0 }
    }

    /// Start reading at bit `offset` of `code`
    pub fn at(code: &'a [u8], offset: usize) -> Self {
        Self { code, offset }
    }

    /// Read the next `nbit` bits
    pub fn read(&mut self, nbit: usize) -> u64 {
        debug_assert!(nbit <= 64);
        debug_assert!(self.offset + nbit <= self.code.len() * 8);

        let mut x = 0u64;
        let mut got = 0;
        while got < nbit {
            let byte = self.offset / 8;
            let shift = self.offset % 8;
            let take = (8 - shift).min(nbit - got);
            let bits = (self.code[byte] >> shift) as u64 & ((1u64 << take) - 1);
            x |= bits << got;
            self.offset += take;
            got += take;
        }
        x
    }
}
