//! Bit-cursor codec for delta-compressed input packets
//!
//! Operates on a byte buffer plus a mutable cursor measured in bits.
//! Nibblets are 8-bit fields written least-significant bit first, used on
//! the wire to index which input bit changed. Callers size their buffers to
//! `MAX_COMPRESSED_BITS`; out-of-range cursors panic via slice indexing.

/// Width of a nibblet field, in bits.
pub const NIBBLE_BITS: usize = 8;

/// Upper bound on the compressed bit stream in one input packet.
pub const MAX_COMPRESSED_BITS: usize = 4096;

/// Set the bit at `*offset` and advance the cursor.
pub fn set_bit(vector: &mut [u8], offset: &mut usize) {
    vector[*offset / 8] |= 1 << (*offset % 8);
    *offset += 1;
}

/// Clear the bit at `*offset` and advance the cursor.
pub fn clear_bit(vector: &mut [u8], offset: &mut usize) {
    vector[*offset / 8] &= !(1 << (*offset % 8));
    *offset += 1;
}

/// Write a bool as one bit and advance the cursor.
pub fn write_bit(vector: &mut [u8], offset: &mut usize, value: bool) {
    if value {
        set_bit(vector, offset);
    } else {
        clear_bit(vector, offset);
    }
}

/// Read one bit and advance the cursor.
pub fn read_bit(vector: &[u8], offset: &mut usize) -> bool {
    let bit = vector[*offset / 8] & (1 << (*offset % 8)) != 0;
    *offset += 1;
    bit
}

/// Write an 8-bit field one bit at a time, LSB first.
pub fn write_nibblet(vector: &mut [u8], offset: &mut usize, nibble: usize) {
    debug_assert!(nibble < 1 << NIBBLE_BITS);
    for i in 0..NIBBLE_BITS {
        write_bit(vector, offset, nibble & (1 << i) != 0);
    }
}

/// Read an 8-bit field one bit at a time, LSB first.
pub fn read_nibblet(vector: &[u8], offset: &mut usize) -> usize {
    let mut nibble = 0usize;
    for i in 0..NIBBLE_BITS {
        if read_bit(vector, offset) {
            nibble |= 1 << i;
        }
    }
    nibble
}
