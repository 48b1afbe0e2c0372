//! Reader for bit-packed entries aligned to 64-bit big-endian fields.
//!
//! The plot file and several intermediate tables store entries packed into
//! 64-bit fields, written big-endian, with the data left-justified: the
//! first entry occupies the most significant bits of the first field. The
//! reader swaps every field to native order up front so that variable-width
//! reads reduce to shifts and masks.
//!
//! A trailing partial field is swapped like any full field: its data is
//! left-justified on disk, so the swap leaves it left-justified in native
//! order with only dead low bits beyond the declared length.

pub struct BitReader<'a> {
    fields: &'a mut [u64],
    size_bits: usize,
    position: usize,
}

impl<'a> BitReader<'a> {
    /// Takes a buffer of 64-bit big-endian fields and swaps it to native
    /// order in place. The slice must cover `size_bits` rounded up to a
    /// whole field.
    pub fn new(fields_be: &'a mut [u64], size_bits: usize) -> Self {
        let field_count = size_bits / 64;
        let remainder_bits = size_bits - field_count * 64;
        let fields_needed = field_count + usize::from(remainder_bits > 0);
        assert!(
            fields_be.len() >= fields_needed,
            "bit buffer too short: {} fields for {size_bits} bits",
            fields_be.len()
        );

        for field in fields_be[..fields_needed].iter_mut() {
            *field = u64::from_be(*field);
        }

        Self {
            fields: fields_be,
            size_bits,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    /// Reads `bit_count` bits (at most 64), advancing the read position.
    pub fn read_u64(&mut self, bit_count: u32) -> u64 {
        assert!(bit_count <= 64);
        assert!(
            self.position + bit_count as usize <= self.size_bits,
            "read of {bit_count} bits at {} exceeds {} bits",
            self.position,
            self.size_bits
        );
        if bit_count == 0 {
            return 0;
        }

        let field_index = self.position >> 6;
        let bits_available = ((field_index + 1) * 64 - self.position) as u32;
        let shift = bit_count.max(bits_available) - bit_count;

        let mut value = self.fields[field_index] >> shift;

        if bits_available < bit_count {
            // The entry spills into the next field.
            let bits_needed = bit_count - bits_available;
            value = (value << bits_needed) | (self.fields[field_index + 1] >> (64 - bits_needed));
        }

        value &= u64::MAX >> (64 - bit_count);

        self.position += bit_count as usize;
        value
    }

    /// Reads `bit_count` bits (at most 128), advancing the read position.
    /// The entry may span up to two fields past the current one.
    pub fn read_u128(&mut self, bit_count: u32) -> u128 {
        assert!(bit_count <= 128);
        assert!(
            self.position + bit_count as usize <= self.size_bits,
            "read of {bit_count} bits at {} exceeds {} bits",
            self.position,
            self.size_bits
        );
        if bit_count == 0 {
            return 0;
        }

        let field_index = self.position >> 6;
        let bits_available = ((field_index + 1) * 64 - self.position) as u32;
        let shift = bit_count.max(bits_available) - bit_count;

        let mut value = (self.fields[field_index] >> shift) as u128;

        if bits_available < bit_count {
            let bits_needed = bit_count - bits_available;

            if bits_needed > 64 {
                // All of the next field plus the head of the one after it.
                let tail_bits = bits_needed - 64;
                value = (value << bits_needed)
                    | ((self.fields[field_index + 1] as u128) << tail_bits)
                    | ((self.fields[field_index + 2] >> (64 - tail_bits)) as u128);
            } else {
                value = (value << bits_needed)
                    | ((self.fields[field_index + 1] >> ((64 - bits_needed) % 64)) as u128);
            }
        }

        if bit_count < 128 {
            value &= u128::MAX >> (128 - bit_count);
        }

        self.position += bit_count as usize;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Packs `(value, bit_count)` entries left-justified into big-endian
    /// fields, the way table serializers lay them out on disk.
    fn pack_be(entries: &[(u64, u32)]) -> (Vec<u64>, usize) {
        let mut fields: Vec<u64> = Vec::new();
        let mut bit_pos = 0usize;

        for &(value, bits) in entries {
            let mut remaining = bits;
            let mut value = (value as u128) << (128 - bits);

            while remaining > 0 {
                let field_index = bit_pos / 64;
                let field_offset = (bit_pos % 64) as u32;
                if field_index == fields.len() {
                    fields.push(0);
                }

                let take = remaining.min(64 - field_offset);
                let chunk = (value >> (128 - take)) as u64;
                fields[field_index] |= chunk << (64 - field_offset - take);

                value <<= take;
                remaining -= take;
                bit_pos += take as usize;
            }
        }

        for field in fields.iter_mut() {
            *field = field.to_be();
        }
        (fields, bit_pos)
    }

    #[test]
    fn test_single_field_reads() {
        let (mut fields, size) = pack_be(&[(0b101, 3), (0x7F, 7), (1, 1)]);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(3), 0b101);
        assert_eq!(reader.read_u64(7), 0x7F);
        assert_eq!(reader.read_u64(1), 1);
        assert_eq!(reader.position(), 11);
    }

    #[test]
    fn test_full_field_at_boundary() {
        let (mut fields, size) = pack_be(&[(0xDEADBEEFCAFEF00D, 64), (0x1234, 16)]);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(64), 0xDEADBEEFCAFEF00D);
        assert_eq!(reader.read_u64(16), 0x1234);
    }

    #[test]
    fn test_cross_field_read() {
        // 0xAAAA.. then 0xBBBB.., as stored on disk.
        let mut fields = vec![0xAAAAAAAAAAAAAAAAu64.to_be(), 0xBBBBBBBBBBBBBBBBu64.to_be()];
        let mut reader = BitReader::new(&mut fields, 128);

        assert_eq!(reader.read_u64(4), 0xA);
        for _ in 0..60 {
            reader.read_u64(1);
        }
        assert_eq!(reader.position(), 64);
        assert_eq!(reader.read_u64(8), 0xBB);
    }

    #[test]
    fn test_read_spanning_two_fields() {
        let (mut fields, size) = pack_be(&[(0xF, 4), (0x0123456789ABCDEF, 64)]);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(4), 0xF);
        assert_eq!(reader.read_u64(64), 0x0123456789ABCDEF);
    }

    #[test]
    fn test_read128_spanning_three_fields() {
        let mut fields = vec![
            0x1111111111111111u64.to_be(),
            0x2222222222222222u64.to_be(),
            0x3333333333333333u64.to_be(),
        ];
        let mut reader = BitReader::new(&mut fields, 192);

        assert_eq!(reader.read_u64(32), 0x11111111);
        // 128 bits starting mid-field: tail of field 0, all of field 1,
        // head of field 2.
        assert_eq!(
            reader.read_u128(128),
            0x11111111_22222222_22222222_33333333u128
        );
        assert_eq!(reader.read_u64(32), 0x33333333);
    }

    #[test]
    fn test_read128_full_at_boundary() {
        let mut fields = vec![
            0xAAAAAAAAAAAAAAAAu64.to_be(),
            0xBBBBBBBBBBBBBBBBu64.to_be(),
        ];
        let mut reader = BitReader::new(&mut fields, 128);

        assert_eq!(
            reader.read_u128(128),
            0xAAAAAAAAAAAAAAAA_BBBBBBBBBBBBBBBBu128
        );
    }

    #[test]
    fn test_trailing_partial_field() {
        // 20 bits of data in a partial final field.
        let (mut fields, size) = pack_be(&[(0xABCDE, 20)]);
        assert_eq!(size, 20);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(20), 0xABCDE);
    }

    #[test]
    fn test_partial_field_after_full_fields() {
        let (mut fields, size) = pack_be(&[(u64::MAX, 64), (0x3F, 6)]);
        assert_eq!(size, 70);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(64), u64::MAX);
        assert_eq!(reader.read_u64(6), 0x3F);
    }

    #[test]
    fn test_zero_width_read() {
        let (mut fields, size) = pack_be(&[(0xFF, 8)]);
        let mut reader = BitReader::new(&mut fields, size);

        assert_eq!(reader.read_u64(0), 0);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_u64(8), 0xFF);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_read_past_end_panics() {
        let (mut fields, size) = pack_be(&[(0xFF, 8)]);
        let mut reader = BitReader::new(&mut fields, size);
        reader.read_u64(9);
    }
}
