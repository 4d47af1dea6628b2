//! Internet checksum (RFC 1071) used to validate segments.
//!
//! The sum is taken over consecutive big-endian 16-bit words, an odd trailing
//! byte is padded with zero on the right, the carries are folded back in and
//! the one's complement is returned. Callers zero the checksum field of the
//! segment before computing.

/// Compute the Internet checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(checksum(&[]), 0xffff);
    }

    #[test]
    fn rfc1071_example() {
        // Words 0001 f203 f4f5 f6f7 sum to 2ddf0, folded ddf2, complement 220d.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn odd_length_pads_right() {
        assert_eq!(checksum(&[0xab]), checksum(&[0xab, 0x00]));
    }

    #[test]
    fn embedding_checksum_verifies_to_zero() {
        let mut data = vec![0x12, 0x34, 0x00, 0x00, 0x56, 0x78];
        let c = checksum(&data);
        data[2..4].copy_from_slice(&c.to_be_bytes());
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let data = b"reliable transport".to_vec();
        let mut corrupt = data.clone();
        corrupt[3] ^= 0x01;
        assert_ne!(checksum(&data), checksum(&corrupt));
    }
}
