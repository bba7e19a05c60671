/// CRC-24Q (generator 0x1864CFB, zero init) as appended to every RTCM3
/// frame. Returned in the low 24 bits.
pub fn crc24q(data: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= 0x0186_4CFB;
            }
        }
    }
    crc & 0x00FF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_data_is_zero() {
        assert_eq!(crc24q(&[]), 0);
        assert_eq!(crc24q(&[0, 0, 0, 0]), 0);
    }

    #[test]
    fn sensitive_to_single_bit() {
        let a = crc24q(b"\xd3\x00\x13\x3e\xd0\x00\x01");
        let b = crc24q(b"\xd3\x00\x13\x3e\xd0\x00\x00");
        assert_ne!(a, b);
    }

    #[test]
    fn fits_in_24_bits() {
        let crc = crc24q(&[0xFF; 64]);
        assert_eq!(crc & 0xFF00_0000, 0);
    }
}
