//! CRC-16/X.25 (also called CRC-ITU) as used by GT06 terminals.
//!
//! Reflected polynomial `0x8408`, seed `0xFFFF`, output complemented.

const POLY: u16 = 0x8408;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the frame checksum over `data`.
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ byte as u16) & 0xFF) as usize];
    }
    !crc
}
