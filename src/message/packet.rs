//! De-obfuscation and classification of frames.
//!
//! The payload of every frame is XORed with a single key byte that travels in
//! the header at offset 6. The kind of packet is identified by three header
//! bytes at offsets 12, 14 and 15.

use super::frame::{Frame, HEADER_LEN};

const SOURCE_OFFSET: usize = 12;
const COMMAND_SET_OFFSET: usize = 14;
const COMMAND_ID_OFFSET: usize = 15;

/// What a frame carries, as far as this bridge can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Power distribution (PD) board status
    PowerDistribution,
    /// Battery management system (BMS) status for one battery pack
    BatteryManagement,
    /// Energy management system (EMS) status. Recognised but not decoded any further.
    EnergyManagementSystem,
    Inverter,
    Unknown,
}

impl PacketKind {
    /// Classify by the three discriminant header bytes. The first matching row wins.
    pub fn classify(source: u8, command_set: u8, command_id: u8) -> Self {
        match (source, command_set, command_id) {
            (2, 32, 2) => PacketKind::PowerDistribution,
            (3, 32, 2) => PacketKind::EnergyManagementSystem,
            (4, 32, 2) => PacketKind::Inverter,
            (3, 32, 50) | (6, 32, 2) | (6, 32, 50) => PacketKind::BatteryManagement,
            _ => PacketKind::Unknown,
        }
    }

    pub fn from_header(header: &[u8]) -> Self {
        Self::classify(
            header[SOURCE_OFFSET],
            header[COMMAND_SET_OFFSET],
            header[COMMAND_ID_OFFSET],
        )
    }
}

/// A frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub kind: PacketKind,
    pub header: [u8; HEADER_LEN],
    pub payload: Vec<u8>,
}

impl DecodedPacket {
    pub fn decode(frame: &Frame<'_>) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(frame.header());

        Self {
            kind: PacketKind::from_header(&header),
            payload: xor_mask(frame.payload(), frame.key()),
            header,
        }
    }
}

/// XOR every byte with `key`. Applying it twice gives back the input.
pub fn xor_mask(data: &[u8], key: u8) -> Vec<u8> {
    data.iter().map(|b| b ^ key).collect()
}

#[cfg(test)]
fn header(key: u8, source: u8, command_set: u8, command_id: u8, payload_len: u16) -> Vec<u8> {
    let mut header = vec![0u8; HEADER_LEN];
    header[..2].copy_from_slice(&super::frame::MAGIC);
    header[2..4].copy_from_slice(&payload_len.to_le_bytes());
    header[super::frame::KEY_OFFSET] = key;
    header[SOURCE_OFFSET] = source;
    header[COMMAND_SET_OFFSET] = command_set;
    header[COMMAND_ID_OFFSET] = command_id;
    header
}

#[test]
fn test_classify_table() {
    use PacketKind::*;
    let cases = [
        ((2, 32, 2), PowerDistribution),
        ((3, 32, 2), EnergyManagementSystem),
        ((4, 32, 2), Inverter),
        ((3, 32, 50), BatteryManagement),
        ((6, 32, 2), BatteryManagement),
        ((6, 32, 50), BatteryManagement),
        ((2, 32, 50), Unknown),
        ((4, 31, 2), Unknown),
        ((0, 0, 0), Unknown),
    ];
    for ((source, set, id), expected) in cases {
        assert_eq!(PacketKind::classify(source, set, id), expected, "{source} {set} {id}");
    }
}

#[test]
fn test_classify_exhaustive() {
    let mut known = 0;
    for source in 0..=255u8 {
        for set in 0..=255u8 {
            for id in 0..=255u8 {
                let kind = PacketKind::classify(source, set, id);
                if kind != PacketKind::Unknown {
                    known += 1;
                    assert_eq!(set, 32);
                    assert!(id == 2 || id == 50);
                }
                assert_eq!(kind, PacketKind::classify(source, set, id));
            }
        }
    }
    assert_eq!(known, 6);
}

#[test]
fn test_xor_mask_is_involution() {
    let payload: Vec<u8> = (0..=255u8).collect();
    for key in [0x00, 0x11, 0x5a, 0xff] {
        let masked = xor_mask(&payload, key);
        assert_eq!(masked.len(), payload.len());
        assert_eq!(xor_mask(&masked, key), payload);
    }
}

#[test]
fn test_decode_unmasks_payload() {
    let plain = hex::decode("0102030405").unwrap();
    let mut bytes = header(0x11, 2, 0x20, 0x02, plain.len() as u16);
    bytes.extend(xor_mask(&plain, 0x11));

    let frame = super::frame::split(&bytes).next().unwrap().unwrap();
    assert_eq!(frame.key(), 0x11);
    let packet = DecodedPacket::decode(&frame);

    assert_eq!(packet.kind, PacketKind::PowerDistribution);
    assert_eq!(packet.payload, plain);
    assert_eq!(packet.payload.len(), frame.declared_len());
}
