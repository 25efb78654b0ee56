//! ThinkGear packet parsing.
//!
//! The EEG headset streams ThinkGear packets:
//!
//! - Sync(2): `0xAA 0xAA`
//! - PayloadLen(1): 0..=169
//! - Payload(PayloadLen): data rows
//! - Checksum(1): inverted low byte of the payload sum
//!
//! Each data row is zero or more `0x55` extended-code bytes, a code byte, a
//! length byte for codes `>= 0x80`, and the value. Codes below `0x80` carry
//! exactly one value byte.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::{BandPower, SensorReading, SignalKind};

/// Packet sync byte (appears twice).
pub const SYNC: u8 = 0xAA;

/// Extended code prefix byte.
pub const EXCODE: u8 = 0x55;

/// Largest valid payload length.
pub const MAX_PAYLOAD_LEN: usize = 169;

/// Signal quality, 0 (good) to 200 (no contact).
pub const CODE_POOR_SIGNAL: u8 = 0x02;

/// eSense attention, 0-100.
pub const CODE_ATTENTION: u8 = 0x04;

/// eSense meditation, 0-100.
pub const CODE_MEDITATION: u8 = 0x05;

/// Raw wave sample, big-endian i16.
pub const CODE_RAW_WAVE: u8 = 0x80;

/// Eight 24-bit big-endian band powers.
pub const CODE_ASIC_EEG_POWER: u8 = 0x83;

const BAND_COUNT: usize = 8;
const BAND_WIDTH: usize = 3;

/// One data row of a packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    /// Number of `0x55` prefixes before the code.
    pub excode_level: u8,
    /// Row code.
    pub code: u8,
    /// Row value bytes.
    pub value: Bytes,
}

impl DataRow {
    /// Convert to a reading. Rows without a reading mapping yield `None`.
    pub fn to_reading(&self) -> Option<SensorReading> {
        if self.excode_level != 0 {
            return None;
        }

        let signal = |signal| {
            self.value.first().map(|&v| SensorReading::Signal {
                signal,
                value: i32::from(v),
            })
        };

        match self.code {
            CODE_POOR_SIGNAL => signal(SignalKind::PoorSignal),
            CODE_ATTENTION => signal(SignalKind::Attention),
            CODE_MEDITATION => signal(SignalKind::Meditation),
            CODE_ASIC_EEG_POWER => parse_band_power(&self.value).map(SensorReading::BandPower),
            _ => None,
        }
    }

    /// Raw wave sample carried by a `0x80` row.
    pub fn raw_wave(&self) -> Option<i16> {
        match (self.excode_level, self.code, self.value.as_ref()) {
            (0, CODE_RAW_WAVE, [hi, lo]) => Some(i16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

fn parse_band_power(value: &[u8]) -> Option<BandPower> {
    if value.len() != BAND_COUNT * BAND_WIDTH {
        return None;
    }

    let mut bands = [0u32; BAND_COUNT];
    for (band, chunk) in bands.iter_mut().zip(value.chunks_exact(BAND_WIDTH)) {
        *band = u32::from_be_bytes([0, chunk[0], chunk[1], chunk[2]]);
    }

    Some(BandPower {
        delta: bands[0],
        theta: bands[1],
        low_alpha: bands[2],
        high_alpha: bands[3],
        low_beta: bands[4],
        high_beta: bands[5],
        low_gamma: bands[6],
        mid_gamma: bands[7],
    })
}

/// Checksum of a payload: the inverted low byte of its sum.
pub fn checksum(payload: &[u8]) -> u8 {
    let sum = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    !sum
}

/// Frame a payload as a complete packet.
///
/// # Errors
///
/// Returns an error if the payload is longer than [`MAX_PAYLOAD_LEN`].
pub fn encode_packet(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidParameter {
            name: "payload".to_string(),
            value: format!("{} bytes", payload.len()),
        });
    }

    let mut packet = BytesMut::with_capacity(payload.len() + 4);
    packet.extend_from_slice(&[SYNC, SYNC, payload.len() as u8]);
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&[checksum(payload)]);
    Ok(packet.freeze())
}

/// Split a packet payload into data rows.
///
/// # Errors
///
/// Returns an error if a row runs past the end of the payload.
pub fn parse_payload(payload: &[u8]) -> Result<Vec<DataRow>> {
    let truncated = |code: u8| Error::InvalidData {
        context: format!("data row {:#04x} truncated", code),
    };

    let mut rows = Vec::new();
    let mut i = 0;

    while i < payload.len() {
        let mut excode_level = 0u8;
        while payload.get(i) == Some(&EXCODE) {
            excode_level = excode_level.saturating_add(1);
            i += 1;
        }

        let code = *payload.get(i).ok_or_else(|| truncated(EXCODE))?;
        i += 1;

        let len = if code >= 0x80 {
            let len = *payload.get(i).ok_or_else(|| truncated(code))? as usize;
            i += 1;
            len
        } else {
            1
        };

        let value = payload.get(i..i + len).ok_or_else(|| truncated(code))?;
        i += len;

        rows.push(DataRow {
            excode_level,
            code,
            value: Bytes::copy_from_slice(value),
        });
    }

    Ok(rows)
}

/// Incremental packet parser over an arbitrary byte stream.
///
/// Bytes may arrive split at any point; garbage between packets is skipped
/// and packets with a bad length or checksum are dropped.
#[derive(Debug, Default)]
pub struct PacketParser {
    buffer: BytesMut,
    rejected: u64,
}

impl PacketParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return the rows of every complete, valid packet.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DataRow> {
        self.buffer.extend_from_slice(data);
        let mut rows = Vec::new();

        loop {
            while self.buffer.len() >= 2 && !(self.buffer[0] == SYNC && self.buffer[1] == SYNC) {
                self.buffer.advance(1);
            }
            if self.buffer.len() < 3 {
                break;
            }

            let len = self.buffer[2];
            if len == SYNC {
                // Extra sync byte; resynchronise one byte later.
                self.buffer.advance(1);
                continue;
            }

            let len = len as usize;
            if len > MAX_PAYLOAD_LEN {
                debug!("Dropping packet with payload length {}", len);
                self.rejected += 1;
                self.buffer.advance(2);
                continue;
            }

            let total = 3 + len + 1;
            if self.buffer.len() < total {
                break;
            }

            let packet = self.buffer.split_to(total);
            let payload = &packet[3..3 + len];
            let expected = checksum(payload);
            let actual = packet[total - 1];
            if expected != actual {
                debug!(
                    "{}",
                    Error::ChecksumMismatch { expected, actual }
                );
                self.rejected += 1;
                continue;
            }

            match parse_payload(payload) {
                Ok(parsed) => {
                    trace!("Packet with {} rows", parsed.len());
                    rows.extend(parsed);
                }
                Err(e) => {
                    debug!("Dropping packet: {}", e);
                    self.rejected += 1;
                }
            }
        }

        rows
    }

    /// Convenience wrapper returning only rows that map to readings.
    pub fn feed_readings(&mut self, data: &[u8]) -> Vec<SensorReading> {
        self.feed(data)
            .iter()
            .filter_map(DataRow::to_reading)
            .collect()
    }

    /// Packets dropped for bad length, checksum or row layout.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Bytes buffered waiting for the rest of a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Reference packet carrying poor signal, band powers, attention and meditation.
    const REFERENCE_PACKET: [u8; 36] = [
        0xAA, 0xAA, 0x20, 0x02, 0x00, 0x83, 0x18, 0x00, 0x00, 0x94, 0x00, 0x00, 0x42, 0x00, 0x00,
        0x0B, 0x00, 0x00, 0x64, 0x00, 0x00, 0x4D, 0x00, 0x00, 0x3D, 0x00, 0x00, 0x07, 0x00, 0x00,
        0x05, 0x04, 0x0D, 0x05, 0x3D, 0x34,
    ];

    fn expected_readings() -> Vec<SensorReading> {
        vec![
            SensorReading::Signal {
                signal: SignalKind::PoorSignal,
                value: 0,
            },
            SensorReading::BandPower(BandPower {
                delta: 148,
                theta: 66,
                low_alpha: 11,
                high_alpha: 100,
                low_beta: 77,
                high_beta: 61,
                low_gamma: 7,
                mid_gamma: 5,
            }),
            SensorReading::Signal {
                signal: SignalKind::Attention,
                value: 13,
            },
            SensorReading::Signal {
                signal: SignalKind::Meditation,
                value: 61,
            },
        ]
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&REFERENCE_PACKET[3..35]), 0x34);
        assert_eq!(checksum(&[0x02, 0x00]), 0xFD);
        assert_eq!(checksum(&[]), 0xFF);
    }

    #[test]
    fn test_reference_packet() {
        let mut parser = PacketParser::new();
        assert_eq!(parser.feed_readings(&REFERENCE_PACKET), expected_readings());
        assert_eq!(parser.rejected(), 0);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_split_delivery() {
        let mut parser = PacketParser::new();
        let (head, tail) = REFERENCE_PACKET.split_at(17);
        assert!(parser.feed(head).is_empty());
        assert_eq!(parser.feed_readings(tail), expected_readings());
    }

    #[test]
    fn test_garbage_and_extra_sync_skipped() {
        let mut stream = vec![0x13, 0x37, 0xAA, 0x00, 0xAA];
        stream.extend_from_slice(&REFERENCE_PACKET);
        let mut parser = PacketParser::new();
        assert_eq!(parser.feed_readings(&stream), expected_readings());
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut corrupted = REFERENCE_PACKET;
        corrupted[35] ^= 0xFF;
        let mut parser = PacketParser::new();
        assert!(parser.feed(&corrupted).is_empty());
        assert_eq!(parser.rejected(), 1);

        // The stream recovers on the next good packet.
        assert_eq!(parser.feed_readings(&REFERENCE_PACKET), expected_readings());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut parser = PacketParser::new();
        assert!(parser.feed(&[0xAA, 0xAA, 0xC8, 0x00]).is_empty());
        assert_eq!(parser.rejected(), 1);
    }

    #[test]
    fn test_raw_wave_and_extended_rows() {
        let payload = [0x80, 0x02, 0xFF, 0xF0, 0x55, 0x0A, 0x07];
        let rows = parse_payload(&payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].raw_wave(), Some(-16));
        assert_eq!(rows[0].to_reading(), None);
        assert_eq!(rows[1].excode_level, 1);
        assert_eq!(rows[1].code, 0x0A);
        assert_eq!(rows[1].to_reading(), None);
    }

    #[test]
    fn test_truncated_row() {
        assert!(parse_payload(&[0x83, 0x18, 0x00]).is_err());
        assert!(parse_payload(&[0x55]).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        assert!(encode_packet(&[0u8; 170]).is_err());
        let packet = encode_packet(&[0x04, 0x32]).unwrap();
        assert_eq!(packet.as_ref(), &[0xAA, 0xAA, 0x02, 0x04, 0x32, 0xC9]);
    }

    proptest! {
        #[test]
        fn prop_single_byte_rows_survive_framing(
            rows in proptest::collection::vec((0x01u8..0x55, any::<u8>()), 0..40),
            split in 0usize..200,
        ) {
            let payload: Vec<u8> = rows.iter().flat_map(|(c, v)| [*c, *v]).collect();
            let packet = encode_packet(&payload).unwrap();
            let split = split.min(packet.len());

            let mut parser = PacketParser::new();
            let mut parsed = parser.feed(&packet[..split]);
            parsed.extend(parser.feed(&packet[split..]));

            let decoded: Vec<(u8, u8)> = parsed.iter().map(|r| (r.code, r.value[0])).collect();
            prop_assert_eq!(decoded, rows);
            prop_assert_eq!(parser.rejected(), 0);
        }
    }
}
