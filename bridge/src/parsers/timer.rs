//! AMG shot-timer frame parser (spec §4.1).
//!
//! The reference frame is 14 bytes. Byte 0 (and byte 1, for the `0x01`
//! family) identify the record type; everything else decodes per field.
//! Any header we don't recognize, or a frame too short for the fields its
//! header implies, falls through to [`TimerFrame::Unknown`] rather than
//! panicking — BLE notification payloads are untrusted input.

use bridge_types::TimerFrame;

const START_HEADER: (u8, u8) = (0x01, 0x05);
const SHOT_HEADER: (u8, u8) = (0x01, 0x03);
const STOP_HEADER: (u8, u8) = (0x01, 0x08);
const SCREEN_DATA_HEADER: u8 = 0x02;
const BATCH_HEADER_RANGE: std::ops::RangeInclusive<u8> = 0x0A..=0x1A;

/// Decode a two-byte big-endian centisecond field, applying the reference
/// timer's documented low-byte-zero correction.
fn decode_cs(b1: u8, b2: u8) -> u32 {
    let mut value = ((b1 as u32) << 8) | (b2 as u32);
    if b2 == 0 {
        value += 256;
    }
    value
}

pub fn parse(frame: &[u8]) -> TimerFrame {
    if frame.len() < 2 {
        return TimerFrame::Unknown {
            raw: frame.to_vec(),
        };
    }
    let header = (frame[0], frame[1]);

    if header == START_HEADER {
        if let Some(&string_number) = frame.get(13) {
            return TimerFrame::Start { string_number };
        }
    } else if header == SHOT_HEADER {
        if frame.len() >= 13 {
            let opaque = [frame[10], frame[11], frame[12]];
            return TimerFrame::Shot {
                current_time_cs: decode_cs(frame[2], frame[3]),
                split_time_cs: decode_cs(frame[4], frame[5]),
                first_shot_time_cs: decode_cs(frame[6], frame[7]),
                opaque,
            };
        }
    } else if header == STOP_HEADER {
        if let Some(&string_number) = frame.get(13) {
            return TimerFrame::Stop {
                string_number,
                total_time_cs: decode_cs(frame[2], frame[3]),
            };
        }
    } else if frame[0] == SCREEN_DATA_HEADER {
        return TimerFrame::ScreenData {
            raw: frame.to_vec(),
        };
    } else if BATCH_HEADER_RANGE.contains(&frame[0]) {
        if let Some(&count) = frame.get(1) {
            let mut shot_times_cs = Vec::with_capacity(count as usize);
            let mut offset = 2usize;
            for _ in 0..count {
                match (frame.get(offset), frame.get(offset + 1)) {
                    (Some(&b1), Some(&b2)) => {
                        shot_times_cs.push(decode_cs(b1, b2));
                        offset += 2;
                    }
                    _ => break,
                }
            }
            return TimerFrame::ShotSequenceBatch { shot_times_cs };
        }
    }

    TimerFrame::Unknown {
        raw: frame.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 14];
        buf[..bytes.len().min(14)].copy_from_slice(&bytes[..bytes.len().min(14)]);
        buf
    }

    #[test]
    fn decode_cs_applies_low_byte_zero_correction() {
        assert_eq!(decode_cs(0x00, 0x00), 256);
        assert_eq!(decode_cs(0x01, 0x2C), 0x012C);
    }

    #[test]
    fn parses_start_frame() {
        let mut f = frame(&[0x01, 0x05]);
        f[13] = 7;
        assert_eq!(parse(&f), TimerFrame::Start { string_number: 7 });
    }

    #[test]
    fn parses_shot_frame_with_opaque_tail() {
        let mut f = frame(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x32, 0x00, 0x10]);
        f[10] = 0xAA;
        f[11] = 0xBB;
        f[12] = 0xCC;
        let parsed = parse(&f);
        assert_eq!(
            parsed,
            TimerFrame::Shot {
                current_time_cs: 0x0064,
                split_time_cs: 0x0032,
                first_shot_time_cs: 0x0010,
                opaque: [0xAA, 0xBB, 0xCC],
            }
        );
    }

    #[test]
    fn parses_stop_frame() {
        let mut f = frame(&[0x01, 0x08, 0x00, 0xFA]);
        f[13] = 3;
        assert_eq!(
            parse(&f),
            TimerFrame::Stop {
                string_number: 3,
                total_time_cs: 0x00FA,
            }
        );
    }

    #[test]
    fn parses_shot_sequence_batch() {
        let f = vec![0x0A, 0x02, 0x00, 0x64, 0x00, 0xC8];
        assert_eq!(
            parse(&f),
            TimerFrame::ShotSequenceBatch {
                shot_times_cs: vec![0x0064, 0x00C8],
            }
        );
    }

    #[test]
    fn unknown_header_never_panics() {
        let f = vec![0xFF, 0xFF, 0x01];
        assert_eq!(parse(&f), TimerFrame::Unknown { raw: f });
    }

    #[test]
    fn truncated_frame_falls_back_to_unknown() {
        let f = vec![0x01, 0x03];
        assert!(matches!(parse(&f), TimerFrame::Unknown { .. }));
    }
}
