//! Binary tick decoder
//!
//! A frame is a concatenation of fixed-size little-endian packets. The first
//! byte of each packet selects its kind and therefore its stride. Decoding is
//! pure: no I/O, no shared state.

use thiserror::Error;

use crate::types::{DepthLevel, PacketKind, Tick};

/// Seconds added to positive raw epochs to express them in exchange-local time.
pub const EXCHANGE_EPOCH_OFFSET_SECS: i64 = 19_800;

/// Number of depth levels carried by a FULL packet.
pub const DEPTH_LEVELS: usize = 5;

/// Size of one depth level inside a FULL packet.
pub(crate) const DEPTH_LEVEL_SIZE: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown packet type {tag} at offset {offset}")]
    UnknownPacketType { tag: u8, offset: usize },

    #[error("truncated {kind} packet at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        kind: PacketKind,
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Result of decoding a frame while keeping whatever was valid.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    /// Ticks decoded before the first error, in wire order
    pub ticks: Vec<Tick>,
    /// The error that stopped decoding, if any
    pub error: Option<DecodeError>,
}

/// Decode a whole frame. Any malformed packet fails the frame.
pub fn decode(buffer: &[u8]) -> Result<Vec<Tick>, DecodeError> {
    let outcome = decode_partial(buffer);
    match outcome.error {
        Some(err) => Err(err),
        None => Ok(outcome.ticks),
    }
}

/// Decode a frame, stopping at the first malformed packet.
///
/// The live feed uses this so that one bad packet at the tail of a frame does
/// not discard the ticks in front of it.
pub fn decode_partial(buffer: &[u8]) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();
    let mut offset = 0;

    while offset < buffer.len() {
        let tag = buffer[offset];
        let Some(kind) = PacketKind::from_tag(tag) else {
            outcome.error = Some(DecodeError::UnknownPacketType { tag, offset });
            break;
        };

        let stride = kind.stride();
        let available = buffer.len() - offset;
        if available < stride {
            outcome.error = Some(DecodeError::Truncated {
                kind,
                offset,
                needed: stride,
                available,
            });
            break;
        }

        let packet = &buffer[offset..offset + stride];
        outcome.ticks.push(decode_packet(kind, packet));
        offset += stride;
    }

    outcome
}

/// Convert a raw feed epoch to exchange-local seconds; non-positive means unknown.
pub fn adjust_epoch(raw: i32) -> i64 {
    if raw > 0 {
        raw as i64 + EXCHANGE_EPOCH_OFFSET_SECS
    } else {
        0
    }
}

/// Round to two decimal places, as the feed reports absolute change.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn decode_packet(kind: PacketKind, p: &[u8]) -> Tick {
    match kind {
        PacketKind::Ltp => {
            let mut tick = Tick::empty(kind, read_u32(p, 9));
            tick.last_traded_price = read_f32(p, 1);
            tick.last_traded_time = adjust_epoch(read_i32(p, 5));
            tick.tradable = p[13];
            tick.mode = p[14];
            tick.change_absolute = round2(read_f32(p, 15));
            tick.change_percent = read_f32(p, 19);
            tick
        }
        PacketKind::IndexLtp => {
            let mut tick = Tick::empty(kind, read_u32(p, 9));
            tick.last_traded_price = read_f32(p, 1);
            tick.last_updated_time = adjust_epoch(read_i32(p, 5));
            tick.tradable = p[13];
            tick.mode = p[14];
            tick.change_absolute = round2(read_f32(p, 15));
            tick.change_percent = read_f32(p, 19);
            tick
        }
        PacketKind::Quote => {
            let mut tick = Tick::empty(kind, read_u32(p, 9));
            tick.last_traded_price = read_f32(p, 1);
            tick.last_traded_time = adjust_epoch(read_i32(p, 5));
            tick.tradable = p[13];
            tick.mode = p[14];
            tick.last_traded_qty = read_i32(p, 15) as i64;
            tick.avg_traded_price = read_f32(p, 19);
            tick.volume_traded = read_i32(p, 23) as i64;
            tick.total_buy_qty = read_i32(p, 27) as i64;
            tick.total_sell_qty = read_i32(p, 31) as i64;
            tick.open = read_f32(p, 35);
            tick.close = read_f32(p, 39);
            tick.high = read_f32(p, 43);
            tick.low = read_f32(p, 47);
            tick.change_percent = read_f32(p, 51);
            tick.change_absolute = round2(read_f32(p, 55));
            tick.week52_high = read_f32(p, 59);
            tick.week52_low = read_f32(p, 63);
            tick
        }
        PacketKind::IndexQuote => {
            let mut tick = Tick::empty(kind, read_u32(p, 5));
            tick.last_traded_price = read_f32(p, 1);
            tick.tradable = p[9];
            tick.mode = p[10];
            read_index_ohlc(&mut tick, p);
            tick.week52_high = read_f32(p, 35);
            tick.week52_low = read_f32(p, 39);
            tick
        }
        PacketKind::IndexFull => {
            let mut tick = Tick::empty(kind, read_u32(p, 5));
            tick.last_traded_price = read_f32(p, 1);
            tick.tradable = p[9];
            tick.mode = p[10];
            read_index_ohlc(&mut tick, p);
            tick.last_updated_time = adjust_epoch(read_i32(p, 35));
            tick
        }
        PacketKind::Full => {
            let mut tick = Tick::empty(kind, read_u32(p, 109));
            tick.depth = (0..DEPTH_LEVELS)
                .map(|i| {
                    let base = 1 + i * DEPTH_LEVEL_SIZE;
                    DepthLevel {
                        level: i as u8,
                        buy_qty: read_i32(p, base) as i64,
                        sell_qty: read_i32(p, base + 4) as i64,
                        buy_orders: read_i16(p, base + 8) as i32,
                        sell_orders: read_i16(p, base + 10) as i32,
                        buy_price: read_f32(p, base + 12),
                        sell_price: read_f32(p, base + 16),
                    }
                })
                .collect();
            tick.last_traded_price = read_f32(p, 101);
            tick.last_traded_time = adjust_epoch(read_i32(p, 105));
            tick.tradable = p[113];
            tick.mode = p[114];
            tick.last_traded_qty = read_i32(p, 115) as i64;
            tick.avg_traded_price = read_f32(p, 119);
            tick.volume_traded = read_i32(p, 123) as i64;
            tick.total_buy_qty = read_i32(p, 127) as i64;
            tick.total_sell_qty = read_i32(p, 131) as i64;
            tick.open = read_f32(p, 135);
            tick.close = read_f32(p, 139);
            tick.high = read_f32(p, 143);
            tick.low = read_f32(p, 147);
            tick.change_percent = read_f32(p, 151);
            tick.change_absolute = round2(read_f32(p, 155));
            tick.week52_high = read_f32(p, 159);
            tick.week52_low = read_f32(p, 163);
            tick.open_interest = read_i32(p, 167) as i64;
            tick.oi_change = read_i32(p, 171) as i64;
            tick
        }
    }
}

// Index quote and index full share the same layout up to offset 35.
fn read_index_ohlc(tick: &mut Tick, p: &[u8]) {
    tick.open = read_f32(p, 11);
    tick.close = read_f32(p, 15);
    tick.high = read_f32(p, 19);
    tick.low = read_f32(p, 23);
    tick.change_percent = read_f32(p, 27);
    tick.change_absolute = round2(read_f32(p, 31));
}

// Callers only pass offsets inside a packet whose stride was checked.

fn read_f32(p: &[u8], at: usize) -> f64 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&p[at..at + 4]);
    f32::from_le_bytes(b) as f64
}

fn read_i32(p: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&p[at..at + 4]);
    i32::from_le_bytes(b)
}

fn read_u32(p: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&p[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_i16(p: &[u8], at: usize) -> i16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&p[at..at + 2]);
    i16::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::encoder::encode_tick;

    fn full_tick(security_id: u32, ltp: f64) -> Tick {
        let mut tick = Tick::empty(PacketKind::Full, security_id);
        tick.last_traded_price = ltp;
        tick.last_traded_time = 1_700_000_000 + EXCHANGE_EPOCH_OFFSET_SECS;
        tick.tradable = 1;
        tick.mode = 3;
        tick.last_traded_qty = 25;
        tick.avg_traded_price = 101.5;
        tick.volume_traded = 120_000;
        tick.total_buy_qty = 5_400;
        tick.total_sell_qty = 4_100;
        tick.open = 100.0;
        tick.close = 99.5;
        tick.high = 103.25;
        tick.low = 98.75;
        tick.change_percent = 1.5;
        tick.change_absolute = 1.25;
        tick.week52_high = 150.0;
        tick.week52_low = 80.0;
        tick.open_interest = 700;
        tick.oi_change = -20;
        tick.depth = (0..DEPTH_LEVELS)
            .map(|i| DepthLevel {
                level: i as u8,
                buy_qty: 100 + i as i64,
                sell_qty: 200 + i as i64,
                buy_orders: 3,
                sell_orders: 4,
                buy_price: ltp - 0.25 * (i as f64 + 1.0),
                sell_price: ltp + 0.25 * (i as f64 + 1.0),
            })
            .collect();
        tick
    }

    #[test]
    fn test_decode_mixed_frame_preserves_order() {
        let mut ltp = Tick::empty(PacketKind::Ltp, 3045);
        ltp.last_traded_price = 612.5;
        ltp.last_traded_time = 1_700_000_100 + EXCHANGE_EPOCH_OFFSET_SECS;
        ltp.change_absolute = -2.5;
        ltp.change_percent = -0.25;

        let mut index_full = Tick::empty(PacketKind::IndexFull, 13);
        index_full.last_traded_price = 22_150.5;
        index_full.open = 22_000.0;
        index_full.high = 22_200.0;
        index_full.low = 21_950.0;
        index_full.close = 22_010.0;
        index_full.last_updated_time = 1_700_000_200 + EXCHANGE_EPOCH_OFFSET_SECS;

        let full = full_tick(10753, 101.25);

        let mut frame = Vec::new();
        frame.extend(encode_tick(&ltp));
        frame.extend(encode_tick(&full));
        frame.extend(encode_tick(&index_full));
        assert_eq!(frame.len(), 23 + 175 + 39);

        let ticks = decode(&frame).unwrap();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0], ltp);
        assert_eq!(ticks[1], full);
        assert_eq!(ticks[2], index_full);
    }

    #[test]
    fn test_full_packet_depth_layout() {
        let frame = encode_tick(&full_tick(4668, 50.0));
        let ticks = decode(&frame).unwrap();
        let depth = &ticks[0].depth;
        assert_eq!(depth.len(), 5);
        assert_eq!(depth[0].buy_qty, 100);
        assert_eq!(depth[4].sell_qty, 204);
        assert_eq!(depth[0].buy_price, 49.75);
        assert_eq!(depth[4].sell_price, 51.25);
        assert_eq!(ticks[0].security_id, 4668);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let mut frame = encode_tick(&full_tick(1, 10.0));
        frame.push(99);
        frame.extend([0u8; 30]);

        let err = decode(&frame).unwrap_err();
        assert_eq!(err, DecodeError::UnknownPacketType { tag: 99, offset: 175 });

        let partial = decode_partial(&frame);
        assert_eq!(partial.ticks.len(), 1);
        assert!(partial.error.is_some());
    }

    #[test]
    fn test_truncated_packet() {
        let frame = encode_tick(&full_tick(1, 10.0));
        let err = decode(&frame[..100]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                kind: PacketKind::Full,
                offset: 0,
                needed: 175,
                available: 100,
            }
        );
    }

    #[test]
    fn test_empty_buffer() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_adjust_epoch() {
        assert_eq!(adjust_epoch(0), 0);
        assert_eq!(adjust_epoch(-5), 0);
        assert_eq!(adjust_epoch(1_000), 20_800);
    }

    #[test]
    fn test_change_absolute_rounded() {
        let mut frame = encode_tick(&Tick::empty(PacketKind::Ltp, 7));
        frame[15..19].copy_from_slice(&1.23456f32.to_le_bytes());
        let ticks = decode(&frame).unwrap();
        assert_eq!(ticks[0].change_absolute, 1.23);
    }
}
