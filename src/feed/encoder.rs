//! Packet encoder, the inverse of the decoder.
//!
//! Used by the simulated feed so that synthetic ticks travel the same decode
//! path as live frames.

use crate::types::{PacketKind, Tick};

use super::decoder::{DEPTH_LEVELS, DEPTH_LEVEL_SIZE, EXCHANGE_EPOCH_OFFSET_SECS};

/// Encode one tick into a packet of its kind's stride.
pub fn encode_tick(tick: &Tick) -> Vec<u8> {
    let mut p = vec![0u8; tick.kind.stride()];
    p[0] = tick.kind.tag();

    match tick.kind {
        PacketKind::Ltp | PacketKind::IndexLtp => {
            let time = if tick.kind == PacketKind::Ltp {
                tick.last_traded_time
            } else {
                tick.last_updated_time
            };
            put_f32(&mut p, 1, tick.last_traded_price);
            put_i32(&mut p, 5, raw_epoch(time));
            put_u32(&mut p, 9, tick.security_id);
            p[13] = tick.tradable;
            p[14] = tick.mode;
            put_f32(&mut p, 15, tick.change_absolute);
            put_f32(&mut p, 19, tick.change_percent);
        }
        PacketKind::Quote => {
            put_f32(&mut p, 1, tick.last_traded_price);
            put_i32(&mut p, 5, raw_epoch(tick.last_traded_time));
            put_u32(&mut p, 9, tick.security_id);
            p[13] = tick.tradable;
            p[14] = tick.mode;
            put_i32(&mut p, 15, tick.last_traded_qty as i32);
            put_f32(&mut p, 19, tick.avg_traded_price);
            put_i32(&mut p, 23, tick.volume_traded as i32);
            put_i32(&mut p, 27, tick.total_buy_qty as i32);
            put_i32(&mut p, 31, tick.total_sell_qty as i32);
            put_f32(&mut p, 35, tick.open);
            put_f32(&mut p, 39, tick.close);
            put_f32(&mut p, 43, tick.high);
            put_f32(&mut p, 47, tick.low);
            put_f32(&mut p, 51, tick.change_percent);
            put_f32(&mut p, 55, tick.change_absolute);
            put_f32(&mut p, 59, tick.week52_high);
            put_f32(&mut p, 63, tick.week52_low);
        }
        PacketKind::IndexQuote | PacketKind::IndexFull => {
            put_f32(&mut p, 1, tick.last_traded_price);
            put_u32(&mut p, 5, tick.security_id);
            p[9] = tick.tradable;
            p[10] = tick.mode;
            put_f32(&mut p, 11, tick.open);
            put_f32(&mut p, 15, tick.close);
            put_f32(&mut p, 19, tick.high);
            put_f32(&mut p, 23, tick.low);
            put_f32(&mut p, 27, tick.change_percent);
            put_f32(&mut p, 31, tick.change_absolute);
            if tick.kind == PacketKind::IndexQuote {
                put_f32(&mut p, 35, tick.week52_high);
                put_f32(&mut p, 39, tick.week52_low);
            } else {
                put_i32(&mut p, 35, raw_epoch(tick.last_updated_time));
            }
        }
        PacketKind::Full => {
            for (i, level) in tick.depth.iter().take(DEPTH_LEVELS).enumerate() {
                let base = 1 + i * DEPTH_LEVEL_SIZE;
                put_i32(&mut p, base, level.buy_qty as i32);
                put_i32(&mut p, base + 4, level.sell_qty as i32);
                put_i16(&mut p, base + 8, level.buy_orders as i16);
                put_i16(&mut p, base + 10, level.sell_orders as i16);
                put_f32(&mut p, base + 12, level.buy_price);
                put_f32(&mut p, base + 16, level.sell_price);
            }
            put_f32(&mut p, 101, tick.last_traded_price);
            put_i32(&mut p, 105, raw_epoch(tick.last_traded_time));
            put_u32(&mut p, 109, tick.security_id);
            p[113] = tick.tradable;
            p[114] = tick.mode;
            put_i32(&mut p, 115, tick.last_traded_qty as i32);
            put_f32(&mut p, 119, tick.avg_traded_price);
            put_i32(&mut p, 123, tick.volume_traded as i32);
            put_i32(&mut p, 127, tick.total_buy_qty as i32);
            put_i32(&mut p, 131, tick.total_sell_qty as i32);
            put_f32(&mut p, 135, tick.open);
            put_f32(&mut p, 139, tick.close);
            put_f32(&mut p, 143, tick.high);
            put_f32(&mut p, 147, tick.low);
            put_f32(&mut p, 151, tick.change_percent);
            put_f32(&mut p, 155, tick.change_absolute);
            put_f32(&mut p, 159, tick.week52_high);
            put_f32(&mut p, 163, tick.week52_low);
            put_i32(&mut p, 167, tick.open_interest as i32);
            put_i32(&mut p, 171, tick.oi_change as i32);
        }
    }

    p
}

/// Concatenate several ticks into one frame.
pub fn encode_frame(ticks: &[Tick]) -> Vec<u8> {
    ticks.iter().flat_map(encode_tick).collect()
}

fn raw_epoch(adjusted: i64) -> i32 {
    if adjusted > EXCHANGE_EPOCH_OFFSET_SECS {
        (adjusted - EXCHANGE_EPOCH_OFFSET_SECS) as i32
    } else {
        0
    }
}

fn put_f32(p: &mut [u8], at: usize, value: f64) {
    p[at..at + 4].copy_from_slice(&(value as f32).to_le_bytes());
}

fn put_i32(p: &mut [u8], at: usize, value: i32) {
    p[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(p: &mut [u8], at: usize, value: u32) {
    p[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i16(p: &mut [u8], at: usize, value: i16) {
    p[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_is_sum_of_strides() {
        let ticks = vec![
            Tick::empty(PacketKind::Quote, 1),
            Tick::empty(PacketKind::IndexQuote, 2),
        ];
        let frame = encode_frame(&ticks);
        assert_eq!(frame.len(), 67 + 43);
        assert_eq!(frame[0], 62);
        assert_eq!(frame[67], 65);
    }
}
