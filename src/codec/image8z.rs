//! 8-bit delta + RLE codec for image planes
//!
//! Same nibble packing and zero-pair runs as the 16-bit codec. A sample
//! whose delta does not fit a nibble is split across a nibble pair:
//! - with no nibble pending, `0xF0 | (v >> 4)` is written and `v & 0xF`
//!   becomes the pending high nibble of the next byte;
//! - with a nibble pending, the byte gets `0xF` as its low nibble and the
//!   full sample follows.
//!
//! A trailing unpaired nibble is padded with `0xD`.

use crate::cursor::{SliceReader, SliceWriter};
use crate::{OniError, Result};

use super::ZeroRun;

const NIBBLE_RANGE: i32 = 6;
const FULL_BYTE_NIBBLE: u8 = 0x0F;
const PAD_NIBBLE: u8 = 0x0D;
const RUN_BASE: u8 = 0xE0;
const SPLIT_BASE: u8 = 0xF0;

#[derive(Clone, Copy)]
struct Pending {
    high: u8,
    /// Set when `high` carries the low half of a split sample
    split: bool,
}

pub(super) fn compress(input: &[u8], w: &mut SliceWriter<'_>) -> Result<()> {
    let Some((&first, rest)) = input.split_first() else {
        return Ok(());
    };
    w.put_u8(first)?;

    let mut last = first;
    let mut pending: Option<Pending> = None;
    let mut zeros = ZeroRun::new();

    for &current in rest {
        let delta = i32::from(last) - i32::from(current);
        if delta.abs() <= NIBBLE_RANGE {
            let nibble = (delta + NIBBLE_RANGE) as u8;
            match pending.take() {
                None => {
                    pending = Some(Pending {
                        high: nibble,
                        split: false,
                    });
                }
                Some(p) => {
                    let pair = (p.high << 4) | nibble;
                    if pair == ZeroRun::PAIR && !p.split {
                        zeros.push(w)?;
                    } else {
                        zeros.flush(w)?;
                        w.put_u8(pair)?;
                    }
                }
            }
        } else {
            zeros.flush(w)?;
            match pending.take() {
                None => {
                    w.put_u8(SPLIT_BASE | (current >> 4))?;
                    pending = Some(Pending {
                        high: current & 0x0F,
                        split: true,
                    });
                }
                Some(p) => {
                    w.put_u8((p.high << 4) | FULL_BYTE_NIBBLE)?;
                    w.put_u8(current)?;
                }
            }
        }
        last = current;
    }

    zeros.flush(w)?;
    if let Some(p) = pending {
        w.put_u8((p.high << 4) | PAD_NIBBLE)?;
    }
    Ok(())
}

pub(super) fn decompress(r: &mut SliceReader<'_>, w: &mut SliceWriter<'_>) -> Result<()> {
    if r.is_empty() {
        return Ok(());
    }
    let mut last = r.get_u8()?;
    w.put_u8(last)?;

    let apply = |last: u8, nibble: u8| -> u8 {
        (i32::from(last) - (i32::from(nibble) - NIBBLE_RANGE)) as u8
    };

    while !r.is_empty() {
        let offset = r.position() as u64;
        let byte = r.get_u8()?;
        let low = if byte >= SPLIT_BASE {
            let second = r.get_u8()?;
            last = ((byte & 0x0F) << 4) | (second >> 4);
            w.put_u8(last)?;
            second & 0x0F
        } else if byte >= RUN_BASE {
            for _ in 0..2 * (byte - RUN_BASE) {
                w.put_u8(last)?;
            }
            continue;
        } else {
            let high = byte >> 4;
            if i32::from(high) > 2 * NIBBLE_RANGE {
                return Err(OniError::corrupt(offset, format!("bad delta byte {byte:#04x}")));
            }
            last = apply(last, high);
            w.put_u8(last)?;
            byte & 0x0F
        };

        match low {
            FULL_BYTE_NIBBLE => {
                last = r.get_u8()?;
                w.put_u8(last)?;
            }
            PAD_NIBBLE => {}
            _ if i32::from(low) <= 2 * NIBBLE_RANGE => {
                last = apply(last, low);
                w.put_u8(last)?;
            }
            _ => {
                return Err(OniError::corrupt(offset, format!("bad low nibble in {byte:#04x}")));
            }
        }
    }
    Ok(())
}
