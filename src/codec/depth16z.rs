//! 16-bit delta + RLE codec for depth maps
//!
//! Stream layout:
//! - the first sample as a little-endian `u16`;
//! - deltas `prev - cur` within -6..=6 as nibbles `delta + 6`, two per
//!   byte, high nibble first;
//! - runs of zero-delta pairs as `0xE0 + n` (n <= 15);
//! - larger deltas as an escape (`0xFF`, or `0xF` in the low nibble after a
//!   pending nibble) followed by `delta + 192` when the delta fits in
//!   -63..=63, or the sample as a big-endian 15-bit literal;
//! - a trailing unpaired nibble padded with `0xD`.
//!
//! The table variant prefixes a `u16` count and the sorted distinct sample
//! values, then runs the same stream over indices into that table.

use crate::cursor::{SliceReader, SliceWriter};
use crate::{OniError, Result};

use super::ZeroRun;

const NIBBLE_RANGE: i32 = 6;
const EXTENDED_RANGE: i32 = 63;
const EXTENDED_BIAS: i32 = 192;
const ESCAPE: u8 = 0xFF;
const ESCAPE_NIBBLE: u8 = 0x0F;
const PAD_NIBBLE: u8 = 0x0D;
const RUN_BASE: u8 = 0xE0;
const LITERAL_LIMIT: u16 = 0x8000;

fn samples(input: &[u8]) -> Result<impl Iterator<Item = u16> + '_> {
    if input.len() % 2 != 0 {
        return Err(OniError::BadParameter(format!(
            "16-bit frame has odd length {}",
            input.len()
        )));
    }
    Ok(input
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]])))
}

pub(super) fn compress(input: &[u8], w: &mut SliceWriter<'_>) -> Result<()> {
    encode_stream(samples(input)?, w)
}

pub(super) fn compress_with_table(
    input: &[u8],
    max_value: u32,
    w: &mut SliceWriter<'_>,
) -> Result<()> {
    let mut present = vec![false; max_value as usize];
    for sample in samples(input)? {
        let slot = present.get_mut(usize::from(sample)).ok_or_else(|| {
            OniError::BadParameter(format!("sample {sample} not below table bound {max_value}"))
        })?;
        *slot = true;
    }

    let mut index_of = vec![0u16; present.len()];
    let mut table = Vec::new();
    for (value, _) in present.iter().enumerate().filter(|(_, p)| **p) {
        index_of[value] = table.len() as u16;
        table.push(value as u16);
    }

    let count = u16::try_from(table.len())
        .map_err(|_| OniError::BadParameter("embedded table exceeds 65535 values".to_string()))?;
    w.put_u16(count)?;
    for value in &table {
        w.put_u16(*value)?;
    }
    encode_stream(samples(input)?.map(|s| index_of[usize::from(s)]), w)
}

pub(super) fn decompress(r: &mut SliceReader<'_>, w: &mut SliceWriter<'_>) -> Result<()> {
    decode_stream(r, |value| w.put_u16(value))
}

pub(super) fn decompress_with_table(
    r: &mut SliceReader<'_>,
    w: &mut SliceWriter<'_>,
) -> Result<()> {
    let count = usize::from(r.get_u16()?);
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        table.push(r.get_u16()?);
    }
    let base = r.position();
    decode_stream(r, |index| {
        let value = table.get(usize::from(index)).ok_or_else(|| {
            OniError::corrupt(base as u64, format!("table index {index} out of {count}"))
        })?;
        w.put_u16(*value)
    })
}

fn encode_stream(mut samples: impl Iterator<Item = u16>, w: &mut SliceWriter<'_>) -> Result<()> {
    let Some(first) = samples.next() else {
        return Ok(());
    };
    w.put_u16(first)?;

    let mut last = first;
    let mut pending: Option<u8> = None;
    let mut zeros = ZeroRun::new();

    for current in samples {
        let delta = i32::from(last) - i32::from(current);
        if delta.abs() <= NIBBLE_RANGE {
            let nibble = (delta + NIBBLE_RANGE) as u8;
            match pending.take() {
                None => pending = Some(nibble),
                Some(high) => {
                    let pair = (high << 4) | nibble;
                    if pair == ZeroRun::PAIR {
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
                None => w.put_u8(ESCAPE)?,
                Some(high) => w.put_u8((high << 4) | ESCAPE_NIBBLE)?,
            }
            if delta.abs() <= EXTENDED_RANGE {
                w.put_u8((delta + EXTENDED_BIAS) as u8)?;
            } else if current < LITERAL_LIMIT {
                w.put_bytes(&current.to_be_bytes())?;
            } else {
                return Err(OniError::BadParameter(format!(
                    "sample {current:#x} too large for a 15-bit literal"
                )));
            }
        }
        last = current;
    }

    zeros.flush(w)?;
    if let Some(high) = pending {
        w.put_u8((high << 4) | PAD_NIBBLE)?;
    }
    Ok(())
}

fn decode_stream(
    r: &mut SliceReader<'_>,
    mut emit: impl FnMut(u16) -> Result<()>,
) -> Result<()> {
    if r.is_empty() {
        return Ok(());
    }
    let mut last = r.get_u16()?;
    emit(last)?;

    let apply = |last: u16, nibble: u8| -> u16 {
        (i32::from(last) - (i32::from(nibble) - NIBBLE_RANGE)) as u16
    };

    while !r.is_empty() {
        let offset = r.position() as u64;
        let byte = r.get_u8()?;
        if byte < RUN_BASE {
            let high = byte >> 4;
            let low = byte & 0x0F;
            if i32::from(high) > 2 * NIBBLE_RANGE {
                return Err(OniError::corrupt(offset, format!("bad delta byte {byte:#04x}")));
            }
            last = apply(last, high);
            emit(last)?;
            match low {
                ESCAPE_NIBBLE => {
                    last = read_escaped(r, last)?;
                    emit(last)?;
                }
                PAD_NIBBLE => {}
                _ if i32::from(low) <= 2 * NIBBLE_RANGE => {
                    last = apply(last, low);
                    emit(last)?;
                }
                _ => {
                    return Err(OniError::corrupt(offset, format!("bad delta byte {byte:#04x}")));
                }
            }
        } else if byte == ESCAPE {
            last = read_escaped(r, last)?;
            emit(last)?;
        } else if byte < 0xF0 {
            for _ in 0..2 * (byte - RUN_BASE) {
                emit(last)?;
            }
        } else {
            return Err(OniError::corrupt(offset, format!("bad control byte {byte:#04x}")));
        }
    }
    Ok(())
}

fn read_escaped(r: &mut SliceReader<'_>, last: u16) -> Result<u16> {
    let byte = r.get_u8()?;
    if byte & 0x80 != 0 {
        let delta = i32::from(byte) - EXTENDED_BIAS;
        Ok((i32::from(last) - delta) as u16)
    } else {
        Ok(u16::from_be_bytes([byte, r.get_u8()?]))
    }
}
