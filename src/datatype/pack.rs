//! Packing and unpacking
//!
//! `pack` gathers the bytes that `count` elements of a datatype describe from a buffer into a
//! contiguous stream, `unpack` scatters a stream back. The stream position is advanced past the
//! bytes consumed or produced, so several buffers can be packed one after another.
//!
//! # Standard section(s)
//!
//! 4.2

use std::ptr;

use conv::ConvUtil;
use log::trace;

use super::{layout, Buffer, BufferMut, Datatype};
use crate::error::{Error, ErrorKind, Result};
use crate::Count;

/// Safety margin added by `packed_size` on top of the data bytes
///
/// Covers a conversion of the largest predefined type to a different representation.
pub const PACK_HEADROOM: usize = 16;

pub(crate) fn element_count(count: Count) -> Result<usize> {
    count.value_as::<usize>().map_err(|_| {
        Error::with_detail(
            ErrorKind::InvalidCount,
            format!("count must not be negative, got {}", count),
        )
    })
}

/// Number of data bytes in `count` elements of `datatype`
pub(crate) fn data_bytes(count: usize, datatype: &Datatype) -> Result<usize> {
    count.checked_mul(datatype.size()).ok_or_else(|| {
        Error::with_detail(ErrorKind::InvalidCount, "message size overflows")
    })
}

/// Checks that `count` elements of `datatype` may be moved to or from a buffer of `span` bytes.
pub(crate) fn check_buffer(span: usize, count: usize, datatype: &Datatype) -> Result<()> {
    if !datatype.is_committed() {
        return Err(Error::new(ErrorKind::UncommittedType));
    }
    data_bytes(count, datatype)?;
    match layout::data_span(datatype, count) {
        None if count == 0 || datatype.size() == 0 => Ok(()),
        Some((low, high)) if low >= 0 && high.value_as::<usize>().map_or(false, |h| h <= span) => {
            Ok(())
        }
        _ => Err(Error::with_detail(
            ErrorKind::InvalidArgument,
            format!(
                "{} elements of the datatype do not fit into a buffer of {} bytes",
                count, span
            ),
        )),
    }
}

/// Gathers `count` elements from `src` into `out`, returns the number of bytes written.
///
/// # Safety
///
/// `src` must be valid for reads of `span` bytes, `check_buffer(span, count, datatype)` must
/// have succeeded and `out` must hold at least `count * datatype.size()` bytes.
pub(crate) unsafe fn gather(src: *const u8, count: usize, datatype: &Datatype, out: &mut [u8]) -> usize {
    let mut position = 0;
    let dst = out.as_mut_ptr();
    layout::for_each_block(datatype, count, |offset, len| {
        trace!("pack run of {} bytes at offset {}", len, offset);
        ptr::copy_nonoverlapping(src.offset(offset), dst.add(position), len);
        position += len;
    });
    position
}

/// Scatters the front of `input` into `count` elements at `dst`, returns the number of bytes
/// read.
///
/// # Safety
///
/// `dst` must be valid for writes of `span` bytes, `check_buffer(span, count, datatype)` must
/// have succeeded and `input` must hold at least `count * datatype.size()` bytes.
pub(crate) unsafe fn scatter(input: &[u8], dst: *mut u8, count: usize, datatype: &Datatype) -> usize {
    let mut position = 0;
    let src = input.as_ptr();
    layout::for_each_block(datatype, count, |offset, len| {
        trace!("unpack run of {} bytes at offset {}", len, offset);
        ptr::copy_nonoverlapping(src.add(position), dst.offset(offset), len);
        position += len;
    });
    position
}

fn stream_room(stream_len: usize, position: usize, needed: usize) -> Result<()> {
    let room = stream_len.checked_sub(position).unwrap_or(0);
    if room < needed {
        Err(Error::with_detail(
            ErrorKind::MessageTruncated,
            format!("{} bytes needed, {} left in the stream", needed, room),
        ))
    } else {
        Ok(())
    }
}

/// Packs the contents of `inbuf` into `outbuf` starting at `position`.
///
/// On success `position` is advanced past the packed bytes.
///
/// # Errors
///
/// - `UncommittedType` if the datatype of `inbuf` was never committed
/// - `MessageTruncated` if fewer than `count * size` bytes remain after `position`
/// - `InvalidArgument` if the datatype reaches outside of `inbuf`
pub fn pack<B: ?Sized + Buffer>(inbuf: &B, outbuf: &mut [u8], position: &mut usize) -> Result<()> {
    let datatype = inbuf.as_datatype();
    let count = element_count(inbuf.count())?;
    check_buffer(inbuf.span(), count, &datatype)?;
    let needed = data_bytes(count, &datatype)?;
    stream_room(outbuf.len(), *position, needed)?;
    // Safety: the layout was checked against the span of `inbuf` and the stream has room.
    let written = unsafe { gather(inbuf.pointer(), count, &datatype, &mut outbuf[*position..]) };
    *position += written;
    Ok(())
}

/// Unpacks from `inbuf` starting at `position` into `outbuf`.
///
/// On success `position` is advanced past the consumed bytes. Bytes of `outbuf` that its
/// datatype does not describe are left untouched.
///
/// # Errors
///
/// - `UncommittedType` if the datatype of `outbuf` was never committed
/// - `MessageTruncated` if fewer than `count * size` bytes remain after `position`
/// - `InvalidArgument` if the datatype reaches outside of `outbuf`
pub fn unpack<B: ?Sized + BufferMut>(inbuf: &[u8], position: &mut usize, outbuf: &mut B) -> Result<()> {
    let datatype = outbuf.as_datatype();
    let count = element_count(outbuf.count())?;
    check_buffer(outbuf.span(), count, &datatype)?;
    let needed = data_bytes(count, &datatype)?;
    stream_room(inbuf.len(), *position, needed)?;
    // Safety: the layout was checked against the span of `outbuf` and the stream holds enough.
    let read = unsafe { scatter(&inbuf[*position..], outbuf.pointer_mut(), count, &datatype) };
    *position += read;
    Ok(())
}

/// Packs `count` elements of `datatype` laid out in the bytes `input`.
pub fn pack_bytes(
    input: &[u8],
    count: Count,
    datatype: &Datatype,
    output: &mut [u8],
    position: &mut usize,
) -> Result<()> {
    let count = element_count(count)?;
    check_buffer(input.len(), count, datatype)?;
    let needed = data_bytes(count, datatype)?;
    stream_room(output.len(), *position, needed)?;
    // Safety: checked as in `pack`.
    let written = unsafe { gather(input.as_ptr(), count, datatype, &mut output[*position..]) };
    *position += written;
    Ok(())
}

/// Unpacks `count` elements of `datatype` into the bytes `output`.
pub fn unpack_bytes(
    input: &[u8],
    position: &mut usize,
    output: &mut [u8],
    count: Count,
    datatype: &Datatype,
) -> Result<()> {
    let count = element_count(count)?;
    check_buffer(output.len(), count, datatype)?;
    let needed = data_bytes(count, datatype)?;
    stream_room(input.len(), *position, needed)?;
    // Safety: checked as in `unpack`.
    let read = unsafe { scatter(&input[*position..], output.as_mut_ptr(), count, datatype) };
    *position += read;
    Ok(())
}

/// Upper bound on the number of bytes `pack` writes for `count` elements of `datatype`
///
/// # Standard section(s)
///
/// 4.2
pub fn packed_size(count: Count, datatype: &Datatype) -> Result<usize> {
    let count = element_count(count)?;
    data_bytes(count, datatype)?
        .checked_add(PACK_HEADROOM)
        .ok_or_else(|| Error::with_detail(ErrorKind::InvalidCount, "message size overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{Equivalence, MutView, View};

    fn as_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn pack_vector_scenario() {
        let ints: Vec<i32> = (0..12).collect();
        let t = Datatype::vector(3, 2, 4, &i32::equivalent_datatype())
            .unwrap()
            .committed();
        let mut out = vec![0u8; packed_size(1, &t).unwrap()];
        let mut position = 0;
        pack(&View::with_count_and_datatype(&ints[..], 1, &t), &mut out, &mut position).unwrap();
        assert_eq!(position, 24);
        assert!(out.len() >= 24);
        assert_eq!(&out[..24], &as_bytes(&[0, 1, 4, 5, 8, 9])[..]);
    }

    #[test]
    fn uncommitted_types_cannot_move_data() {
        let ints = [0i32; 4];
        let t = Datatype::contiguous(2, &i32::equivalent_datatype()).unwrap();
        let mut out = [0u8; 64];
        let mut position = 0;
        let err = pack(&View::with_count_and_datatype(&ints[..], 1, &t), &mut out, &mut position)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UncommittedType);
        assert_eq!(position, 0);
    }

    #[test]
    fn short_stream_is_truncation() {
        let ints = [1i32, 2, 3];
        let mut out = [0u8; 16];
        let mut position = 8;
        let err = pack(&ints[..], &mut out, &mut position).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageTruncated);
        assert_eq!(position, 8);

        let mut back = [0i32; 3];
        let mut position = 0;
        let err = unpack(&out[..8], &mut position, &mut back[..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageTruncated);
    }

    #[test]
    fn layout_outside_of_buffer_is_rejected() {
        let ints = [0i32; 4];
        let t = Datatype::vector(2, 1, 4, &i32::equivalent_datatype())
            .unwrap()
            .committed();
        let mut out = [0u8; 64];
        let mut position = 0;
        let err = pack(&View::with_count_and_datatype(&ints[..], 1, &t), &mut out, &mut position)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unpack_leaves_gaps_untouched() {
        let t = Datatype::structured(
            &[1, 1],
            &[0, 8],
            &[i32::equivalent_datatype(), i32::equivalent_datatype()],
        )
        .unwrap()
        .committed();
        let stream = as_bytes(&[7, 9]);
        let mut target = [-1i32; 3];
        let mut position = 0;
        unpack(
            &stream,
            &mut position,
            &mut MutView::with_count_and_datatype(&mut target[..], 1, &t),
        )
        .unwrap();
        assert_eq!(position, 8);
        assert_eq!(target, [7, -1, 9]);
    }

    #[test]
    fn consecutive_packs_append() {
        let a = [1u16, 2];
        let b = [3u16];
        let mut out = [0u8; 6];
        let mut position = 0;
        pack(&a[..], &mut out, &mut position).unwrap();
        pack(&b[..], &mut out, &mut position).unwrap();
        assert_eq!(position, 6);

        let mut back = [0u16; 3];
        let mut position = 0;
        unpack(&out, &mut position, &mut back[..]).unwrap();
        assert_eq!(back, [1, 2, 3]);
    }

    #[test]
    fn byte_level_round_trip() {
        let t = Datatype::indexed(&[1, 2], &[2, 0], &u8::equivalent_datatype())
            .unwrap()
            .committed();
        let input = [10u8, 11, 12, 13];
        let mut stream = [0u8; 3];
        let mut position = 0;
        pack_bytes(&input, 1, &t, &mut stream, &mut position).unwrap();
        assert_eq!(stream, [12, 10, 11]);

        let mut output = [0u8; 4];
        let mut position = 0;
        unpack_bytes(&stream, &mut position, &mut output, 1, &t).unwrap();
        assert_eq!(output, [10, 11, 12, 0]);
    }

    #[test]
    fn packed_size_has_headroom() {
        let t = f64::equivalent_datatype();
        assert_eq!(packed_size(4, &t).unwrap(), 32 + PACK_HEADROOM);
        assert_eq!(packed_size(-1, &t).unwrap_err().kind(), ErrorKind::InvalidCount);
    }
}
