//! The block walk shared by pack, unpack and commit
//!
//! A datatype is flattened into the runs of bytes it describes, in type map order. Adjacent runs
//! are merged, so a contiguous stretch of data is always reported as a single block no matter
//! how many leaves of the datatype tree it is made of. Bound markers contribute nothing.

use smallvec::SmallVec;

use super::{Datatype, Shape};
use crate::Address;

/// Merges runs that continue where the previous one ended.
struct Coalescer<F: FnMut(Address, usize)> {
    pending: Option<(Address, usize)>,
    sink: F,
}

impl<F: FnMut(Address, usize)> Coalescer<F> {
    fn push(&mut self, offset: Address, len: usize) {
        if len == 0 {
            return;
        }
        match self.pending {
            Some((start, ref mut run)) if start + *run as Address == offset => *run += len,
            _ => {
                if let Some((start, run)) = self.pending.take() {
                    (self.sink)(start, run);
                }
                self.pending = Some((offset, len));
            }
        }
    }

    fn finish(mut self) {
        if let Some((start, run)) = self.pending.take() {
            (self.sink)(start, run);
        }
    }
}

// Offsets stay within the bounds that were overflow-checked when the datatype was built.
fn walk<F: FnMut(Address, usize)>(datatype: &Datatype, base: Address, out: &mut Coalescer<F>) {
    if datatype.size() == 0 {
        return;
    }
    if datatype.is_contiguous() {
        out.push(base + datatype.true_lower_bound(), datatype.size());
        return;
    }
    match *datatype.shape() {
        Shape::Basic => out.push(base, datatype.size()),
        Shape::LowerBound | Shape::UpperBound => {}
        Shape::Contiguous { count, ref old } => {
            let extent = old.extent();
            for i in 0..count {
                walk(old, base + i as Address * extent, out);
            }
        }
        Shape::Vector {
            count,
            blocklength,
            stride,
            ref old,
        } => {
            let extent = old.extent();
            for i in 0..count {
                let start = base + i as Address * stride;
                for j in 0..blocklength {
                    walk(old, start + j as Address * extent, out);
                }
            }
        }
        Shape::Indexed {
            ref blocks,
            ref old,
        } => {
            let extent = old.extent();
            for &(blocklength, disp) in blocks {
                for j in 0..blocklength {
                    walk(old, base + disp + j as Address * extent, out);
                }
            }
        }
        Shape::Struct { ref members } => {
            for (blocklength, disp, member) in members {
                let extent = member.extent();
                for j in 0..*blocklength {
                    walk(member, base + *disp + j as Address * extent, out);
                }
            }
        }
        Shape::Resized { ref old } => walk(old, base, out),
    }
}

/// Calls `f(offset, len)` for every maximal run of bytes described by `count` consecutive
/// elements of `datatype`, in type map order.
pub(crate) fn for_each_block<F>(datatype: &Datatype, count: usize, f: F)
where
    F: FnMut(Address, usize),
{
    let mut out = Coalescer {
        pending: None,
        sink: f,
    };
    let extent = datatype.extent();
    for k in 0..count {
        walk(datatype, k as Address * extent, &mut out);
    }
    out.finish();
}

/// The runs of one element of `datatype`
pub(crate) fn blocks(datatype: &Datatype) -> SmallVec<[(Address, usize); 8]> {
    let mut blocks = SmallVec::new();
    for_each_block(datatype, 1, |offset, len| blocks.push((offset, len)));
    blocks
}

/// Whether one element of `datatype` is a single run starting at its lower bound.
pub(crate) fn is_single_run(datatype: &Datatype) -> bool {
    let blocks = blocks(datatype);
    match blocks.as_slice() {
        [] => true,
        [(offset, len)] => *offset == datatype.lower_bound() && *len == datatype.size(),
        _ => false,
    }
}

/// Lowest and one-past-highest byte offset touched by `count` elements of `datatype`
pub(crate) fn data_span(datatype: &Datatype, count: usize) -> Option<(Address, Address)> {
    if count == 0 || datatype.size() == 0 {
        return None;
    }
    let last = (count as Address - 1).checked_mul(datatype.extent())?;
    let low = datatype.true_lower_bound().min(datatype.true_lower_bound().checked_add(last)?);
    let high = datatype.true_upper_bound().max(datatype.true_upper_bound().checked_add(last)?);
    Some((low, high))
}
