//! Describing data
//!
//! A [`Datatype`] describes a memory layout: which bytes, relative to the start of a buffer,
//! make up one element of a message. The predefined datatypes directly correspond to Rust
//! primitive types, such as `f64`, and are tied to them by the [`Equivalence`] trait. Starting
//! from those, derived datatypes describe strided, indexed and nested layouts, e.g. the layout of
//! a struct or all elements of a column of a dense matrix stored in row-major order.
//!
//! A derived datatype must be [committed](Datatype::commit) before it can move data. Its size,
//! extent and bounds are computed once when it is constructed; committing it only analyses
//! whether its data forms a single contiguous run, which lets pack and unpack copy in bulk.
//!
//! A [`Buffer`] describes a specific piece of data in memory: where it begins, how many
//! instances of its datatype it contains and how far it reaches. The `Buffer` trait is
//! implemented for slices of types implementing `Equivalence`. [`View`] and [`MutView`] describe
//! the contents of a slice with an arbitrary datatype; the request engine checks that the layout
//! stays within the slice before it touches any byte.
//!
//! # Standard section(s)
//!
//! 4.1

use std::borrow::Borrow;
use std::fmt;
use std::mem;
use std::sync::Arc;

use conv::ConvUtil;
use once_cell::sync::{Lazy, OnceCell};
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, Result};
use crate::{Address, Count};

pub(crate) mod layout;
pub mod pack;

/// Datatype traits
pub mod traits {
    pub use super::{AsDatatype, Buffer, BufferMut, Collection, Equivalence, Pointer, PointerMut};
}

#[cfg(feature = "derive")]
pub use mpi_derive::Equivalence;

/// How a datatype was constructed
///
/// # Standard section(s)
///
/// 4.1.13
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Combiner {
    /// A predefined datatype or bound marker
    Named,
    /// `Datatype::contiguous`, also the result of a vector whose stride equals its block length
    Contiguous,
    /// `Datatype::vector`
    Vector,
    /// `Datatype::heterogeneous_vector`
    HVector,
    /// `Datatype::indexed`
    Indexed,
    /// `Datatype::heterogeneous_indexed`
    HIndexed,
    /// `Datatype::indexed_block`
    IndexedBlock,
    /// `Datatype::heterogeneous_indexed_block`
    HIndexedBlock,
    /// `Datatype::structured`
    Struct,
    /// `Datatype::resized`
    Resized,
    /// `Datatype::subarray`
    Subarray,
}

/// Storage order of the dimensions of a subarray
///
/// # Standard section(s)
///
/// 4.1.3
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Order {
    /// Row-major order, the last dimension varies fastest.
    C,
    /// Column-major order, the first dimension varies fastest.
    Fortran,
}

pub(crate) enum Shape {
    Basic,
    LowerBound,
    UpperBound,
    Contiguous {
        count: usize,
        old: Datatype,
    },
    Vector {
        count: usize,
        blocklength: usize,
        stride: Address,
        old: Datatype,
    },
    Indexed {
        blocks: SmallVec<[(usize, Address); 4]>,
        old: Datatype,
    },
    Struct {
        members: SmallVec<[(usize, Address, Datatype); 4]>,
    },
    Resized {
        old: Datatype,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Bounds {
    lb: Address,
    ub: Address,
    true_lb: Address,
    true_ub: Address,
    lb_marker: bool,
    ub_marker: bool,
}

struct TypeDesc {
    shape: Shape,
    combiner: Combiner,
    name: Option<&'static str>,
    permanent: bool,
    size: usize,
    bounds: Bounds,
    contiguous: bool,
    // Set once by `commit`, holds the contiguity found by the commit-time analysis.
    committed: OnceCell<bool>,
}

/// A datatype describing the memory layout of one element of a message
///
/// Datatypes are immutable and cheap to clone; clones share the description. A derived datatype
/// keeps the datatypes it was built from alive for as long as it exists itself.
///
/// # Standard section(s)
///
/// 4.1
#[derive(Clone)]
pub struct Datatype(Arc<TypeDesc>);

fn overflow() -> Error {
    Error::with_detail(ErrorKind::InvalidArgument, "displacement arithmetic overflows")
}

fn checked(value: Option<Address>) -> Result<Address> {
    value.ok_or_else(overflow)
}

// Lossless on every supported target, `Address` is at least 32 bits wide.
fn widen(value: Count) -> Address {
    value as Address
}

fn to_address(value: usize) -> Result<Address> {
    value.value_as::<Address>().map_err(|_| overflow())
}

fn non_negative(value: Count, kind: ErrorKind, what: &str) -> Result<usize> {
    value
        .value_as::<usize>()
        .map_err(|_| Error::with_detail(kind, format!("{} must not be negative, got {}", what, value)))
}

#[derive(Default)]
struct BoundsBuilder {
    lb: Option<Address>,
    ub: Option<Address>,
    lb_marker: Option<Address>,
    ub_marker: Option<Address>,
    true_lb: Option<Address>,
    true_ub: Option<Address>,
}

fn min_of(current: Option<Address>, value: Address) -> Option<Address> {
    Some(current.map_or(value, |c| c.min(value)))
}

fn max_of(current: Option<Address>, value: Address) -> Option<Address> {
    Some(current.map_or(value, |c| c.max(value)))
}

impl BoundsBuilder {
    /// Accounts for `blocklength` consecutive copies of `datatype` starting at byte `disp`.
    fn add_block(&mut self, disp: Address, blocklength: usize, datatype: &Datatype) -> Result<()> {
        if blocklength == 0 {
            return Ok(());
        }
        let span = checked(to_address(blocklength - 1)?.checked_mul(datatype.extent()))?;
        let (low, high) = (span.min(0), span.max(0));
        let b = datatype.0.bounds;

        let lb = checked(disp.checked_add(b.lb).and_then(|v| v.checked_add(low)))?;
        let ub = checked(disp.checked_add(b.ub).and_then(|v| v.checked_add(high)))?;
        self.lb = min_of(self.lb, lb);
        self.ub = max_of(self.ub, ub);
        if b.lb_marker {
            self.lb_marker = min_of(self.lb_marker, lb);
        }
        if b.ub_marker {
            self.ub_marker = max_of(self.ub_marker, ub);
        }
        if datatype.size() > 0 {
            let true_lb = checked(disp.checked_add(b.true_lb).and_then(|v| v.checked_add(low)))?;
            let true_ub = checked(disp.checked_add(b.true_ub).and_then(|v| v.checked_add(high)))?;
            self.true_lb = min_of(self.true_lb, true_lb);
            self.true_ub = max_of(self.true_ub, true_ub);
        }
        Ok(())
    }

    fn finish(self) -> Bounds {
        // Explicit markers are sticky: once present they define the bound.
        Bounds {
            lb: self.lb_marker.or(self.lb).unwrap_or(0),
            ub: self.ub_marker.or(self.ub).unwrap_or(0),
            true_lb: self.true_lb.unwrap_or(0),
            true_ub: self.true_ub.unwrap_or(0),
            lb_marker: self.lb_marker.is_some(),
            ub_marker: self.ub_marker.is_some(),
        }
    }
}

impl Datatype {
    fn predefined(name: &'static str, size: usize) -> Datatype {
        let extent = size.value_as::<Address>().unwrap_or(Address::MAX);
        let committed = OnceCell::new();
        let _ = committed.set(true);
        Datatype(Arc::new(TypeDesc {
            shape: Shape::Basic,
            combiner: Combiner::Named,
            name: Some(name),
            permanent: true,
            size,
            bounds: Bounds {
                ub: extent,
                true_ub: extent,
                ..Default::default()
            },
            contiguous: true,
            committed,
        }))
    }

    fn marker(name: &'static str, shape: Shape) -> Datatype {
        let bounds = Bounds {
            lb_marker: matches!(shape, Shape::LowerBound),
            ub_marker: matches!(shape, Shape::UpperBound),
            ..Default::default()
        };
        let committed = OnceCell::new();
        let _ = committed.set(true);
        Datatype(Arc::new(TypeDesc {
            shape,
            combiner: Combiner::Named,
            name: Some(name),
            permanent: true,
            size: 0,
            bounds,
            contiguous: true,
            committed,
        }))
    }

    /// Computes size, bounds and contiguity of a derived shape.
    fn derive(shape: Shape, combiner: Combiner) -> Result<Datatype> {
        let mut builder = BoundsBuilder::default();
        let mut size: usize = 0;
        let mut add_size = |blocklength: usize, datatype: &Datatype| -> Result<()> {
            size = blocklength
                .checked_mul(datatype.size())
                .and_then(|s| s.checked_add(size))
                .ok_or_else(overflow)?;
            Ok(())
        };

        let (bounds, candidate) = match shape {
            Shape::Contiguous { count, ref old } => {
                builder.add_block(0, count, old)?;
                add_size(count, old)?;
                (builder.finish(), old.is_contiguous())
            }
            Shape::Vector {
                count,
                blocklength,
                stride,
                ref old,
            } => {
                if count > 0 {
                    builder.add_block(0, blocklength, old)?;
                    let last = checked(to_address(count - 1)?.checked_mul(stride))?;
                    builder.add_block(last, blocklength, old)?;
                }
                add_size(count.checked_mul(blocklength).ok_or_else(overflow)?, old)?;
                (builder.finish(), false)
            }
            Shape::Indexed {
                ref blocks,
                ref old,
            } => {
                for &(blocklength, disp) in blocks {
                    builder.add_block(disp, blocklength, old)?;
                    add_size(blocklength, old)?;
                }
                (builder.finish(), false)
            }
            Shape::Struct { ref members } => {
                for (blocklength, disp, datatype) in members {
                    builder.add_block(*disp, *blocklength, datatype)?;
                    add_size(*blocklength, datatype)?;
                }
                (builder.finish(), false)
            }
            Shape::Basic | Shape::LowerBound | Shape::UpperBound | Shape::Resized { .. } => {
                return Err(Error::with_detail(
                    ErrorKind::Internal,
                    "shape has no derived bounds",
                ))
            }
        };
        Ok(Datatype::assemble(shape, combiner, size, bounds, candidate))
    }

    fn assemble(
        shape: Shape,
        combiner: Combiner,
        size: usize,
        bounds: Bounds,
        candidate: bool,
    ) -> Datatype {
        let dense = size == 0
            || (bounds.true_lb == bounds.lb
                && (bounds.ub - bounds.lb).value_as::<usize>().map_or(false, |e| e == size));
        Datatype(Arc::new(TypeDesc {
            shape,
            combiner,
            name: None,
            permanent: false,
            size,
            bounds,
            contiguous: candidate && dense,
            committed: OnceCell::new(),
        }))
    }

    fn check_not_marker(&self, constructor: &str) -> Result<()> {
        match self.0.shape {
            Shape::LowerBound | Shape::UpperBound => Err(Error::with_detail(
                ErrorKind::InvalidDatatype,
                format!("a bound marker cannot be the element type of {}", constructor),
            )),
            _ => Ok(()),
        }
    }

    /// The zero-sized lower bound marker pseudo-type
    ///
    /// Placed in a struct datatype, it pins the lower bound of the result to its displacement.
    pub fn lower_bound_marker() -> Datatype {
        LOWER_BOUND.clone()
    }

    /// The zero-sized upper bound marker pseudo-type
    ///
    /// Placed in a struct datatype, it pins the upper bound of the result to its displacement.
    pub fn upper_bound_marker() -> Datatype {
        UPPER_BOUND.clone()
    }

    /// An untyped byte
    pub fn byte() -> Datatype {
        BYTE.clone()
    }

    /// Constructs a new datatype by concatenating `count` repetitions of `oldtype`
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn contiguous(count: Count, oldtype: &Datatype) -> Result<Datatype> {
        let count = non_negative(count, ErrorKind::InvalidCount, "count")?;
        Datatype::derive(
            Shape::Contiguous {
                count,
                old: oldtype.clone(),
            },
            Combiner::Contiguous,
        )
    }

    /// Construct a new datatype out of `count` blocks of `blocklength` elements of `oldtype`
    /// concatenated with the start of consecutive blocks placed `stride` elements apart.
    ///
    /// A stride equal to the block length describes a gapless layout; the result is then the
    /// same datatype `contiguous(count * blocklength, oldtype)` would return.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn vector(
        count: Count,
        blocklength: Count,
        stride: Count,
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        oldtype.check_not_marker("a vector")?;
        let n = non_negative(count, ErrorKind::InvalidCount, "count")?;
        let b = non_negative(blocklength, ErrorKind::InvalidArgument, "block length")?;
        if stride == blocklength {
            let total = count.checked_mul(blocklength).ok_or_else(|| {
                Error::with_detail(ErrorKind::InvalidCount, "count * block length overflows")
            })?;
            return Datatype::contiguous(total, oldtype);
        }
        let stride = checked(widen(stride).checked_mul(oldtype.extent()))?;
        Datatype::derive(
            Shape::Vector {
                count: n,
                blocklength: b,
                stride,
                old: oldtype.clone(),
            },
            Combiner::Vector,
        )
    }

    /// Like `vector()` but `stride` is given in bytes rather than elements of `oldtype`.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn heterogeneous_vector(
        count: Count,
        blocklength: Count,
        stride: Address,
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        oldtype.check_not_marker("a vector")?;
        let count = non_negative(count, ErrorKind::InvalidCount, "count")?;
        let blocklength = non_negative(blocklength, ErrorKind::InvalidArgument, "block length")?;
        Datatype::derive(
            Shape::Vector {
                count,
                blocklength,
                stride,
                old: oldtype.clone(),
            },
            Combiner::HVector,
        )
    }

    fn indexed_shape(
        blocklengths: &[Count],
        displacements: &[Address],
        oldtype: &Datatype,
        combiner: Combiner,
    ) -> Result<Datatype> {
        if blocklengths.len() != displacements.len() {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format!(
                    "{} block lengths but {} displacements",
                    blocklengths.len(),
                    displacements.len()
                ),
            ));
        }
        let blocks = blocklengths
            .iter()
            .zip(displacements)
            .map(|(&blocklength, &disp)| {
                Ok((
                    non_negative(blocklength, ErrorKind::InvalidArgument, "block length")?,
                    disp,
                ))
            })
            .collect::<Result<SmallVec<_>>>()?;
        Datatype::derive(
            Shape::Indexed {
                blocks,
                old: oldtype.clone(),
            },
            combiner,
        )
    }

    fn element_displacements(displacements: &[Count], oldtype: &Datatype) -> Result<Vec<Address>> {
        displacements
            .iter()
            .map(|&d| checked(widen(d).checked_mul(oldtype.extent())))
            .collect()
    }

    /// Constructs a new type out of multiple blocks of individual length and displacement.
    /// Block `i` will be `blocklengths[i]` items of datatype `oldtype` long and displaced by
    /// `displacements[i]` items of the `oldtype`.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn indexed(
        blocklengths: &[Count],
        displacements: &[Count],
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        let displacements = Datatype::element_displacements(displacements, oldtype)?;
        Datatype::indexed_shape(blocklengths, &displacements, oldtype, Combiner::Indexed)
    }

    /// Constructs a new datatype out of blocks of different length and displacement in bytes.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn heterogeneous_indexed(
        blocklengths: &[Count],
        displacements: &[Address],
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        Datatype::indexed_shape(blocklengths, displacements, oldtype, Combiner::HIndexed)
    }

    /// Construct a new type out of blocks of the same length and individual displacements.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn indexed_block(
        blocklength: Count,
        displacements: &[Count],
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        let blocklengths = vec![blocklength; displacements.len()];
        let displacements = Datatype::element_displacements(displacements, oldtype)?;
        Datatype::indexed_shape(&blocklengths, &displacements, oldtype, Combiner::IndexedBlock)
    }

    /// Construct a new type out of blocks of the same length and individual displacements.
    /// Displacements are in bytes.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn heterogeneous_indexed_block(
        blocklength: Count,
        displacements: &[Address],
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        let blocklengths = vec![blocklength; displacements.len()];
        Datatype::indexed_shape(
            &blocklengths,
            displacements,
            oldtype,
            Combiner::HIndexedBlock,
        )
    }

    /// Constructs a new datatype out of blocks of different types, lengths and byte
    /// displacements.
    ///
    /// Members may overlap or leave gaps. The bounds of the result span all members unless a
    /// bound marker is one of them.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.2
    pub fn structured<D>(
        blocklengths: &[Count],
        displacements: &[Address],
        types: &[D],
    ) -> Result<Datatype>
    where
        D: Borrow<Datatype>,
    {
        if blocklengths.len() != displacements.len() || blocklengths.len() != types.len() {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format!(
                    "{} block lengths, {} displacements and {} types",
                    blocklengths.len(),
                    displacements.len(),
                    types.len()
                ),
            ));
        }
        let members = blocklengths
            .iter()
            .zip(displacements)
            .zip(types)
            .map(|((&blocklength, &disp), datatype)| {
                Ok((
                    non_negative(blocklength, ErrorKind::InvalidArgument, "block length")?,
                    disp,
                    datatype.borrow().clone(),
                ))
            })
            .collect::<Result<SmallVec<_>>>()?;
        Datatype::derive(Shape::Struct { members }, Combiner::Struct)
    }

    /// A datatype with the data of `self` but lower bound `lb` and extent `extent`.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.7
    pub fn resized(&self, lb: Address, extent: Address) -> Result<Datatype> {
        self.check_not_marker("a resized datatype")?;
        let ub = checked(lb.checked_add(extent))?;
        let bounds = Bounds {
            lb,
            ub,
            true_lb: self.0.bounds.true_lb,
            true_ub: self.0.bounds.true_ub,
            lb_marker: true,
            ub_marker: true,
        };
        Ok(Datatype::assemble(
            Shape::Resized { old: self.clone() },
            Combiner::Resized,
            self.size(),
            bounds,
            self.is_contiguous(),
        ))
    }

    /// Describes a `subsizes` sized block starting at `starts` of an array of dimensions
    /// `sizes` with elements of type `oldtype`.
    ///
    /// The extent of the result is the extent of the full array, so that consecutive elements of
    /// the result describe consecutive full arrays.
    ///
    /// # Errors
    ///
    /// `InvalidArgument`, naming the first offending dimension, if a size or subsize is not
    /// positive, a start is negative or a block reaches past its dimension.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.3
    pub fn subarray(
        sizes: &[Count],
        subsizes: &[Count],
        starts: &[Count],
        order: Order,
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        oldtype.check_not_marker("a subarray")?;
        let ndims = sizes.len();
        if ndims == 0 || subsizes.len() != ndims || starts.len() != ndims {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format!(
                    "{} sizes, {} subsizes and {} starts",
                    ndims,
                    subsizes.len(),
                    starts.len()
                ),
            ));
        }
        for dim in 0..ndims {
            let problem = if sizes[dim] <= 0 {
                Some(format!("size {} is not positive", sizes[dim]))
            } else if subsizes[dim] <= 0 {
                Some(format!("subsize {} is not positive", subsizes[dim]))
            } else if starts[dim] < 0 {
                Some(format!("start {} is negative", starts[dim]))
            } else if i64::from(starts[dim]) + i64::from(subsizes[dim]) > i64::from(sizes[dim]) {
                Some(format!(
                    "start {} plus subsize {} exceeds size {}",
                    starts[dim], subsizes[dim], sizes[dim]
                ))
            } else {
                None
            };
            if let Some(problem) = problem {
                return Err(Error::with_detail(
                    ErrorKind::InvalidArgument,
                    format!("dimension {}: {}", dim, problem),
                ));
            }
        }

        // Work in C order, fastest varying dimension last.
        let mut dims: SmallVec<[(Count, Count, Count); 4]> = (0..ndims)
            .map(|d| (sizes[d], subsizes[d], starts[d]))
            .collect();
        if order == Order::Fortran {
            dims.reverse();
        }

        let extent = oldtype.extent();
        let mut strides: SmallVec<[Address; 4]> = SmallVec::from_elem(extent, ndims);
        for d in (0..ndims - 1).rev() {
            strides[d] = checked(strides[d + 1].checked_mul(widen(dims[d + 1].0)))?;
        }
        let full_extent = checked(strides[0].checked_mul(widen(dims[0].0)))?;
        let mut disp: Address = 0;
        for d in 0..ndims {
            let offset = checked(strides[d].checked_mul(widen(dims[d].2)))?;
            disp = checked(disp.checked_add(offset))?;
        }

        let last = ndims - 1;
        let mut inner = if ndims == 1 {
            Datatype::contiguous(dims[0].1, oldtype)?
        } else {
            Datatype::vector(dims[last - 1].1, dims[last].1, dims[last].0, oldtype)?
        };
        for d in (0..ndims.saturating_sub(2)).rev() {
            inner = Datatype::heterogeneous_vector(dims[d].1, 1, strides[d], &inner)?;
        }

        let mut builder = BoundsBuilder::default();
        let members: SmallVec<[(usize, Address, Datatype); 4]> = SmallVec::from_vec(vec![
            (1, 0, Datatype::lower_bound_marker()),
            (1, disp, inner),
            (1, full_extent, Datatype::upper_bound_marker()),
        ]);
        for (blocklength, disp, datatype) in &members {
            builder.add_block(*disp, *blocklength, datatype)?;
        }
        let size = members[1].2.size();
        Ok(Datatype::assemble(
            Shape::Struct { members },
            Combiner::Subarray,
            size,
            builder.finish(),
            false,
        ))
    }

    /// Commits the datatype so it can be used to move data.
    ///
    /// Committing is idempotent: later calls are no-ops, as is committing a predefined datatype.
    /// For struct datatypes whose size equals their extent, the members are checked for forming
    /// a single gapless run, in which case the datatype is copied in bulk from then on.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.9
    pub fn commit(&self) {
        self.0.committed.get_or_init(|| {
            let contiguous = match self.0.shape {
                Shape::Struct { .. } if self.extent_matches_size() => {
                    layout::is_single_run(self)
                }
                _ => self.0.contiguous,
            };
            log::trace!(
                "committed {:?} datatype of size {} (contiguous: {})",
                self.0.combiner,
                self.0.size,
                contiguous
            );
            contiguous
        });
    }

    /// Commits the datatype and returns it.
    pub fn committed(self) -> Datatype {
        self.commit();
        self
    }

    fn extent_matches_size(&self) -> bool {
        self.extent()
            .value_as::<usize>()
            .map_or(false, |extent| extent == self.size())
    }

    /// Whether the datatype has been committed
    pub fn is_committed(&self) -> bool {
        self.0.committed.get().is_some()
    }

    /// Whether one element is a single gapless run of `size()` bytes starting at the lower bound
    pub fn is_contiguous(&self) -> bool {
        self.0.committed.get().copied().unwrap_or(self.0.contiguous)
    }

    /// Whether this is a predefined datatype
    pub fn is_predefined(&self) -> bool {
        self.0.permanent
    }

    /// Name of a predefined datatype
    pub fn name(&self) -> Option<&'static str> {
        self.0.name
    }

    /// How the datatype was constructed
    pub fn combiner(&self) -> Combiner {
        self.0.combiner
    }

    /// Number of data bytes in one element
    ///
    /// # Standard section(s)
    ///
    /// 4.1.5
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Distance between the lower and the upper bound
    ///
    /// # Standard section(s)
    ///
    /// 4.1.7
    pub fn extent(&self) -> Address {
        self.0.bounds.ub - self.0.bounds.lb
    }

    /// The lower bound
    pub fn lower_bound(&self) -> Address {
        self.0.bounds.lb
    }

    /// The upper bound
    pub fn upper_bound(&self) -> Address {
        self.0.bounds.ub
    }

    /// Lowest byte displacement holding data, ignoring bound markers and resizing
    ///
    /// # Standard section(s)
    ///
    /// 4.1.8
    pub fn true_lower_bound(&self) -> Address {
        self.0.bounds.true_lb
    }

    /// Span of the bytes holding data, ignoring bound markers and resizing
    pub fn true_extent(&self) -> Address {
        self.0.bounds.true_ub - self.0.bounds.true_lb
    }

    pub(crate) fn true_upper_bound(&self) -> Address {
        self.0.bounds.true_ub
    }

    pub(crate) fn shape(&self) -> &Shape {
        &self.0.shape
    }

    /// Whether two handles refer to the same description
    pub fn ptr_eq(&self, other: &Datatype) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of handles sharing this description
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Datatype");
        if let Some(name) = self.0.name {
            s.field("name", &name);
        } else {
            s.field("combiner", &self.0.combiner);
        }
        s.field("size", &self.0.size)
            .field("lb", &self.0.bounds.lb)
            .field("extent", &self.extent())
            .field("committed", &self.is_committed())
            .finish()
    }
}

static LOWER_BOUND: Lazy<Datatype> = Lazy::new(|| Datatype::marker("lb", Shape::LowerBound));
static UPPER_BOUND: Lazy<Datatype> = Lazy::new(|| Datatype::marker("ub", Shape::UpperBound));
static BYTE: Lazy<Datatype> = Lazy::new(|| Datatype::predefined("byte", 1));

/// A direct equivalence exists between the implementing type and a datatype
///
/// # Safety
///
/// The datatype must describe only bytes that lie within a value of the implementing type and
/// every bit pattern written there by a receive must be a valid value.
///
/// # Standard section(s)
///
/// 3.2.2
pub unsafe trait Equivalence {
    /// The datatype that is equivalent to this Rust type
    fn equivalent_datatype() -> Datatype;
}

macro_rules! equivalent_system_datatype {
    ($($static_name:ident: $rstype:ty => $name:expr;)*) => {
        $(
        static $static_name: Lazy<Datatype> =
            Lazy::new(|| Datatype::predefined($name, mem::size_of::<$rstype>()));

        unsafe impl Equivalence for $rstype {
            fn equivalent_datatype() -> Datatype {
                $static_name.clone()
            }
        }
        )*
    }
}

equivalent_system_datatype! {
    BOOL: bool => "bool";
    FLOAT: f32 => "float";
    DOUBLE: f64 => "double";
    INT8: i8 => "int8_t";
    INT16: i16 => "int16_t";
    INT32: i32 => "int32_t";
    INT64: i64 => "int64_t";
    UINT8: u8 => "uint8_t";
    UINT16: u16 => "uint16_t";
    UINT32: u32 => "uint32_t";
    UINT64: u64 => "uint64_t";
    USIZE: usize => "size_t";
    ISIZE: isize => "ptrdiff_t";
}

#[cfg(feature = "complex")]
static COMPLEX_FLOAT: Lazy<Datatype> = Lazy::new(|| complex_of(FLOAT.clone()));
#[cfg(feature = "complex")]
static COMPLEX_DOUBLE: Lazy<Datatype> = Lazy::new(|| complex_of(DOUBLE.clone()));

#[cfg(feature = "complex")]
fn complex_of(part: Datatype) -> Datatype {
    let size = 2 * part.size();
    let extent = size.value_as::<Address>().unwrap_or(Address::MAX);
    let committed = OnceCell::new();
    let _ = committed.set(true);
    Datatype(Arc::new(TypeDesc {
        shape: Shape::Contiguous {
            count: 2,
            old: part,
        },
        combiner: Combiner::Named,
        name: Some(if size == 8 { "complex" } else { "double complex" }),
        permanent: true,
        size,
        bounds: Bounds {
            ub: extent,
            true_ub: extent,
            ..Default::default()
        },
        contiguous: true,
        committed,
    }))
}

#[cfg(feature = "complex")]
unsafe impl Equivalence for num_complex::Complex<f32> {
    fn equivalent_datatype() -> Datatype {
        COMPLEX_FLOAT.clone()
    }
}

#[cfg(feature = "complex")]
unsafe impl Equivalence for num_complex::Complex<f64> {
    fn equivalent_datatype() -> Datatype {
        COMPLEX_DOUBLE.clone()
    }
}

/// Something that has an associated datatype
pub unsafe trait AsDatatype {
    /// The associated datatype
    fn as_datatype(&self) -> Datatype;
}

unsafe impl<T> AsDatatype for T
where
    T: Equivalence,
{
    fn as_datatype(&self) -> Datatype {
        T::equivalent_datatype()
    }
}

unsafe impl<T> AsDatatype for [T]
where
    T: Equivalence,
{
    fn as_datatype(&self) -> Datatype {
        T::equivalent_datatype()
    }
}

/// A countable collection of things.
pub unsafe trait Collection {
    /// How many things are in this collection.
    fn count(&self) -> Count;
}

unsafe impl<T> Collection for T
where
    T: Equivalence,
{
    fn count(&self) -> Count {
        1
    }
}

unsafe impl<T> Collection for [T]
where
    T: Equivalence,
{
    fn count(&self) -> Count {
        self.len().value_as().unwrap_or(Count::MAX)
    }
}

/// Provides a pointer to the starting address in memory and the number of bytes reachable from
/// it.
pub unsafe trait Pointer {
    /// A pointer to the starting address in memory
    fn pointer(&self) -> *const u8;
    /// Number of bytes starting at `pointer()` that belong to the buffer
    fn span(&self) -> usize;
}

unsafe impl<T> Pointer for T
where
    T: Equivalence,
{
    fn pointer(&self) -> *const u8 {
        self as *const T as *const u8
    }

    fn span(&self) -> usize {
        mem::size_of::<T>()
    }
}

unsafe impl<T> Pointer for [T]
where
    T: Equivalence,
{
    fn pointer(&self) -> *const u8 {
        self.as_ptr() as *const u8
    }

    fn span(&self) -> usize {
        mem::size_of_val(self)
    }
}

/// Provides a mutable pointer to the starting address in memory.
pub unsafe trait PointerMut {
    /// A mutable pointer to the starting address in memory
    fn pointer_mut(&mut self) -> *mut u8;
}

unsafe impl<T> PointerMut for T
where
    T: Equivalence,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        self as *mut T as *mut u8
    }
}

unsafe impl<T> PointerMut for [T]
where
    T: Equivalence,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        self.as_mut_ptr() as *mut u8
    }
}

/// A buffer is a region in memory that starts at `pointer()` and contains `count()` copies of
/// `as_datatype()`.
pub unsafe trait Buffer: Pointer + Collection + AsDatatype {}
unsafe impl<T> Buffer for T where T: Equivalence {}
unsafe impl<T> Buffer for [T] where T: Equivalence {}

/// A mutable buffer is a region in memory that starts at `pointer_mut()` and contains `count()`
/// copies of `as_datatype()`.
pub unsafe trait BufferMut: Buffer + PointerMut {}
unsafe impl<T> BufferMut for T where T: Equivalence {}
unsafe impl<T> BufferMut for [T] where T: Equivalence {}

/// A buffer with a user specified count and datatype
///
/// The layout described by `count` elements of `datatype` must stay within `buffer`; operations
/// issued on the view fail with `InvalidArgument` otherwise.
pub struct View<'b, B: ?Sized>
where
    B: 'b + Pointer,
{
    datatype: Datatype,
    count: Count,
    buffer: &'b B,
}

impl<'b, B: ?Sized> View<'b, B>
where
    B: 'b + Pointer,
{
    /// Return a view of `buffer` containing `count` instances of datatype `datatype`.
    pub fn with_count_and_datatype(buffer: &'b B, count: Count, datatype: &Datatype) -> Self {
        View {
            datatype: datatype.clone(),
            count,
            buffer,
        }
    }
}

unsafe impl<'b, B: ?Sized> AsDatatype for View<'b, B>
where
    B: 'b + Pointer,
{
    fn as_datatype(&self) -> Datatype {
        self.datatype.clone()
    }
}

unsafe impl<'b, B: ?Sized> Collection for View<'b, B>
where
    B: 'b + Pointer,
{
    fn count(&self) -> Count {
        self.count
    }
}

unsafe impl<'b, B: ?Sized> Pointer for View<'b, B>
where
    B: 'b + Pointer,
{
    fn pointer(&self) -> *const u8 {
        self.buffer.pointer()
    }

    fn span(&self) -> usize {
        self.buffer.span()
    }
}

unsafe impl<'b, B: ?Sized> Buffer for View<'b, B> where B: 'b + Pointer {}

/// A buffer with a user specified count and datatype
///
/// The layout described by `count` elements of `datatype` must stay within `buffer`; operations
/// issued on the view fail with `InvalidArgument` otherwise.
pub struct MutView<'b, B: ?Sized>
where
    B: 'b + PointerMut + Pointer,
{
    datatype: Datatype,
    count: Count,
    buffer: &'b mut B,
}

impl<'b, B: ?Sized> MutView<'b, B>
where
    B: 'b + PointerMut + Pointer,
{
    /// Return a view of `buffer` containing `count` instances of datatype `datatype`.
    pub fn with_count_and_datatype(buffer: &'b mut B, count: Count, datatype: &Datatype) -> Self {
        MutView {
            datatype: datatype.clone(),
            count,
            buffer,
        }
    }
}

unsafe impl<'b, B: ?Sized> AsDatatype for MutView<'b, B>
where
    B: 'b + PointerMut + Pointer,
{
    fn as_datatype(&self) -> Datatype {
        self.datatype.clone()
    }
}

unsafe impl<'b, B: ?Sized> Collection for MutView<'b, B>
where
    B: 'b + PointerMut + Pointer,
{
    fn count(&self) -> Count {
        self.count
    }
}

unsafe impl<'b, B: ?Sized> Pointer for MutView<'b, B>
where
    B: 'b + PointerMut + Pointer,
{
    fn pointer(&self) -> *const u8 {
        self.buffer.pointer()
    }

    fn span(&self) -> usize {
        self.buffer.span()
    }
}

unsafe impl<'b, B: ?Sized> PointerMut for MutView<'b, B>
where
    B: 'b + PointerMut + Pointer,
{
    fn pointer_mut(&mut self) -> *mut u8 {
        self.buffer.pointer_mut()
    }
}

unsafe impl<'b, B: ?Sized> Buffer for MutView<'b, B> where B: 'b + PointerMut + Pointer {}
unsafe impl<'b, B: ?Sized> BufferMut for MutView<'b, B> where B: 'b + PointerMut + Pointer {}

/// Byte displacement of `x` relative to `base`, for building struct datatypes by hand.
pub fn displacement_of<T, U>(base: &T, x: &U) -> Address {
    (x as *const U as Address).wrapping_sub(base as *const T as Address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> Datatype {
        i32::equivalent_datatype()
    }

    #[test]
    fn predefined_types_are_committed_and_permanent() {
        let t = f64::equivalent_datatype();
        assert!(t.is_committed());
        assert!(t.is_predefined());
        assert!(t.is_contiguous());
        assert_eq!(t.size(), 8);
        assert_eq!(t.extent(), 8);
        assert_eq!(t.name(), Some("double"));
        assert!(t.ptr_eq(&f64::equivalent_datatype()));
    }

    #[test]
    fn contiguous_bounds() {
        let t = Datatype::contiguous(5, &int32()).unwrap();
        assert_eq!(t.combiner(), Combiner::Contiguous);
        assert_eq!(t.size(), 20);
        assert_eq!(t.extent(), 20);
        assert_eq!(t.lower_bound(), 0);
        assert!(t.is_contiguous());
        assert!(!t.is_committed());

        let empty = Datatype::contiguous(0, &int32()).unwrap();
        assert_eq!(empty.size(), 0);
        assert_eq!(empty.extent(), 0);

        assert_eq!(
            Datatype::contiguous(-1, &int32()).unwrap_err().kind(),
            ErrorKind::InvalidCount
        );
    }

    #[test]
    fn vector_bounds() {
        let t = Datatype::vector(3, 2, 4, &int32()).unwrap();
        assert_eq!(t.combiner(), Combiner::Vector);
        assert_eq!(t.size(), 24);
        // blocks at 0, 16 and 32, each 8 bytes
        assert_eq!(t.extent(), 40);
        assert_eq!(t.true_extent(), 40);
        assert!(!t.is_contiguous());
    }

    #[test]
    fn vector_with_stride_equal_to_blocklength_collapses() {
        let t = Datatype::vector(4, 3, 3, &int32()).unwrap();
        let c = Datatype::contiguous(12, &int32()).unwrap();
        assert_eq!(t.combiner(), Combiner::Contiguous);
        assert_eq!(t.size(), c.size());
        assert_eq!(t.extent(), c.extent());
        assert_eq!(t.lower_bound(), c.lower_bound());
        assert!(t.is_contiguous());
    }

    #[test]
    fn vector_validation() {
        assert_eq!(
            Datatype::vector(-1, 1, 2, &int32()).unwrap_err().kind(),
            ErrorKind::InvalidCount
        );
        assert_eq!(
            Datatype::vector(1, -1, 2, &int32()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Datatype::vector(2, 1, 2, &Datatype::upper_bound_marker())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidDatatype
        );
    }

    #[test]
    fn negative_stride_vector_reaches_backwards() {
        let t = Datatype::vector(3, 1, -2, &int32()).unwrap();
        assert_eq!(t.lower_bound(), -16);
        assert_eq!(t.upper_bound(), 4);
        assert_eq!(t.size(), 12);
    }

    #[test]
    fn hvector_uses_byte_stride() {
        let t = Datatype::heterogeneous_vector(2, 1, 10, &int32()).unwrap();
        assert_eq!(t.combiner(), Combiner::HVector);
        assert_eq!(t.extent(), 14);
        assert_eq!(t.size(), 8);
    }

    #[test]
    fn indexed_bounds() {
        let t = Datatype::indexed(&[2, 1], &[3, 0], &int32()).unwrap();
        assert_eq!(t.size(), 12);
        assert_eq!(t.lower_bound(), 0);
        assert_eq!(t.upper_bound(), 20);

        let b = Datatype::indexed_block(2, &[1, 5], &int32()).unwrap();
        assert_eq!(b.combiner(), Combiner::IndexedBlock);
        assert_eq!(b.size(), 16);
        assert_eq!(b.lower_bound(), 4);
        assert_eq!(b.upper_bound(), 28);

        let h = Datatype::heterogeneous_indexed(&[1, 1], &[2, 9], &u8::equivalent_datatype())
            .unwrap();
        assert_eq!(h.extent(), 8);
        assert_eq!(
            Datatype::indexed(&[1], &[0, 1], &int32()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn struct_with_gap() {
        let t = Datatype::structured(
            &[1, 1],
            &[0, 8],
            &[int32(), f64::equivalent_datatype()],
        )
        .unwrap();
        assert_eq!(t.size(), 12);
        assert_eq!(t.extent(), 16);
        t.commit();
        assert!(!t.is_contiguous());
    }

    #[test]
    fn gapless_struct_becomes_contiguous_on_commit() {
        let t = Datatype::structured(&[2, 1], &[0, 8], &[int32(), int32()]).unwrap();
        assert!(!t.is_contiguous());
        t.commit();
        assert!(t.is_contiguous());
        t.commit();
        assert!(t.is_committed());
    }

    #[test]
    fn struct_members_out_of_order_are_not_contiguous() {
        let t = Datatype::structured(&[1, 1], &[4, 0], &[int32(), int32()]).unwrap();
        t.commit();
        assert!(!t.is_contiguous());
    }

    #[test]
    fn markers_are_sticky() {
        let lb = Datatype::lower_bound_marker();
        let ub = Datatype::upper_bound_marker();
        let t = Datatype::structured(&[1, 1, 1], &[-4, 0, 12], &[lb, int32(), ub]).unwrap();
        assert_eq!(t.lower_bound(), -4);
        assert_eq!(t.upper_bound(), 12);
        assert_eq!(t.true_lower_bound(), 0);
        assert_eq!(t.true_extent(), 4);

        // the marker survives another level of nesting
        let outer = Datatype::structured(&[1, 1], &[0, 100], &[t.clone(), int32()]).unwrap();
        assert_eq!(outer.lower_bound(), -4);
        assert_eq!(outer.upper_bound(), 12);
    }

    #[test]
    fn resized_overrides_bounds() {
        let t = int32().resized(0, 12).unwrap();
        assert_eq!(t.combiner(), Combiner::Resized);
        assert_eq!(t.size(), 4);
        assert_eq!(t.extent(), 12);
        assert!(!t.is_contiguous());
        let c = Datatype::contiguous(2, &t).unwrap();
        assert_eq!(c.extent(), 24);
        assert_eq!(c.true_extent(), 16);
    }

    #[test]
    fn subarray_c_order() {
        let t = Datatype::subarray(&[4, 5], &[2, 3], &[1, 2], Order::C, &int32()).unwrap();
        assert_eq!(t.combiner(), Combiner::Subarray);
        assert_eq!(t.size(), 24);
        assert_eq!(t.lower_bound(), 0);
        assert_eq!(t.extent(), 80);
        // first element at row 1, column 2
        assert_eq!(t.true_lower_bound(), 28);
    }

    #[test]
    fn subarray_fortran_order() {
        let t = Datatype::subarray(&[4, 5], &[2, 3], &[1, 2], Order::Fortran, &int32()).unwrap();
        assert_eq!(t.extent(), 80);
        // first element at row 1, column 2 with rows varying fastest
        assert_eq!(t.true_lower_bound(), 36);
    }

    #[test]
    fn subarray_validation_names_first_bad_dimension() {
        let err = Datatype::subarray(&[4, 0, 3], &[1, 1, 0], &[0, 0, 0], Order::C, &int32())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("dimension 1"));

        let err =
            Datatype::subarray(&[4, 4], &[2, 2], &[0, 3], Order::C, &int32()).unwrap_err();
        assert!(err.to_string().contains("dimension 1"));

        let err = Datatype::subarray(&[4], &[2], &[-1], Order::C, &int32()).unwrap_err();
        assert!(err.to_string().contains("dimension 0"));
    }

    #[test]
    fn derived_types_keep_their_parts_alive() {
        let base = Datatype::contiguous(2, &int32()).unwrap();
        let before = base.reference_count();
        let derived = Datatype::contiguous(3, &base).unwrap();
        assert_eq!(base.reference_count(), before + 1);
        drop(derived);
        assert_eq!(base.reference_count(), before);
    }
}
