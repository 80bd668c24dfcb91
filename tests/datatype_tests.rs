use mpi_p2p::datatype::pack::{pack, pack_bytes, packed_size, unpack, unpack_bytes, PACK_HEADROOM};
use mpi_p2p::datatype::{Combiner, Datatype, MutView, Order, View};
use mpi_p2p::traits::*;
use mpi_p2p::ErrorKind;

fn int32() -> Datatype {
    i32::equivalent_datatype()
}

/// Datatypes over an array of 24 `i32`, with the count to use and the indices of the elements
/// they describe in type map order.
fn layouts() -> Vec<(&'static str, Datatype, i32, Vec<usize>)> {
    let pair = Datatype::contiguous(2, &int32()).unwrap();
    vec![
        (
            "contiguous",
            Datatype::contiguous(3, &int32()).unwrap(),
            2,
            (0..6).collect(),
        ),
        (
            "vector",
            Datatype::vector(3, 2, 4, &int32()).unwrap(),
            1,
            vec![0, 1, 4, 5, 8, 9],
        ),
        (
            "hvector",
            Datatype::heterogeneous_vector(2, 1, 12, &int32()).unwrap(),
            1,
            vec![0, 3],
        ),
        (
            "indexed",
            Datatype::indexed(&[2, 1], &[0, 5], &int32()).unwrap(),
            1,
            vec![0, 1, 5],
        ),
        (
            "hindexed",
            Datatype::heterogeneous_indexed(&[1, 2], &[4, 32], &int32()).unwrap(),
            1,
            vec![1, 8, 9],
        ),
        (
            "indexed block",
            Datatype::indexed_block(2, &[1, 6], &int32()).unwrap(),
            1,
            vec![1, 2, 6, 7],
        ),
        (
            "hindexed block",
            Datatype::heterogeneous_indexed_block(1, &[0, 20], &int32()).unwrap(),
            1,
            vec![0, 5],
        ),
        (
            "struct",
            Datatype::structured(&[1, 2], &[0, 12], &[int32(), int32()]).unwrap(),
            1,
            vec![0, 3, 4],
        ),
        ("resized", pair.resized(0, 12).unwrap(), 2, vec![0, 1, 3, 4]),
        (
            "subarray C",
            Datatype::subarray(&[4, 6], &[2, 3], &[1, 2], Order::C, &int32()).unwrap(),
            1,
            vec![8, 9, 10, 14, 15, 16],
        ),
        (
            "subarray Fortran",
            Datatype::subarray(&[6, 4], &[3, 2], &[2, 1], Order::Fortran, &int32()).unwrap(),
            1,
            vec![8, 9, 10, 14, 15, 16],
        ),
    ]
}

#[test]
fn every_constructor_round_trips() {
    let source: Vec<i32> = (0..24).collect();
    for (name, datatype, count, indices) in layouts() {
        datatype.commit();
        let mut stream = vec![0u8; packed_size(count, &datatype).unwrap()];
        let mut position = 0;
        pack(
            &View::with_count_and_datatype(&source[..], count, &datatype),
            &mut stream,
            &mut position,
        )
        .unwrap_or_else(|err| panic!("{}: {}", name, err));
        assert_eq!(position, indices.len() * 4, "{}", name);

        let packed: Vec<i32> = stream[..position]
            .chunks(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let expected: Vec<i32> = indices.iter().map(|&i| source[i]).collect();
        assert_eq!(packed, expected, "{}", name);

        let mut target = vec![-1i32; 24];
        let mut read = 0;
        unpack(
            &stream[..position],
            &mut read,
            &mut MutView::with_count_and_datatype(&mut target[..], count, &datatype),
        )
        .unwrap_or_else(|err| panic!("{}: {}", name, err));
        assert_eq!(read, position, "{}", name);
        for (i, &value) in target.iter().enumerate() {
            if indices.contains(&i) {
                assert_eq!(value, source[i], "{}: element {}", name, i);
            } else {
                assert_eq!(value, -1, "{}: element {} should be untouched", name, i);
            }
        }
    }
}

#[test]
fn vector_with_gapless_stride_is_contiguous() {
    let vector = Datatype::vector(5, 3, 3, &int32()).unwrap();
    let contiguous = Datatype::contiguous(15, &int32()).unwrap();
    assert_eq!(vector.combiner(), Combiner::Contiguous);
    assert_eq!(vector.size(), contiguous.size());
    assert_eq!(vector.extent(), contiguous.extent());
    assert!(vector.is_contiguous());
}

#[test]
fn struct_gap_is_left_untouched() {
    let t = Datatype::structured(
        &[1, 1],
        &[0, 8],
        &[u8::equivalent_datatype(), f64::equivalent_datatype()],
    )
    .unwrap()
    .committed();
    assert_eq!(t.size(), 9);
    assert_eq!(t.extent(), 16);
    assert!(!t.is_contiguous());

    let source: Vec<u8> = (1..=16).collect();
    let mut stream = [0u8; 9];
    let mut position = 0;
    pack_bytes(&source, 1, &t, &mut stream, &mut position).unwrap();
    assert_eq!(position, 9);

    let mut target = [0xAAu8; 16];
    let mut read = 0;
    unpack_bytes(&stream, &mut read, &mut target, 1, &t).unwrap();
    assert_eq!(target[0], 1);
    assert!(target[1..8].iter().all(|&b| b == 0xAA));
    assert_eq!(&target[8..], &source[8..]);
}

#[test]
fn vector_packing_scenario() {
    let ints: Vec<i32> = (0..12).collect();
    let t = Datatype::vector(3, 2, 4, &int32()).unwrap().committed();
    assert_eq!(packed_size(1, &t).unwrap(), 24 + PACK_HEADROOM);

    let mut out = vec![0u8; packed_size(1, &t).unwrap()];
    let mut position = 0;
    pack(&View::with_count_and_datatype(&ints[..], 1, &t), &mut out, &mut position).unwrap();
    assert_eq!(position, 24);
    let expected: Vec<u8> = [0i32, 1, 4, 5, 8, 9]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    assert_eq!(&out[..24], &expected[..]);
}

#[test]
fn pack_errors() {
    let ints = [0i32; 4];
    let mut out = [0u8; 64];

    let uncommitted = Datatype::contiguous(2, &int32()).unwrap();
    let mut position = 0;
    let err = pack(
        &View::with_count_and_datatype(&ints[..], 1, &uncommitted),
        &mut out,
        &mut position,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UncommittedType);

    let err = pack(
        &View::with_count_and_datatype(&ints[..], -1, &int32()),
        &mut out,
        &mut position,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCount);

    let err = pack(
        &View::with_count_and_datatype(&ints[..], 5, &int32()),
        &mut out,
        &mut position,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut short = [0u8; 15];
    let err = pack(&ints[..], &mut short, &mut position).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageTruncated);
    assert_eq!(position, 0);
}

#[test]
fn bound_markers_pin_the_bounds() {
    let t = Datatype::structured(
        &[1, 1, 1],
        &[0, 4, 16],
        &[
            Datatype::lower_bound_marker(),
            int32(),
            Datatype::upper_bound_marker(),
        ],
    )
    .unwrap();
    assert_eq!(t.size(), 4);
    assert_eq!(t.lower_bound(), 0);
    assert_eq!(t.extent(), 16);
    assert_eq!(t.true_lower_bound(), 4);
    assert_eq!(t.true_extent(), 4);
}

#[test]
fn successive_packs_share_a_stream() {
    let a = [1i32, 2];
    let b = [3.5f64];
    let room = packed_size(2, &int32()).unwrap()
        + packed_size(1, &f64::equivalent_datatype()).unwrap();
    let mut stream = vec![0u8; room];
    let mut position = 0;
    pack(&a[..], &mut stream, &mut position).unwrap();
    pack(&b[..], &mut stream, &mut position).unwrap();
    assert_eq!(position, 16);

    let (mut a2, mut b2) = ([0i32; 2], [0.0f64; 1]);
    let mut read = 0;
    unpack(&stream, &mut read, &mut a2[..]).unwrap();
    unpack(&stream, &mut read, &mut b2[..]).unwrap();
    assert_eq!(a2, a);
    assert_eq!(b2, b);
    assert_eq!(read, 16);
}
