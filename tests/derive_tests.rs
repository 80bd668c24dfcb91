#![cfg(feature = "derive")]

use std::mem;

use memoffset::offset_of;
use mpi_p2p::datatype::pack::pack;
use mpi_p2p::datatype::{Datatype, View};
use mpi_p2p::traits::*;
use mpi_p2p::transport::loopback::Loopback;
use mpi_p2p::Address;

const CONSTANT: usize = 7;

/// `#[derive(Equivalence)]` casts CONSTANT to a count. For defining a Rust array, CONSTANT must be
/// usize.
#[test]
fn derive_equivalence() {
    #[derive(Equivalence)]
    struct ArrayWrapper {
        field: [f32; CONSTANT],
    }

    let datatype = ArrayWrapper::equivalent_datatype();
    assert_eq!(datatype.size(), CONSTANT * 4);
    assert_eq!(datatype.extent() as usize, mem::size_of::<ArrayWrapper>());
}

#[derive(Equivalence, Default, Debug, PartialEq, Clone, Copy)]
struct Particle {
    id: u8,
    position: [f64; 3],
    spin: (i16, bool),
}

#[test]
fn derived_types_are_padded_to_the_rust_layout() {
    let datatype = Particle::equivalent_datatype();
    assert!(datatype.is_committed());
    assert_eq!(datatype.size(), 1 + 24 + 2 + 1);
    assert_eq!(datatype.lower_bound(), 0);
    assert_eq!(datatype.extent() as usize, mem::size_of::<Particle>());
    assert!(datatype.ptr_eq(&Particle::equivalent_datatype()));
}

#[test]
fn derived_types_travel_through_the_engine() {
    let universe = mpi_p2p::initialize(Loopback::single()).unwrap();
    let world = universe.world();
    let me = world.this_process();

    let sent = [
        Particle {
            id: 1,
            position: [0.5, 1.5, 2.5],
            spin: (-1, true),
        },
        Particle {
            id: 2,
            position: [3.0, 4.0, 5.0],
            spin: (1, false),
        },
    ];
    me.send(&sent[..]).unwrap();

    let mut received = [Particle::default(); 2];
    let status = me.receive_into(&mut received[..]).unwrap();
    assert_eq!(received, sent);
    assert_eq!(status.count(&Particle::equivalent_datatype()), 2);
}

#[test]
fn tuple_structs_derive() {
    #[derive(Equivalence, Default)]
    struct Pair(u32, [u16; 2]);

    let datatype = Pair::equivalent_datatype();
    assert_eq!(datatype.size(), 8);
    assert_eq!(datatype.extent(), 8);
    let _ = Pair::default().0;
    let _ = Pair::default().1;
}

#[derive(Equivalence, Default, Clone, Copy)]
struct Reading {
    station: u16,
    values: [f32; 2],
    valid: bool,
}

#[test]
fn derived_type_matches_a_hand_built_struct() {
    let manual = Datatype::structured(
        &[1, 2, 1],
        &[
            offset_of!(Reading, station) as Address,
            offset_of!(Reading, values) as Address,
            offset_of!(Reading, valid) as Address,
        ],
        &[
            u16::equivalent_datatype(),
            f32::equivalent_datatype(),
            bool::equivalent_datatype(),
        ],
    )
    .unwrap()
    .resized(0, mem::size_of::<Reading>() as Address)
    .unwrap()
    .committed();
    let derived = Reading::equivalent_datatype();
    assert_eq!(derived.size(), manual.size());
    assert_eq!(derived.lower_bound(), manual.lower_bound());
    assert_eq!(derived.extent(), manual.extent());
    assert_eq!(derived.true_lower_bound(), manual.true_lower_bound());
    assert_eq!(derived.true_extent(), manual.true_extent());

    let reading = Reading {
        station: 513,
        values: [0.25, -8.0],
        valid: true,
    };
    let mut by_derive = [0u8; 32];
    let mut by_hand = [0u8; 32];
    let (mut a, mut b) = (0, 0);
    pack(&reading, &mut by_derive, &mut a).unwrap();
    pack(
        &View::with_count_and_datatype(&reading, 1, &manual),
        &mut by_hand,
        &mut b,
    )
    .unwrap();
    assert_eq!(a, 11);
    assert_eq!((a, &by_derive[..a]), (b, &by_hand[..b]));
}
