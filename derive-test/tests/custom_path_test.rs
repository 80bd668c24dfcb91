use p2p::traits::*;

/// `#[mpi(crate)]` points the derive at a renamed dependency. This only compiles if the generated
/// code addresses the runtime crate as `p2p`.
#[test]
fn derive_custom_path() {
    #[derive(Equivalence, Default)]
    #[mpi(crate = "::p2p")]
    struct Particle {
        position: [f64; 3],
        charge: i8,
    }

    let datatype = Particle::equivalent_datatype();
    assert!(datatype.is_committed());
    assert_eq!(datatype.size(), 3 * 8 + 1);
    assert_eq!(datatype.extent() as usize, std::mem::size_of::<Particle>());

    let _ = Particle::default().position;
    let _ = Particle::default().charge;
}
