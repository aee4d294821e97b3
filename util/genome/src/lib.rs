//! Genome content hashing.
//!
//! Two organisms with identical code must hash identically even when their
//! absolute positions differ, their label namespaces were uniformly
//! re-keyed, or one genome wraps across a toroidal boundary. The hash
//! considers only owned molecules whose type carries genome content; DATA
//! is working memory and deliberately ignored.

use evochora_environment::Environment;
use evochora_types::{Coord, Molecule, MoleculeType, OrganismId, VALUE_MASK};

/// Whether a molecule type participates in the genome hash.
pub fn is_hashed_type(mol_type: MoleculeType) -> bool {
    HASHED_TYPES.contains(&mol_type)
}

/// Molecule types that participate in the genome hash.
const HASHED_TYPES: [MoleculeType; 6] = [
    MoleculeType::Code,
    MoleculeType::Label,
    MoleculeType::LabelRef,
    MoleculeType::Register,
    MoleculeType::Structure,
    MoleculeType::Energy,
];

/// Computes the genome hash of an organism by scanning the grid.
///
/// `initial_position` is the organism's birth cell; every owned molecule is
/// keyed by its minimal-image displacement from it, which is what makes the
/// hash translation- and wrap-invariant.
pub fn genome_hash(env: &Environment, owner: OrganismId, initial_position: &[i32]) -> u64 {
    let shape = env.shape();
    let owned = env
        .non_empty_cells()
        .filter(|(_, molecule, cell_owner)| {
            // cleared cells keep their writer as owner but carry no genome
            *cell_owner == owner
                && !molecule.is_empty()
                && HASHED_TYPES.contains(&molecule.mol_type)
        })
        .map(|(flat, molecule, _)| {
            let rel = shape.relative(initial_position, &shape.coord_of(flat));
            (rel, molecule)
        });
    hash_cells(owned)
}

/// Computes the genome hash from pre-collected `(relative_position,
/// molecule)` pairs. The runtime uses this with its ownership index instead
/// of re-scanning the grid.
pub fn hash_cells(cells: impl Iterator<Item = (Coord, Molecule)>) -> u64 {
    let cells: Vec<(Coord, Molecule)> = cells.collect();
    let mask = canonical_mask(&cells);

    // Commutative mixer: the per-cell mixes are summed, so enumeration
    // order never matters.
    cells
        .iter()
        .map(|(rel, molecule)| {
            let canonical_value = match molecule.mol_type {
                MoleculeType::Label | MoleculeType::LabelRef => {
                    (molecule.value as u32 ^ mask) & VALUE_MASK
                }
                _ => molecule.value as u32 & VALUE_MASK,
            };
            let mut stream = splitmix64(molecule.mol_type as u64);
            for axis in rel {
                stream = splitmix64(stream ^ (*axis as u64));
            }
            splitmix64(stream ^ u64::from(canonical_value))
        })
        .fold(0u64, u64::wrapping_add)
}

/// Picks the label-space XOR mask that cancels a uniform re-keying.
///
/// The anchor is the LABEL at the lexicographically smallest *relative*
/// position; flat-index order would pick a different anchor on the two
/// sides of a toroidal seam. LABELREFs are the fallback anchor for genomes
/// without labels.
fn canonical_mask(cells: &[(Coord, Molecule)]) -> u32 {
    let anchor = |wanted: MoleculeType| {
        cells
            .iter()
            .filter(|(_, molecule)| molecule.mol_type == wanted)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, molecule)| molecule.value as u32 & VALUE_MASK)
    };
    anchor(MoleculeType::Label)
        .or_else(|| anchor(MoleculeType::LabelRef))
        .unwrap_or(0)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evochora_environment::environment;
    use evochora_types::Topology;
    use proptest::prelude::*;

    fn place(env: &Environment, coord: &[i32], mol_type: MoleculeType, value: i32, owner: u32) {
        env.set(coord, Molecule::new(mol_type, value), owner).unwrap();
    }

    #[test]
    fn translation_and_namespace_invariance() {
        let env = environment(&[30, 30], Topology::Bounded);
        place(&env, &[5, 5], MoleculeType::Code, 42, 1);
        place(&env, &[5, 6], MoleculeType::Label, 100, 1);
        place(&env, &[5, 7], MoleculeType::LabelRef, 105, 1);
        let h1 = genome_hash(&env, 1, &[5, 5]);

        let env2 = environment(&[30, 30], Topology::Bounded);
        let mask = 0x1234;
        place(&env2, &[10, 10], MoleculeType::Code, 42, 1);
        place(&env2, &[10, 11], MoleculeType::Label, 100 ^ mask, 1);
        place(&env2, &[10, 12], MoleculeType::LabelRef, 105 ^ mask, 1);
        let h2 = genome_hash(&env2, 1, &[10, 10]);

        assert_eq!(h1, h2);
    }

    #[test]
    fn toroidal_wrap_invariance() {
        // organism A occupies x = 2..=6, organism B the same genome wrapped
        // across the x seam
        let env = environment(&[20, 20], Topology::Toroidal);
        let genome = [
            (MoleculeType::Label, 7),
            (MoleculeType::Code, 1),
            (MoleculeType::Code, 2),
            (MoleculeType::LabelRef, 7),
            (MoleculeType::Code, 3),
        ];
        for (i, (ty, value)) in genome.iter().enumerate() {
            place(&env, &[2 + i as i32, 0], *ty, *value, 1);
            place(&env, &[(18 + i as i32) % 20, 0], *ty, *value, 2);
        }
        let ha = genome_hash(&env, 1, &[2, 0]);
        let hb = genome_hash(&env, 2, &[18, 0]);
        assert_eq!(ha, hb);
    }

    #[test]
    fn data_is_ignored() {
        let env = environment(&[10, 10], Topology::Bounded);
        place(&env, &[1, 1], MoleculeType::Code, 9, 1);
        let h1 = genome_hash(&env, 1, &[1, 1]);
        place(&env, &[1, 2], MoleculeType::Data, 1234, 1);
        assert_eq!(genome_hash(&env, 1, &[1, 1]), h1);
    }

    #[test]
    fn single_mutation_changes_the_hash() {
        let build = |code_value: i32, label_value: i32, ref_value: i32| {
            let env = environment(&[10, 10], Topology::Bounded);
            place(&env, &[0, 0], MoleculeType::Label, label_value, 1);
            place(&env, &[0, 1], MoleculeType::Code, code_value, 1);
            place(&env, &[0, 2], MoleculeType::LabelRef, ref_value, 1);
            genome_hash(&env, 1, &[0, 0])
        };
        let base = build(1, 50, 50);
        assert_ne!(base, build(2, 50, 50), "code mutation");
        assert_ne!(base, build(1, 50, 51), "non-uniform labelref mutation");
    }

    #[test]
    fn type_mutation_changes_the_hash() {
        let build = |ty: MoleculeType| {
            let env = environment(&[10, 10], Topology::Bounded);
            place(&env, &[0, 0], MoleculeType::Label, 3, 1);
            place(&env, &[0, 1], ty, 5, 1);
            genome_hash(&env, 1, &[0, 0])
        };
        assert_ne!(build(MoleculeType::Code), build(MoleculeType::Structure));
    }

    #[test]
    fn other_owners_do_not_contribute() {
        let env = environment(&[10, 10], Topology::Bounded);
        place(&env, &[0, 0], MoleculeType::Code, 1, 1);
        let h1 = genome_hash(&env, 1, &[0, 0]);
        place(&env, &[5, 5], MoleculeType::Code, 2, 2);
        assert_eq!(genome_hash(&env, 1, &[0, 0]), h1);
    }

    proptest! {
        #[test]
        fn uniform_mask_and_translation_invariance(
            mask in 0u32..(1 << 19),
            dx in -5i32..5,
            dy in -5i32..5,
        ) {
            let env = environment(&[40, 40], Topology::Toroidal);
            place(&env, &[10, 10], MoleculeType::Label, 77, 1);
            place(&env, &[10, 11], MoleculeType::Code, 5, 1);
            place(&env, &[11, 10], MoleculeType::LabelRef, 77, 1);
            let h1 = genome_hash(&env, 1, &[10, 10]);

            let env2 = environment(&[40, 40], Topology::Toroidal);
            let m = mask as i32;
            place(&env2, &[10 + dx, 10 + dy], MoleculeType::Label, 77 ^ m, 1);
            place(&env2, &[10 + dx, 11 + dy], MoleculeType::Code, 5, 1);
            place(&env2, &[11 + dx, 10 + dy], MoleculeType::LabelRef, 77 ^ m, 1);
            let h2 = genome_hash(&env2, 1, &[10 + dx, 10 + dy]);

            prop_assert_eq!(h1, h2);
        }
    }
}
