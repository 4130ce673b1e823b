use proptest::prelude::*;

use varconvert::normalize::left_align;

fn allele_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(prop::sample::select(vec!['A', 'C', 'G', 'T']), 1..8)
        .prop_map(|bases| bases.into_iter().collect())
}

fn span(allele: &str) -> i64 {
    if allele == "-" { 0 } else { allele.len() as i64 }
}

proptest! {
    #[test]
    fn left_alignment_is_idempotent(
        pos in 1u64..10_000,
        ref_base in allele_strategy(),
        alt_base in allele_strategy(),
    ) {
        let (pos1, ref1, alt1) = left_align(pos, &ref_base, &alt_base);
        let (pos2, ref2, alt2) = left_align(pos1, &ref1, &alt1);
        prop_assert_eq!(pos1, pos2);
        prop_assert_eq!(ref1, ref2);
        prop_assert_eq!(alt1, alt2);
    }
}

proptest! {
    #[test]
    fn left_alignment_preserves_length_difference(
        pos in 1u64..10_000,
        ref_base in allele_strategy(),
        alt_base in allele_strategy(),
    ) {
        let (_, new_ref, new_alt) = left_align(pos, &ref_base, &alt_base);
        prop_assert_eq!(
            span(&ref_base) - span(&alt_base),
            span(&new_ref) - span(&new_alt)
        );
    }
}

proptest! {
    #[test]
    fn left_alignment_never_moves_position_backwards(
        pos in 1u64..10_000,
        ref_base in allele_strategy(),
        alt_base in allele_strategy(),
    ) {
        let (new_pos, new_ref, _) = left_align(pos, &ref_base, &alt_base);
        prop_assert!(new_pos >= pos);
        // The position advances by at most the bases trimmed off the front.
        prop_assert!(new_pos - pos <= ref_base.len() as u64);
        prop_assert!(!new_ref.is_empty());
    }
}
