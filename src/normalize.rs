use std::sync::Arc;

use crate::errors::{ConfigError, DropReason, StepFailure};
use crate::reference::ReferenceReader;
use crate::variant::{allele_len, Candidate};

/// In-place normalization of unique candidates: reference-base resolution,
/// genotype placeholder substitution, base-alphabet validation, and
/// left-alignment. Chromosome normalization is exposed separately because
/// the deduplication identity needs it before anything else runs.
pub struct VariantNormalizer {
    reference: Option<Arc<dyn ReferenceReader>>,
}

impl VariantNormalizer {
    pub fn new(reference: Option<Arc<dyn ReferenceReader>>) -> Self {
        Self { reference }
    }

    /// Step 1 plus the cheap no-variant fast path. Runs on every candidate
    /// before deduplication.
    pub fn normalize_chrom(&self, var: &mut Candidate) -> Result<(), DropReason> {
        if var.ref_base == var.alt_base {
            return Err(DropReason::NoVariant);
        }
        if var.chrom.is_empty() {
            return Err(DropReason::NoChromosome);
        }
        var.chrom = normalize_chrom_name(&var.chrom);
        Ok(())
    }

    /// Steps 2-6, in order, short-circuiting on the first failure.
    pub fn normalize(&self, var: &mut Candidate) -> Result<(), StepFailure> {
        self.resolve_ref_base(var)?;
        substitute_genotype_placeholders(var);
        check_bases(var)?;

        let (pos, ref_base, alt_base) =
            left_align(var.pos, &var.ref_base, &var.alt_base);
        var.pos = pos;
        var.ref_base = ref_base;
        var.alt_base = alt_base;
        var.end_pos = var.pos + allele_len(&var.ref_base) - 1;

        if var.ref_base == var.alt_base {
            return Err(DropReason::NoVariant.into());
        }
        Ok(())
    }

    fn resolve_ref_base(&self, var: &mut Candidate) -> Result<(), StepFailure> {
        if var.ref_base.is_empty() && !is_snv_allele(&var.alt_base) {
            return Err(DropReason::RefBaseRequired.into());
        }
        if var.ref_base.is_empty() || var.ref_base == "." {
            let reader = self
                .reference
                .as_ref()
                .ok_or(ConfigError::MissingReferenceReader)?;
            let bases = reader
                .get_bases(&var.chrom, var.pos, 1)
                .map_err(|e| DropReason::Unexpected(e.to_string()))?;
            var.ref_base = bases.to_ascii_uppercase();
        }
        Ok(())
    }
}

/// Prefix `chr` when absent, then apply the known aliases. The numeric
/// aliases only fire for inputs that already carried the prefix: a bare
/// `23` becomes `chr23` and stays there.
fn normalize_chrom_name(raw: &str) -> String {
    let had_prefix = raw.starts_with("chr");
    let name = if had_prefix {
        raw.to_string()
    } else {
        format!("chr{raw}")
    };
    match name.as_str() {
        "chrx" => String::from("chrX"),
        "chry" => String::from("chrY"),
        "chrMT" | "chrMt" => String::from("chrM"),
        "chr23" if had_prefix => String::from("chrX"),
        "chr24" if had_prefix => String::from("chrY"),
        _ => name,
    }
}

/// Replace every missing-allele placeholder in the sample genotype tokens
/// with the resolved reference base.
fn substitute_genotype_placeholders(var: &mut Candidate) {
    if var.samples.is_empty() {
        return;
    }
    let ref_base = var.ref_base.clone();
    for token in var.samples.values_mut() {
        if token.contains('.') {
            *token = token.replace('.', &ref_base);
        }
    }
}

fn check_bases(var: &Candidate) -> Result<(), DropReason> {
    if !is_valid_allele(&var.ref_base) {
        return Err(DropReason::InvalidRefBase);
    }
    if !is_valid_allele(&var.alt_base) {
        return Err(DropReason::InvalidAltBase);
    }
    Ok(())
}

/// An allele is either entirely `ATGC` or the `-` indel placeholder.
fn is_valid_allele(allele: &str) -> bool {
    if allele.is_empty() {
        return false;
    }
    allele
        .bytes()
        .all(|b| matches!(b, b'A' | b'T' | b'G' | b'C'))
        || allele.bytes().all(|b| b == b'-')
}

fn is_snv_allele(allele: &str) -> bool {
    allele.len() == 1 && is_valid_allele(allele)
}

/// Minimal left-aligned representation: trim the longest common trailing
/// substring, then the longest common leading substring, advancing `pos` by
/// the number of leading bases removed. An allele trimmed to nothing becomes
/// the `-` placeholder. Idempotent on already-minimal variants.
pub fn left_align(pos: u64, ref_base: &str, alt_base: &str) -> (u64, String, String) {
    if ref_base == "-" || alt_base == "-" {
        return (pos, ref_base.to_string(), alt_base.to_string());
    }

    let r = ref_base.as_bytes();
    let a = alt_base.as_bytes();

    let mut suffix = 0;
    while suffix < r.len()
        && suffix < a.len()
        && r[r.len() - 1 - suffix] == a[a.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let r = &r[..r.len() - suffix];
    let a = &a[..a.len() - suffix];

    let mut prefix = 0;
    while prefix < r.len() && prefix < a.len() && r[prefix] == a[prefix] {
        prefix += 1;
    }
    let r = &r[prefix..];
    let a = &a[prefix..];

    let new_ref = if r.is_empty() {
        String::from("-")
    } else {
        String::from_utf8_lossy(r).into_owned()
    };
    let new_alt = if a.is_empty() {
        String::from("-")
    } else {
        String::from_utf8_lossy(a).into_owned()
    };

    (pos + prefix as u64, new_ref, new_alt)
}
