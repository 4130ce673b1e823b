use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rust_lapper::{Interval, Lapper};

use crate::errors::DropReason;
use crate::reference::ReferenceReader;
use crate::variant::Candidate;

/// Strand of a mapped segment in the destination assembly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    fn from_symbol(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Strand::Forward),
            "-" => Ok(Strand::Reverse),
            _ => Err(anyhow!("invalid strand symbol: {s}")),
        }
    }
}

/// Single-position coordinate remapping between assemblies. `None` signals
/// liftover failure for that coordinate; positions are 0-based here.
pub trait Lifter: Send + Sync {
    fn lift_position(&self, chrom: &str, pos: u64) -> Option<(String, u64, Strand)>;
}

/// Why a point lift failed. Ambiguity fails closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LiftError {
    Unmapped,
    Ambiguous,
}

/// One aligned block of a chain: a source interval and where it lands.
#[derive(Clone, Debug, Eq, PartialEq)]
struct ChainBlock {
    chain_id: u32,
    score: u64,
    dest_chrom_id: u32,
    dest_start: u64,
    dest_size: u64,
    dest_strand: Strand,
    source_start: u64,
}

struct ChainHeader {
    score: u64,
    source_chrom: String,
    source_cursor: u64,
    dest_chrom: String,
    dest_size: u64,
    dest_strand: Strand,
    dest_cursor: u64,
    chain_id: u32,
}

fn parse_chain_header(line: &str) -> Result<ChainHeader> {
    // chain score tName tSize tStrand tStart tEnd qName qSize qStrand qStart qEnd id
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 13 {
        return Err(anyhow!("chain header has {} fields, expected 13", fields.len()));
    }
    Ok(ChainHeader {
        score: fields[1].parse()?,
        source_chrom: fields[2].to_string(),
        source_cursor: fields[5].parse()?,
        dest_chrom: fields[7].to_string(),
        dest_size: fields[8].parse()?,
        dest_strand: Strand::from_symbol(fields[9])?,
        dest_cursor: fields[10].parse()?,
        chain_id: fields[12].parse()?,
    })
}

/// UCSC chain file loaded into per-source-chromosome interval trees.
///
/// Chromosome keys are stored both with and without the `chr` prefix so
/// lookups never allocate. Destination chromosome names are interned.
pub struct ChainMap {
    map: HashMap<String, Arc<Lapper<u64, ChainBlock>>>,
    dest_chroms: Vec<String>,
}

impl ChainMap {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open chain file {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut intervals: HashMap<String, Vec<Interval<u64, ChainBlock>>> = HashMap::new();
        let mut dest_chroms: Vec<String> = Vec::new();
        let mut dest_ids: HashMap<String, u32> = HashMap::new();
        let mut header: Option<ChainHeader> = None;

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if trimmed.starts_with("chain ") {
                header = Some(parse_chain_header(trimmed)?);
                continue;
            }

            let Some(current) = header.as_mut() else {
                continue;
            };

            // Data line: size [dt dq]. size is the ungapped block length,
            // dt/dq the gaps to the next block in source and destination.
            let mut fields = trimmed.split_whitespace();
            let size: u64 = fields
                .next()
                .ok_or_else(|| anyhow!("empty chain data line"))?
                .parse()?;

            let dest_chrom_id = *dest_ids.entry(current.dest_chrom.clone()).or_insert_with(|| {
                let id = dest_chroms.len() as u32;
                dest_chroms.push(current.dest_chrom.clone());
                id
            });

            intervals
                .entry(current.source_chrom.clone())
                .or_default()
                .push(Interval {
                    start: current.source_cursor,
                    stop: current.source_cursor + size,
                    val: ChainBlock {
                        chain_id: current.chain_id,
                        score: current.score,
                        dest_chrom_id,
                        dest_start: current.dest_cursor,
                        dest_size: current.dest_size,
                        dest_strand: current.dest_strand,
                        source_start: current.source_cursor,
                    },
                });

            current.source_cursor += size;
            current.dest_cursor += size;
            if let (Some(dt), Some(dq)) = (fields.next(), fields.next()) {
                current.source_cursor += dt.parse::<u64>()?;
                current.dest_cursor += dq.parse::<u64>()?;
            }
        }

        let mut map = HashMap::new();
        for (chrom, blocks) in intervals {
            let alias = match chrom.strip_prefix("chr") {
                Some(stripped) => stripped.to_string(),
                None => format!("chr{chrom}"),
            };
            let lapper = Arc::new(Lapper::new(blocks));
            map.insert(alias, Arc::clone(&lapper));
            map.insert(chrom, lapper);
        }

        Ok(Self { map, dest_chroms })
    }

    /// Lift a 0-based position. The highest-scoring overlapping chain wins;
    /// a score tie between different chains is rejected as ambiguous.
    pub fn lift(&self, chrom: &str, pos: u64) -> Result<(String, u64, Strand), LiftError> {
        let lapper = self
            .map
            .get(chrom)
            .or_else(|| self.map.get(chrom.trim_start_matches("chr")))
            .ok_or(LiftError::Unmapped)?;

        let mut best: Option<&ChainBlock> = None;
        let mut tied = false;
        for hit in lapper.find(pos, pos + 1) {
            match best {
                None => best = Some(&hit.val),
                Some(current) => {
                    if hit.val.score > current.score {
                        best = Some(&hit.val);
                        tied = false;
                    } else if hit.val.score == current.score && hit.val.chain_id != current.chain_id
                    {
                        tied = true;
                    }
                }
            }
        }

        let block = best.ok_or(LiftError::Unmapped)?;
        if tied {
            return Err(LiftError::Ambiguous);
        }

        let offset = pos - block.source_start;
        let dest_pos = match block.dest_strand {
            Strand::Forward => block.dest_start + offset,
            Strand::Reverse => block
                .dest_size
                .checked_sub(1 + block.dest_start + offset)
                .ok_or(LiftError::Unmapped)?,
        };

        let dest_chrom = self
            .dest_chroms
            .get(block.dest_chrom_id as usize)
            .cloned()
            .ok_or(LiftError::Unmapped)?;

        Ok((dest_chrom, dest_pos, block.dest_strand))
    }
}

impl Lifter for ChainMap {
    fn lift_position(&self, chrom: &str, pos: u64) -> Option<(String, u64, Strand)> {
        self.lift(chrom, pos).ok()
    }
}

/// Reverse complement of a DNA allele; the `-` placeholder passes through.
pub fn reverse_complement(allele: &str) -> String {
    allele
        .chars()
        .rev()
        .map(|c| match c {
            'A' | 'a' => 'T',
            'T' | 't' => 'A',
            'C' | 'c' => 'G',
            'G' | 'g' => 'C',
            other => other,
        })
        .collect()
}

pub fn is_chrm(chrom: &str) -> bool {
    chrom == "chrM"
}

/// Conditional cross-assembly remapping of candidates. The mitochondrial
/// chromosome carries its own lift decision, independent of the general
/// flag.
pub struct LiftoverEngine {
    lifter: Option<Arc<dyn Lifter>>,
    reference: Option<Arc<dyn ReferenceReader>>,
    do_liftover: bool,
    do_liftover_chrm: bool,
}

impl LiftoverEngine {
    pub fn new(
        lifter: Arc<dyn Lifter>,
        reference: Option<Arc<dyn ReferenceReader>>,
        do_liftover: bool,
        do_liftover_chrm: bool,
    ) -> Self {
        Self {
            lifter: Some(lifter),
            reference,
            do_liftover,
            do_liftover_chrm,
        }
    }

    /// Engine that lifts nothing; used when input and target assemblies
    /// already match.
    pub fn disabled() -> Self {
        Self {
            lifter: None,
            reference: None,
            do_liftover: false,
            do_liftover_chrm: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.do_liftover || self.do_liftover_chrm
    }

    pub fn needed_for(&self, chrom: &str) -> bool {
        if is_chrm(chrom) {
            self.do_liftover_chrm
        } else {
            self.do_liftover
        }
    }

    /// Remap a candidate in place. The end position is lifted by its own
    /// call against the original coordinates; if that second lift fails the
    /// whole candidate is dropped even though the start lift succeeded.
    pub fn lift_variant(&self, var: &mut Candidate) -> Result<(), DropReason> {
        if !self.needed_for(&var.chrom) {
            return Ok(());
        }

        let src_chrom = var.chrom.clone();
        let src_end = var.end_pos;

        let (new_chrom, new_pos, strand) = self.lift_point(&src_chrom, var.pos)?;

        if strand == Strand::Reverse {
            if var.ref_base != "-" {
                var.ref_base = reverse_complement(&var.ref_base);
            }
            if var.alt_base != "-" {
                var.alt_base = reverse_complement(&var.alt_base);
            }
        }

        // Re-derive the reference allele from the target assembly when a
        // reader is available; the chain alone cannot vouch for the bases.
        if var.ref_base != "-"
            && let Some(reference) = &self.reference
            && let Ok(bases) = reference.get_bases(&new_chrom, new_pos, var.ref_base.len())
        {
            var.ref_base = bases;
        }

        let (_, new_end, _) = self.lift_point(&src_chrom, src_end)?;

        var.chrom = new_chrom;
        var.pos = new_pos;
        var.end_pos = new_end;
        if var.end_pos < var.pos {
            std::mem::swap(&mut var.pos, &mut var.end_pos);
        }
        Ok(())
    }

    fn lift_point(&self, chrom: &str, pos: u64) -> Result<(String, u64, Strand), DropReason> {
        if pos == 0 {
            return Err(DropReason::LiftoverFailure(format!("{chrom}:{pos}")));
        }
        let lifter = self
            .lifter
            .as_ref()
            .ok_or_else(|| DropReason::LiftoverFailure(format!("{chrom}:{pos}")))?;
        lifter
            .lift_position(chrom, pos - 1)
            .map(|(c, p, s)| (c, p + 1, s))
            .ok_or_else(|| DropReason::LiftoverFailure(format!("{chrom}:{pos}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_from(content: &str) -> ChainMap {
        ChainMap::from_reader(content.as_bytes()).unwrap()
    }

    const FORWARD_CHAIN: &str =
        "chain 100 chr1 1000 + 100 200 chr1 1000 + 200 300 1\n100 0 0\n";

    #[test]
    fn forward_point_lift() {
        let chain = chain_from(FORWARD_CHAIN);
        let (chrom, pos, strand) = chain.lift("chr1", 100).unwrap();
        assert_eq!(chrom, "chr1");
        assert_eq!(pos, 200);
        assert_eq!(strand, Strand::Forward);

        let (_, pos, _) = chain.lift("chr1", 150).unwrap();
        assert_eq!(pos, 250);
    }

    #[test]
    fn chrless_alias_lookup() {
        let chain = chain_from(FORWARD_CHAIN);
        assert!(chain.lift("1", 150).is_ok());
    }

    #[test]
    fn reverse_strand_reflects_coordinates() {
        let chain =
            chain_from("chain 100 chr1 1000 + 100 200 chr1 1000 - 100 200 1\n100 0 0\n");
        let (_, pos, strand) = chain.lift("chr1", 100).unwrap();
        assert_eq!(strand, Strand::Reverse);
        assert_eq!(pos, 899);

        let (_, pos, _) = chain.lift("chr1", 199).unwrap();
        assert_eq!(pos, 800);
    }

    #[test]
    fn unmapped_and_ambiguous_fail_closed() {
        let chain = chain_from(FORWARD_CHAIN);
        assert_eq!(chain.lift("chr1", 50), Err(LiftError::Unmapped));
        assert_eq!(chain.lift("chr9", 150), Err(LiftError::Unmapped));

        let tied = chain_from(concat!(
            "chain 100 chr1 1000 + 100 200 chr1 1000 + 200 300 1\n100 0 0\n",
            "\n",
            "chain 100 chr1 1000 + 100 200 chr2 1000 + 400 500 2\n100 0 0\n",
        ));
        assert_eq!(tied.lift("chr1", 150), Err(LiftError::Ambiguous));
    }

    #[test]
    fn higher_score_chain_wins() {
        let chain = chain_from(concat!(
            "chain 100 chr1 1000 + 100 200 chr1 1000 + 200 300 1\n100 0 0\n",
            "\n",
            "chain 90 chr1 1000 + 100 200 chr2 1000 + 400 500 2\n100 0 0\n",
        ));
        let (chrom, pos, _) = chain.lift("chr1", 150).unwrap();
        assert_eq!(chrom, "chr1");
        assert_eq!(pos, 250);
    }

    #[test]
    fn gap_blocks_advance_both_cursors() {
        // Two 50-base blocks separated by a 10-base source gap and a
        // 20-base destination gap.
        let chain =
            chain_from("chain 100 chr1 1000 + 100 220 chr1 1000 + 300 440 7\n50 10 20\n50\n");
        let (_, pos, _) = chain.lift("chr1", 120).unwrap();
        assert_eq!(pos, 320);
        let (_, pos, _) = chain.lift("chr1", 165).unwrap();
        assert_eq!(pos, 375);
        // Inside the source gap: unmapped.
        assert_eq!(chain.lift("chr1", 155), Err(LiftError::Unmapped));
    }

    #[test]
    fn engine_lifts_variant_and_end_position() {
        let chain = Arc::new(chain_from(FORWARD_CHAIN));
        let engine = LiftoverEngine::new(chain, None, true, true);

        let mut var = Candidate::new("chr1", 151, "A", "G");
        engine.lift_variant(&mut var).unwrap();
        assert_eq!(var.chrom, "chr1");
        assert_eq!(var.pos, 251);
        assert_eq!(var.end_pos, 251);
        assert_eq!(var.ori_pos, 151);
    }

    #[test]
    fn engine_drops_on_failed_end_lift() {
        // Block covers source 100..110 (0-based); an end position beyond it
        // lifts the start but not the end.
        let chain =
            Arc::new(chain_from("chain 100 chr1 1000 + 100 110 chr1 1000 + 200 210 1\n10 0 0\n"));
        let engine = LiftoverEngine::new(chain, None, true, true);

        let mut var = Candidate::new("chr1", 105, "ATGCATGCAT", "A");
        assert_eq!(var.end_pos, 114);
        match engine.lift_variant(&mut var) {
            Err(DropReason::LiftoverFailure(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn chrm_uses_its_own_decision() {
        let chain = Arc::new(chain_from(FORWARD_CHAIN));
        let engine = LiftoverEngine::new(chain, None, false, true);
        assert!(!engine.needed_for("chr1"));
        assert!(engine.needed_for("chrM"));

        let disabled = LiftoverEngine::disabled();
        assert!(!disabled.needed_for("chrM"));
    }

    #[test]
    fn reverse_complement_complements_and_reverses() {
        assert_eq!(reverse_complement("ATGC"), "GCAT");
        assert_eq!(reverse_complement("acgt"), "ACGT");
        assert_eq!(reverse_complement("AAC"), "GTT");
    }
}
