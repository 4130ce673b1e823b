use std::{
    collections::HashMap,
    fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use lru::LruCache;
use noodles::{
    core::{Position, Region},
    fasta::{self, fai},
};
use parking_lot::Mutex;
use thiserror::Error;

/// Read-only access to reference genome bases, shared across workers.
pub trait ReferenceReader: Send + Sync {
    /// `len` bases starting at the 1-based `pos`, upper-cased.
    fn get_bases(&self, chrom: &str, pos: u64, len: usize) -> Result<String, ReferenceError>;
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown contig: {query}")]
    UnknownContig { query: String },
    #[error("position {position} is outside contig {contig} length {length}")]
    PositionOutOfBounds {
        contig: String,
        position: u64,
        length: u64,
    },
    #[error("invalid genomic position: {0}")]
    InvalidPosition(#[from] noodles::core::position::TryFromIntError),
}

struct Contig {
    name: String,
    length: u64,
}

/// Indexed FASTA reference. Contig lookup is alias-tolerant (`chr` prefix,
/// case, M/MT), single-base reads go through an LRU cache, and clones share
/// the underlying reader so worker threads can hold cheap handles.
pub struct FastaReference {
    reader: Arc<Mutex<fasta::io::IndexedReader<fasta::io::BufReader<fs::File>>>>,
    contigs: Arc<Vec<Contig>>,
    aliases: Arc<HashMap<String, usize>>,
    cache: Arc<Mutex<LruCache<(usize, u64), u8>>>,
}

impl Clone for FastaReference {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            contigs: Arc::clone(&self.contigs),
            aliases: Arc::clone(&self.aliases),
            cache: Arc::clone(&self.cache),
        }
    }
}

const BASE_CACHE_CAPACITY: usize = 128 * 1024;

impl FastaReference {
    /// Open a FASTA file, reading the `.fai` index next to it or building
    /// and persisting one when absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReferenceError> {
        let path = fs::canonicalize(path.as_ref())?;
        let index_path = sibling_index_path(&path);

        let index = if index_path.exists() {
            fai::fs::read(&index_path)?
        } else {
            let index = fasta::fs::index(&path)?;
            fai::fs::write(&index_path, &index)?;
            index
        };

        let reader = fasta::io::indexed_reader::Builder::default()
            .set_index(index.clone())
            .build_from_path(&path)?;

        let mut contigs = Vec::new();
        for record in index.as_ref() {
            contigs.push(Contig {
                name: String::from_utf8_lossy(record.name().as_ref()).into_owned(),
                length: record.length(),
            });
        }
        let aliases = alias_table(&contigs);

        let capacity = NonZeroUsize::new(BASE_CACHE_CAPACITY).expect("non-zero cache capacity");
        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            contigs: Arc::new(contigs),
            aliases: Arc::new(aliases),
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    fn resolve(&self, query: &str) -> Option<usize> {
        self.aliases.get(&alias_key(query)).copied()
    }

    fn fetch(&self, contig_idx: usize, pos: u64, len: usize) -> Result<String, ReferenceError> {
        let contig = &self.contigs[contig_idx];
        let end = pos + len as u64 - 1;
        if pos == 0 || end > contig.length {
            return Err(ReferenceError::PositionOutOfBounds {
                contig: contig.name.clone(),
                position: pos,
                length: contig.length,
            });
        }

        let start = Position::try_from(pos as usize)?;
        let stop = Position::try_from(end as usize)?;
        let region = Region::new(contig.name.clone(), start..=stop);
        let record = self.reader.lock().query(&region)?;
        let mut bases = String::with_capacity(len);
        for b in record.sequence().as_ref() {
            bases.push(char::from(b.to_ascii_uppercase()));
        }
        Ok(bases)
    }
}

impl ReferenceReader for FastaReference {
    fn get_bases(&self, chrom: &str, pos: u64, len: usize) -> Result<String, ReferenceError> {
        let contig_idx = self
            .resolve(chrom)
            .ok_or_else(|| ReferenceError::UnknownContig {
                query: chrom.to_string(),
            })?;

        if len != 1 {
            return self.fetch(contig_idx, pos, len);
        }

        let key = (contig_idx, pos);
        if let Some(base) = self.cache.lock().get(&key).copied() {
            return Ok(char::from(base).to_string());
        }
        let bases = self.fetch(contig_idx, pos, 1)?;
        if let Some(&b) = bases.as_bytes().first() {
            self.cache.lock().put(key, b);
        }
        Ok(bases)
    }
}

fn sibling_index_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".fai");
    PathBuf::from(s)
}

fn alias_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("chr").unwrap_or(trimmed);
    let upper = trimmed.to_ascii_uppercase();
    if upper == "M" {
        String::from("MT")
    } else {
        upper
    }
}

fn alias_table(contigs: &[Contig]) -> HashMap<String, usize> {
    let mut table = HashMap::new();
    for (idx, contig) in contigs.iter().enumerate() {
        table.entry(alias_key(&contig.name)).or_insert(idx);
        table
            .entry(contig.name.to_ascii_uppercase())
            .or_insert(idx);
    }
    table
}

/// In-memory reference over literal contig sequences. Serves unit tests and
/// callers embedding the pipeline with a preloaded genome slice.
pub struct FixedReference {
    contigs: HashMap<String, String>,
}

impl FixedReference {
    pub fn new(chrom: &str, sequence: &str) -> Self {
        let mut contigs = HashMap::new();
        contigs.insert(alias_key(chrom), sequence.to_ascii_uppercase());
        Self { contigs }
    }

    pub fn insert(&mut self, chrom: &str, sequence: &str) {
        self.contigs
            .insert(alias_key(chrom), sequence.to_ascii_uppercase());
    }
}

impl ReferenceReader for FixedReference {
    fn get_bases(&self, chrom: &str, pos: u64, len: usize) -> Result<String, ReferenceError> {
        let sequence =
            self.contigs
                .get(&alias_key(chrom))
                .ok_or_else(|| ReferenceError::UnknownContig {
                    query: chrom.to_string(),
                })?;
        let end = pos + len as u64 - 1;
        if pos == 0 || end > sequence.len() as u64 {
            return Err(ReferenceError::PositionOutOfBounds {
                contig: chrom.to_string(),
                position: pos,
                length: sequence.len() as u64,
            });
        }
        Ok(sequence[(pos - 1) as usize..end as usize].to_string())
    }
}
