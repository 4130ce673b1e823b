use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::ErrorRow;
use crate::variant::Candidate;

pub const VARIANT_TABLE: &str = "variant";
pub const MAPPING_TABLE: &str = "mapping";
pub const ERR_TABLE: &str = "err";

pub fn sample_table_name(sample: &str) -> String {
    format!("sample__{sample}")
}

/// A single table cell. Nulls render as empty fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellValue {
    Null,
    UInt(u64),
    Str(String),
    Bool(bool),
}

impl CellValue {
    fn render(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::UInt(v) => v.to_string(),
            CellValue::Str(s) => s.clone(),
            CellValue::Bool(b) => String::from(if *b { "1" } else { "0" }),
        }
    }
}

impl From<u64> for CellValue {
    fn from(v: u64) -> Self {
        CellValue::UInt(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Str(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Str(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

/// Columnar batch for one named table. Storage may be preallocated: rows
/// land by index inside the preallocation and fall back to push growth past
/// it; `seal` truncates the columns to the actual row count before handoff.
#[derive(Clone, Debug)]
pub struct TableBatch {
    pub name: String,
    columns: Vec<String>,
    cells: Vec<Vec<CellValue>>,
    rows: usize,
}

impl TableBatch {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self::with_capacity(name, columns, 0)
    }

    pub fn with_capacity(name: &str, columns: &[&str], capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            cells: columns
                .iter()
                .map(|_| vec![CellValue::Null; capacity])
                .collect(),
            rows: 0,
        }
    }

    pub fn push_row(&mut self, values: Vec<CellValue>) {
        debug_assert_eq!(values.len(), self.columns.len());
        let preallocated = self.cells.first().map(Vec::len).unwrap_or(0);
        for (column, value) in self.cells.iter_mut().zip(values) {
            if self.rows < preallocated {
                column[self.rows] = value;
            } else {
                column.push(value);
            }
        }
        self.rows += 1;
    }

    /// Truncate every column to the actual row count.
    pub fn seal(&mut self) {
        for column in &mut self.cells {
            column.truncate(self.rows);
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn cell(&self, row: usize, column: usize) -> &CellValue {
        &self.cells[column][row]
    }

    /// Row-major view, for writers and assertions.
    pub fn row(&self, row: usize) -> Vec<CellValue> {
        self.cells.iter().map(|c| c[row].clone()).collect()
    }
}

const COLLECT_MARGIN: f64 = 1.2;

const VARIANT_COLUMNS: [&str; 8] = [
    "uid", "chrom", "pos", "end_pos", "ref_base", "alt_base", "fileno", "lineno",
];
const MAPPING_COLUMNS: [&str; 6] = [
    "uid",
    "ori_chrom",
    "ori_pos",
    "ori_end_pos",
    "ori_ref_base",
    "ori_alt_base",
];
const SAMPLE_COLUMNS: [&str; 3] = ["uid", "has", "genotype"];
const ERR_COLUMNS: [&str; 4] = ["fileno", "lineno", "errno", "err"];

/// Accumulates one read batch's worth of table rows. The variant and
/// mapping tables are preallocated at 1.2x the estimated row count per
/// batch; sample and error tables grow by append.
pub struct OutputAssembler {
    samples: Vec<String>,
    variant: TableBatch,
    mapping: TableBatch,
    err: TableBatch,
    sample_tables: BTreeMap<String, TableBatch>,
}

impl OutputAssembler {
    pub fn new(samples: &[String]) -> Self {
        let mut assembler = Self {
            samples: samples.to_vec(),
            variant: TableBatch::new(VARIANT_TABLE, &VARIANT_COLUMNS),
            mapping: TableBatch::new(MAPPING_TABLE, &MAPPING_COLUMNS),
            err: TableBatch::new(ERR_TABLE, &ERR_COLUMNS),
            sample_tables: BTreeMap::new(),
        };
        assembler.reset(0);
        assembler
    }

    /// Start a fresh batch sized for `estimated_rows` committed variants.
    pub fn begin_batch(&mut self, estimated_rows: usize) {
        self.reset((estimated_rows as f64 * COLLECT_MARGIN) as usize);
    }

    fn reset(&mut self, capacity: usize) {
        self.variant = TableBatch::with_capacity(VARIANT_TABLE, &VARIANT_COLUMNS, capacity);
        self.mapping = TableBatch::with_capacity(MAPPING_TABLE, &MAPPING_COLUMNS, capacity);
        self.err = TableBatch::new(ERR_TABLE, &ERR_COLUMNS);
        self.sample_tables = self
            .samples
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    TableBatch::new(&sample_table_name(s), &SAMPLE_COLUMNS),
                )
            })
            .collect();
    }

    pub fn push_variant(&mut self, uid: u64, var: &Candidate) {
        self.variant.push_row(vec![
            uid.into(),
            var.chrom.as_str().into(),
            var.pos.into(),
            var.end_pos.into(),
            var.ref_base.as_str().into(),
            var.alt_base.as_str().into(),
            (var.file_no as u64).into(),
            var.line_no.into(),
        ]);
    }

    pub fn push_mapping(&mut self, uid: u64, var: &Candidate) {
        self.mapping.push_row(vec![
            uid.into(),
            var.ori_chrom.as_str().into(),
            var.ori_pos.into(),
            var.ori_end_pos.into(),
            var.ori_ref_base.as_str().into(),
            var.ori_alt_base.as_str().into(),
        ]);
    }

    pub fn push_sample(&mut self, uid: u64, sample: &str, genotype: &str) {
        if let Some(table) = self.sample_tables.get_mut(sample) {
            table.push_row(vec![uid.into(), true.into(), genotype.into()]);
        } else {
            tracing::warn!(sample, "genotype data for a sample missing from the sample universe");
        }
    }

    pub fn push_error_rows(&mut self, rows: Vec<ErrorRow>) {
        push_error_rows(&mut self.err, rows);
    }

    /// Seal every table to its actual row count and hand the non-empty ones
    /// off, leaving the assembler empty.
    pub fn finish_batch(&mut self) -> Vec<TableBatch> {
        let samples = std::mem::take(&mut self.sample_tables);
        let mut batches = vec![
            std::mem::replace(&mut self.variant, TableBatch::new(VARIANT_TABLE, &VARIANT_COLUMNS)),
            std::mem::replace(&mut self.mapping, TableBatch::new(MAPPING_TABLE, &MAPPING_COLUMNS)),
            std::mem::replace(&mut self.err, TableBatch::new(ERR_TABLE, &ERR_COLUMNS)),
        ];
        batches.extend(samples.into_values());
        self.reset(0);

        let mut out = Vec::new();
        for mut batch in batches {
            batch.seal();
            if !batch.is_empty() {
                out.push(batch);
            }
        }
        out
    }
}

fn push_error_rows(batch: &mut TableBatch, rows: Vec<ErrorRow>) {
    for row in rows {
        batch.push_row(vec![
            (row.file_no as u64).into(),
            row.line_no.into(),
            (row.errno as u64).into(),
            row.message.map(CellValue::Str).unwrap_or(CellValue::Null),
        ]);
    }
}

/// Standalone error batch, used for the forced flush at run end.
pub fn error_batch(rows: Vec<ErrorRow>) -> TableBatch {
    let mut batch = TableBatch::new(ERR_TABLE, &ERR_COLUMNS);
    push_error_rows(&mut batch, rows);
    batch.seal();
    batch
}

/// Destination for finished table batches. Implementations must tolerate
/// `close` on every exit path, including after a fatal error.
pub trait TableWriter {
    fn write_batch(&mut self, batch: &TableBatch) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Writes one `{run_name}.{table}.tsv` file per table, header on first
/// contact with the table.
pub struct TsvTableWriter {
    dir: PathBuf,
    run_name: String,
    files: HashMap<String, BufWriter<File>>,
}

impl TsvTableWriter {
    pub fn new<P: AsRef<Path>>(dir: P, run_name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            run_name: run_name.to_string(),
            files: HashMap::new(),
        })
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.tsv", self.run_name, table))
    }
}

impl TableWriter for TsvTableWriter {
    fn write_batch(&mut self, batch: &TableBatch) -> Result<()> {
        if !self.files.contains_key(&batch.name) {
            let path = self.table_path(&batch.name);
            let file = File::create(&path)
                .with_context(|| format!("failed to create output {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", batch.columns().join("\t"))?;
            self.files.insert(batch.name.clone(), writer);
        }

        let writer = self
            .files
            .get_mut(&batch.name)
            .expect("writer inserted above");
        for row in 0..batch.rows() {
            let rendered: Vec<String> = batch.row(row).iter().map(CellValue::render).collect();
            writeln!(writer, "{}", rendered.join("\t"))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for (table, writer) in self.files.iter_mut() {
            writer
                .flush()
                .with_context(|| format!("failed to flush table {table}"))?;
        }
        Ok(())
    }
}

/// Keeps every batch in memory, row-major per table. Backs in-process
/// consumers and the determinism tests.
#[derive(Debug, Default)]
pub struct MemoryTableWriter {
    tables: BTreeMap<String, (Vec<String>, Vec<Vec<CellValue>>)>,
    closed: bool,
}

impl MemoryTableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> &[Vec<CellValue>] {
        self.tables
            .get(table)
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl TableWriter for MemoryTableWriter {
    fn write_batch(&mut self, batch: &TableBatch) -> Result<()> {
        let entry = self
            .tables
            .entry(batch.name.clone())
            .or_insert_with(|| (batch.columns().to_vec(), Vec::new()));
        for row in 0..batch.rows() {
            entry.1.push(batch.row(row));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
