use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tempfile::NamedTempFile;

/// One worker's share of a read batch: raw lines paired with their 1-based
/// line numbers.
#[derive(Clone, Debug, Default)]
pub struct LineChunk {
    pub lines: Vec<(u64, String)>,
}

impl LineChunk {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Random-access, line-indexed reader over a text input.
///
/// The whole file is scanned once at open to build a byte-offset index of
/// line starts, so successive batch reads seek directly to their first line
/// instead of rescanning. Gzipped inputs are decompressed into a temp file
/// first; the index is built over the decompressed bytes.
pub struct LineBatchReader {
    file: File,
    offsets: Vec<u64>,
    _spill: Option<NamedTempFile>,
}

impl LineBatchReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let mut spill = None;

        let file = if is_gzipped(path)? {
            tracing::debug!(input = %path.display(), "decompressing gzipped input");
            let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(path)?));
            let mut tmp = NamedTempFile::new()?;
            io::copy(&mut decoder, tmp.as_file_mut())?;
            let file = tmp.reopen()?;
            spill = Some(tmp);
            file
        } else {
            File::open(path)?
        };

        let offsets = index_lines(&file)?;

        Ok(Self {
            file,
            offsets,
            _spill: spill,
        })
    }

    /// Number of lines in the input.
    pub fn line_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Slice up to `num_workers * batch_size` lines starting at the 1-based
    /// `start_line` into contiguous per-worker chunks of `batch_size` lines.
    /// The flag reports whether lines remain beyond this read.
    pub fn read_batch(
        &mut self,
        start_line: u64,
        num_workers: usize,
        batch_size: usize,
    ) -> io::Result<(Vec<LineChunk>, bool)> {
        let total = self.line_count();
        if start_line == 0 || start_line > total {
            return Ok((Vec::new(), false));
        }

        let span = (num_workers * batch_size) as u64;
        let end_line = (start_line + span - 1).min(total);

        self.file
            .seek(SeekFrom::Start(self.offsets[(start_line - 1) as usize]))?;
        let mut reader = BufReader::new(&self.file);

        let mut chunks: Vec<LineChunk> = Vec::with_capacity(num_workers);
        let mut current = LineChunk::default();
        let mut buf = String::new();
        for line_no in start_line..=end_line {
            buf.clear();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                break;
            }
            let text = buf.trim_end_matches(['\n', '\r']).to_string();
            current.lines.push((line_no, text));
            if current.len() >= batch_size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        Ok((chunks, end_line < total))
    }
}

/// Open an input as a buffered text stream, peeling a gzip layer if present.
/// Used for header scans that do not need random access.
pub fn open_text(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(
            file,
        )))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

// GZIP magic: 1f 8b. BGZF is a gzip flavor, so the same check covers it.
fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn index_lines(file: &File) -> io::Result<Vec<u64>> {
    let mut reader = BufReader::with_capacity(64 * 1024, file.try_clone()?);
    let mut newlines = Vec::new();
    let mut pos: u64 = 0;

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        for idx in memchr::memchr_iter(b'\n', buf) {
            newlines.push(pos + idx as u64);
        }
        let consumed = buf.len();
        pos += consumed as u64;
        reader.consume(consumed);
    }

    let total = pos;
    let mut offsets = Vec::with_capacity(newlines.len() + 1);
    if total > 0 {
        offsets.push(0);
    }
    for newline in newlines {
        if newline + 1 < total {
            offsets.push(newline + 1);
        }
    }
    Ok(offsets)
}
