use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Refuse frames larger than this instead of trusting a corrupt length
/// prefix to size an allocation.
const MAX_FRAME_BYTES: usize = 16 << 20;

/// One on-disk frame: `[u32 len][bincode body][u32 crc32]`, little endian.
/// The length counts the body only.
fn write_frame(out: &mut impl Write, record: &Record) -> io::Result<()> {
    let body = bincode::serialize(record)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    out.write_all(&(body.len() as u32).to_le_bytes())?;
    out.write_all(&body)?;
    out.write_all(&crc32fast::hash(&body).to_le_bytes())?;
    Ok(())
}

enum Frame {
    Complete(Record),
    /// Clean end of file on a frame boundary.
    End,
    /// A frame cut off mid-write, failing its checksum, or undecodable.
    Damaged,
}

fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(Frame::Damaged);
    }

    let mut body = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut body)? || !fill(reader, &mut crc_buf)? {
        return Ok(Frame::Damaged);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&body) {
        return Ok(Frame::Damaged);
    }

    match bincode::deserialize(&body) {
        Ok(record) => Ok(Frame::Complete(record)),
        Err(_) => Ok(Frame::Damaged),
    }
}

/// Append-only record log. Appends are buffered so the writer task can batch
/// a burst of records into one flush + fsync (group commit); nothing is
/// durable until `flush_sync` returns.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Buffer one record. Pair with `flush_sync` to commit the batch.
    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        write_frame(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append one record durably. Test convenience; the writer task batches.
    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Phase one of compaction: write the replacement log to a sibling temp
    /// file and fsync it. Slow, runs without the log lock held.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let tmp = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for record in records {
            write_frame(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the temp file over the live log and reopen. Fast,
    /// runs under the log lock so no append can slip between the phases.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases back to back. Test convenience.
    #[cfg(test)]
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    /// Read every intact record from disk. A damaged frame at the very end
    /// is the normal crash artifact and is dropped; damage with live frames
    /// after it means accepted records would be silently lost, so replay
    /// fails instead.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            match read_frame(&mut reader)? {
                Frame::Complete(record) => records.push(record),
                Frame::End => return Ok(records),
                Frame::Damaged => {
                    let mut probe = [0u8; 1];
                    return if reader.read(&mut probe)? == 0 {
                        Ok(records)
                    } else {
                        Err(io::Error::new(
                            ErrorKind::InvalidData,
                            format!("WAL damaged mid-file after {} records", records.len()),
                        ))
                    };
                }
            }
        }
    }
}
