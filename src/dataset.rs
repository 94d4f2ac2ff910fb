use std::fmt::Display;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::aggregate::{aggregate_bidirectional, aggregate_connections};
use crate::dissect::{DissectError, DissectedRows};
use crate::record::RecordBuilder;
use crate::row::ParseError;
use crate::types::OutputRecord;

pub const PACKET_DATASET: &str = "packet_dataset.tsv";
pub const CONN_DATASET: &str = "conn_dataset.tsv";
pub const BIDIR_DATASET: &str = "bi_dir_conn_dataset.tsv";

impl OutputRecord {
    /// Parse one line of the flat dataset schema.
    pub fn from_tsv_line(line_no: u64, line: &str) -> Result<Self, ParseError> {
        const NAMES: [&str; 6] = ["message", "protocol", "src_addr", "dst_addr", "src_port", "dst_port"];
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < NAMES.len() {
            return Err(ParseError::MissingField {
                line: line_no,
                field: NAMES[fields.len()],
            });
        }
        let protocol = fields[1].parse().map_err(|_| ParseError::InvalidProtocol {
            line: line_no,
            value: fields[1].to_string(),
        })?;
        let port = |v: &str| {
            v.parse::<u16>().map_err(|_| ParseError::InvalidPort {
                line: line_no,
                value: v.to_string(),
            })
        };
        Ok(OutputRecord {
            message: fields[0].to_string(),
            protocol,
            src_addr: fields[2].to_string(),
            dst_addr: fields[3].to_string(),
            src_port: port(fields[4])?,
            dst_port: port(fields[5])?,
        })
    }
}

/// Reads a previously written flat dataset.
pub struct FlatRecordIterator<R> {
    inner: BufReader<R>,
    buf: String,
    line: u64,
}

impl<R: Read> FlatRecordIterator<R> {
    pub fn new(reader: R) -> Self {
        FlatRecordIterator {
            inner: BufReader::new(reader),
            buf: String::new(),
            line: 0,
        }
    }
}

impl<R: Read> Iterator for FlatRecordIterator<R> {
    type Item = Result<OutputRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.inner.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(ParseError::Io(e))),
            }
            self.line += 1;
            let line = self.buf.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            return Some(OutputRecord::from_tsv_line(self.line, line));
        }
    }
}

/// Write one item per line.
pub fn write_lines<W, I>(out: &mut W, items: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator,
    I::Item: Display,
{
    for item in items {
        writeln!(out, "{item}")?;
    }
    Ok(())
}

/// Write the flat, per-connection and bidirectional datasets into `dir`,
/// replacing any earlier output.
pub fn write_dataset(dir: &Path, records: &[OutputRecord]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    write_file(&dir.join(PACKET_DATASET), records)?;
    write_file(&dir.join(CONN_DATASET), aggregate_connections(records))?;
    write_file(&dir.join(BIDIR_DATASET), aggregate_bidirectional(records))?;
    Ok(())
}

fn write_file<I>(path: &Path, items: I) -> io::Result<()>
where
    I: IntoIterator,
    I::Item: Display,
{
    let mut out = BufWriter::new(File::create(path)?);
    write_lines(&mut out, items)?;
    out.flush()?;
    info!(path = %path.display(), "wrote dataset");
    Ok(())
}

/// Build records from per-capture dissection results, in capture order,
/// through one builder so duplicates are removed across the whole run.
///
/// Failed captures are skipped; their count is returned alongside the records.
/// Malformed rows inside a capture are skipped one by one and counted in the
/// builder's stats.
pub fn collect_records(
    builder: &mut RecordBuilder,
    dissected: Vec<Result<DissectedRows, DissectError>>,
) -> (Vec<OutputRecord>, usize) {
    let mut records = Vec::new();
    let mut failed = 0;
    for result in dissected {
        match result {
            Ok(rows) => records.extend(builder.records(rows)),
            Err(_) => failed += 1,
        }
    }
    (records, failed)
}

/// Find capture files laid out as `root/<capture-run>/<pod>/<file>`.
///
/// Only regular files exactly three levels below `root` are considered, so
/// the run and pod levels are always directories. Results are sorted so runs
/// are reproducible.
pub fn discover_captures(root: &Path, pattern: &Regex) -> io::Result<Vec<PathBuf>> {
    let mut captures = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matched = entry
            .file_name()
            .to_str()
            .is_some_and(|n| pattern.is_match(n));
        if matched {
            captures.push(entry.into_path());
        }
    }
    debug!(root = %root.display(), count = captures.len(), "discovered captures");
    Ok(captures)
}
