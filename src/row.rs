use std::fmt;
use std::io::{BufRead, BufReader, Read};

use tracing::trace;

use crate::types::Transport;

#[derive(Debug)]
pub enum ParseError {
    MissingField { line: u64, field: &'static str },
    InvalidPort { line: u64, value: String },
    InvalidLength { line: u64, value: String },
    InvalidProtocol { line: u64, value: String },
    Io(std::io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingField { line, field } => {
                write!(f, "line {line}: missing field {field}")
            }
            ParseError::InvalidPort { line, value } => {
                write!(f, "line {line}: invalid port '{value}'")
            }
            ParseError::InvalidLength { line, value } => {
                write!(f, "line {line}: invalid message length list '{value}'")
            }
            ParseError::InvalidProtocol { line, value } => {
                write!(f, "line {line}: invalid protocol label '{value}'")
            }
            ParseError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError::Io(e)
    }
}

/// Field names in dissector output order. Length-list fields follow these.
pub const FIXED_FIELDS: [&str; 9] = [
    "tcp.payload",
    "udp.payload",
    "frame.protocols",
    "ip.src",
    "ip.dst",
    "tcp.srcport",
    "udp.srcport",
    "tcp.dstport",
    "udp.dstport",
];

const PROTOCOL_STACK_INDEX: usize = 2;

/// One packet as emitted by the dissector, fields still in text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DissectedRow {
    /// 1-based input line, 0 when the row was built in memory.
    pub line: u64,
    pub tcp_payload: String,
    pub udp_payload: String,
    pub protocol_stack: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub tcp_src_port: String,
    pub udp_src_port: String,
    pub tcp_dst_port: String,
    pub udp_dst_port: String,
    /// Per-protocol message length lists, one per registered framing rule.
    pub length_fields: Vec<String>,
}

impl DissectedRow {
    /// Parse one tab-separated dissector line (without its newline).
    pub fn parse(line_no: u64, line: &[u8]) -> Result<Self, ParseError> {
        let mut fields: Vec<&[u8]> = Vec::with_capacity(FIXED_FIELDS.len() + 4);
        let mut start = 0;
        for tab in memchr::memchr_iter(b'\t', line) {
            fields.push(&line[start..tab]);
            start = tab + 1;
        }
        // A line ending in a separator carries no extra empty field.
        if start < line.len() || fields.is_empty() {
            fields.push(&line[start..]);
        }

        // Without a protocol stack the row cannot even be classified. Later
        // fixed fields may be absent when they are empty at the end of a line.
        if fields.len() <= PROTOCOL_STACK_INDEX {
            return Err(ParseError::MissingField {
                line: line_no,
                field: FIXED_FIELDS[fields.len()],
            });
        }
        if fields.len() < FIXED_FIELDS.len() {
            fields.resize(FIXED_FIELDS.len(), b"".as_slice());
        }

        let text = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
        Ok(DissectedRow {
            line: line_no,
            tcp_payload: normalize_hex(fields[0]),
            udp_payload: normalize_hex(fields[1]),
            protocol_stack: text(fields[2]),
            src_addr: text(fields[3]),
            dst_addr: text(fields[4]),
            tcp_src_port: text(fields[5]),
            udp_src_port: text(fields[6]),
            tcp_dst_port: text(fields[7]),
            udp_dst_port: text(fields[8]),
            length_fields: fields[FIXED_FIELDS.len()..].iter().map(|f| text(f)).collect(),
        })
    }

    pub fn transport(&self) -> Transport {
        Transport::from_stack(&self.protocol_stack)
    }

    /// Payload for the row's transport family.
    pub fn payload(&self) -> &str {
        match self.transport() {
            Transport::Tcp => &self.tcp_payload,
            Transport::Udp => &self.udp_payload,
        }
    }

    /// Source and destination ports for the row's transport family.
    pub fn ports(&self) -> Result<(u16, u16), ParseError> {
        let (src, dst, src_name, dst_name) = match self.transport() {
            Transport::Tcp => (&self.tcp_src_port, &self.tcp_dst_port, "tcp.srcport", "tcp.dstport"),
            Transport::Udp => (&self.udp_src_port, &self.udp_dst_port, "udp.srcport", "udp.dstport"),
        };
        Ok((
            parse_port(self.line, src, src_name)?,
            parse_port(self.line, dst, dst_name)?,
        ))
    }

    /// The first populated length-list field, if any.
    pub fn message_lengths(&self) -> Result<Option<Vec<usize>>, ParseError> {
        let Some(field) = self.length_fields.iter().find(|f| !f.is_empty()) else {
            return Ok(None);
        };
        field
            .split(',')
            .map(|v| {
                v.trim().parse::<usize>().map_err(|_| ParseError::InvalidLength {
                    line: self.line,
                    value: field.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

fn parse_port(line: u64, value: &str, field: &'static str) -> Result<u16, ParseError> {
    if value.is_empty() {
        return Err(ParseError::MissingField { line, field });
    }
    value.trim().parse().map_err(|_| ParseError::InvalidPort {
        line,
        value: value.to_string(),
    })
}

/// Some dissector versions print payloads as `de:ad:be:ef`.
fn normalize_hex(field: &[u8]) -> String {
    if memchr::memchr(b':', field).is_none() {
        return String::from_utf8_lossy(field).into_owned();
    }
    field
        .iter()
        .filter(|&&b| b != b':')
        .map(|&b| b as char)
        .collect()
}

/// Reads dissector rows from a line-oriented stream.
pub struct RowIterator<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    line: u64,
}

impl<R: Read> RowIterator<R> {
    pub fn new(reader: R) -> Self {
        RowIterator {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            line: 0,
        }
    }

    pub fn lines_read(&self) -> u64 {
        self.line
    }
}

impl<R: Read> Iterator for RowIterator<R> {
    type Item = Result<DissectedRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.inner.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(ParseError::Io(e))),
            }
            self.line += 1;

            let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                trace!(line = self.line, "skipping blank line");
                continue;
            }
            return Some(DissectedRow::parse(self.line, line));
        }
    }
}
