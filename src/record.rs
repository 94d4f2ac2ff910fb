use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::classify::classify;
use crate::dedup::DuplicateFilter;
use crate::frame::FramingTable;
use crate::row::{DissectedRow, ParseError};
use crate::types::{OutputRecord, Protocol};

/// Running counters for one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub rows: u64,
    pub malformed: u64,
    pub unknown: u64,
    pub messages: u64,
    pub duplicates: u64,
    pub emitted: u64,
    pub per_protocol: BTreeMap<Protocol, u64>,
}

/// Turns dissected rows into per-message records.
///
/// Owns the run's [`DuplicateFilter`], so every row fed through one builder
/// is deduplicated against every earlier row, whatever file it came from.
pub struct RecordBuilder {
    framing: FramingTable,
    filter: DuplicateFilter,
    stats: BuildStats,
}

impl RecordBuilder {
    pub fn new(framing: FramingTable) -> Self {
        Self::with_filter(framing, DuplicateFilter::new())
    }

    pub fn with_filter(framing: FramingTable, filter: DuplicateFilter) -> Self {
        RecordBuilder {
            framing,
            filter,
            stats: BuildStats::default(),
        }
    }

    pub fn framing(&self) -> &FramingTable {
        &self.framing
    }

    pub fn filter(&self) -> &DuplicateFilter {
        &self.filter
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Count a row that could not even be parsed.
    pub fn record_malformed(&mut self) {
        self.stats.rows += 1;
        self.stats.malformed += 1;
    }

    /// Build the records for one row.
    ///
    /// Rows of unknown protocol yield nothing. Messages already seen in this
    /// run are suppressed. An error means the row was malformed and produced
    /// no records.
    pub fn build(&mut self, row: &DissectedRow) -> Result<Vec<OutputRecord>, ParseError> {
        self.stats.rows += 1;
        let result = self.build_row(row);
        if result.is_err() {
            self.stats.malformed += 1;
        }
        result
    }

    fn build_row(&mut self, row: &DissectedRow) -> Result<Vec<OutputRecord>, ParseError> {
        let protocol = classify(&row.protocol_stack);
        if !protocol.is_known() {
            trace!(line = row.line, stack = %row.protocol_stack, "unknown protocol, dropping row");
            self.stats.unknown += 1;
            return Ok(Vec::new());
        }

        let (src_port, dst_port) = row.ports()?;
        let lengths = row.message_lengths()?;
        let frames = self
            .framing
            .split(row.payload(), lengths.as_deref(), protocol);

        if lengths.as_ref().is_some_and(|l| l.len() != frames.len()) {
            debug!(
                line = row.line,
                %protocol,
                declared = lengths.as_ref().map_or(0, Vec::len),
                framed = frames.len(),
                "framed message count differs from declared lengths"
            );
        }

        let mut records = Vec::with_capacity(frames.len());
        for message in frames {
            self.stats.messages += 1;
            if self.filter.seen_before(message) {
                trace!(line = row.line, %protocol, "duplicate message suppressed");
                self.stats.duplicates += 1;
                continue;
            }
            self.stats.emitted += 1;
            *self.stats.per_protocol.entry(protocol).or_default() += 1;
            records.push(OutputRecord {
                message: message.to_string(),
                protocol,
                src_addr: row.src_addr.clone(),
                dst_addr: row.dst_addr.clone(),
                src_port,
                dst_port,
            });
        }
        Ok(records)
    }

    /// Stream records out of a row source, skipping malformed rows.
    pub fn records<I>(&mut self, rows: I) -> RecordStream<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Result<DissectedRow, ParseError>>,
    {
        RecordStream {
            rows: rows.into_iter(),
            builder: self,
            ready: VecDeque::new(),
        }
    }
}

pub struct RecordStream<'b, I> {
    rows: I,
    builder: &'b mut RecordBuilder,
    ready: VecDeque<OutputRecord>,
}

impl<I> Iterator for RecordStream<'_, I>
where
    I: Iterator<Item = Result<DissectedRow, ParseError>>,
{
    type Item = OutputRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(record);
            }
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "skipping malformed row");
                    self.builder.record_malformed();
                    continue;
                }
            };
            match self.builder.build(&row) {
                Ok(records) => self.ready.extend(records),
                Err(e) => warn!(error = %e, "skipping malformed row"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_row(stack: &str, payload: &str, lengths: &str) -> DissectedRow {
        DissectedRow {
            line: 1,
            tcp_payload: payload.into(),
            protocol_stack: stack.into(),
            src_addr: "10.0.0.1".into(),
            dst_addr: "10.0.0.2".into(),
            tcp_src_port: "40000".into(),
            tcp_dst_port: "3306".into(),
            length_fields: vec![lengths.into(), String::new(), String::new()],
            ..Default::default()
        }
    }

    #[test]
    fn unknown_protocol_dropped() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let records = builder.build(&tcp_row("eth:ip:tcp", "aa", "")).unwrap();
        assert!(records.is_empty());
        assert_eq!(builder.stats().unknown, 1);
        assert_eq!(builder.stats().malformed, 0);
    }

    #[test]
    fn unknown_protocol_with_bad_ports_is_not_malformed() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let mut row = tcp_row("eth:ip:tcp", "aa", "");
        row.tcp_src_port = "nope".into();
        assert!(builder.build(&row).unwrap().is_empty());
        assert_eq!(builder.stats().malformed, 0);
    }

    #[test]
    fn mysql_split_into_records() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let row = tcp_row("eth:ip:tcp:mysql", "0100000003020000010a0b", "1,2");
        let records = builder.build(&row).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "0100000003");
        assert_eq!(records[1].message, "020000010a0b");
        for r in &records {
            assert_eq!(r.protocol, Protocol::Mysql);
            assert_eq!(r.src_port, 40000);
            assert_eq!(r.dst_port, 3306);
        }
        assert_eq!(builder.stats().per_protocol.get(&Protocol::Mysql), Some(&2));
    }

    #[test]
    fn duplicates_suppressed_across_rows() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let row = tcp_row("eth:ip:tcp:redis", "2a310d0a", "");
        assert_eq!(builder.build(&row).unwrap().len(), 1);
        assert!(builder.build(&row).unwrap().is_empty());
        let stats = builder.stats();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.emitted, 1);
        assert_eq!(builder.filter().len(), 1);
    }

    #[test]
    fn malformed_row_counted() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let mut row = tcp_row("eth:ip:tcp:mysql", "aa", "");
        row.tcp_dst_port = String::new();
        assert!(builder.build(&row).is_err());
        assert_eq!(builder.stats().malformed, 1);
        assert_eq!(builder.stats().rows, 1);
    }

    #[test]
    fn udp_row_uses_udp_fields() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let row = DissectedRow {
            tcp_payload: "ffff".into(),
            udp_payload: "1234".into(),
            protocol_stack: "eth:ip:udp:dns".into(),
            src_addr: "a".into(),
            dst_addr: "b".into(),
            udp_src_port: "5353".into(),
            udp_dst_port: "53".into(),
            ..Default::default()
        };
        let records = builder.build(&row).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "1234");
        assert_eq!((records[0].src_port, records[0].dst_port), (5353, 53));
    }

    #[test]
    fn stream_skips_errors() {
        let mut builder = RecordBuilder::new(FramingTable::default());
        let rows = vec![
            Err(ParseError::MissingField {
                line: 1,
                field: "frame.protocols",
            }),
            Ok(tcp_row("eth:ip:tcp:http", "aa", "")),
            Ok(tcp_row("eth:ip:tcp:http", "bb", "")),
        ];
        let records: Vec<_> = builder.records(rows).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(builder.stats().malformed, 1);
        assert_eq!(builder.stats().rows, 3);
    }
}
