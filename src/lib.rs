pub mod aggregate;
pub mod classify;
pub mod dataset;
pub mod dedup;
pub mod dissect;
pub mod frame;
pub mod record;
pub mod row;
pub mod types;

pub use aggregate::{
    aggregate_bidirectional, aggregate_connections, Aggregator, BidirectionalAggregator,
    ConnectionAggregator, GroupKey,
};
pub use classify::classify;
pub use dataset::{collect_records, discover_captures, write_dataset, FlatRecordIterator};
pub use dedup::DuplicateFilter;
pub use dissect::{dissect_all, DissectError, DissectedRows, Dissector};
pub use frame::{FramingRule, FramingTable};
pub use record::{BuildStats, RecordBuilder, RecordStream};
pub use row::{DissectedRow, ParseError, RowIterator};
pub use types::*;
