use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::types::{Aggregated, BidirectionalKey, ConnectionKey, OutputRecord};

/// A grouping of records derived from each record alone.
pub trait GroupKey: Clone + Eq + Hash {
    fn from_record(record: &OutputRecord) -> Self;
}

impl GroupKey for ConnectionKey {
    fn from_record(record: &OutputRecord) -> Self {
        ConnectionKey {
            protocol: record.protocol,
            src_addr: record.src_addr.clone(),
            dst_addr: record.dst_addr.clone(),
            src_port: record.src_port,
            dst_port: record.dst_port,
        }
    }
}

impl GroupKey for BidirectionalKey {
    fn from_record(record: &OutputRecord) -> Self {
        BidirectionalKey::new(
            record.protocol,
            &record.src_endpoint(),
            &record.dst_endpoint(),
        )
    }
}

/// Append-only grouping of messages by key.
///
/// Groups come out in order of each key's first appearance; messages within
/// a group keep their arrival order.
pub struct Aggregator<K> {
    index: HashMap<K, usize>,
    groups: Vec<Aggregated<K>>,
}

pub type ConnectionAggregator = Aggregator<ConnectionKey>;
pub type BidirectionalAggregator = Aggregator<BidirectionalKey>;

impl<K: GroupKey> Default for Aggregator<K> {
    fn default() -> Self {
        Aggregator {
            index: HashMap::new(),
            groups: Vec::new(),
        }
    }
}

impl<K: GroupKey> Aggregator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: &OutputRecord) {
        let key = K::from_record(record);
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.groups.len();
                self.index.insert(key.clone(), slot);
                self.groups.push(Aggregated {
                    key,
                    messages: Vec::new(),
                });
                slot
            }
        };
        self.groups[slot].messages.push(record.message.clone());
    }

    pub fn extend<'r, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'r OutputRecord>,
    {
        for record in records {
            self.push(record);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn finish(self) -> Vec<Aggregated<K>> {
        debug!(groups = self.groups.len(), "aggregation finished");
        self.groups
    }
}

/// Merge records per direction-sensitive connection.
pub fn aggregate_connections<'r, I>(records: I) -> Vec<Aggregated<ConnectionKey>>
where
    I: IntoIterator<Item = &'r OutputRecord>,
{
    let mut agg = ConnectionAggregator::new();
    agg.extend(records);
    agg.finish()
}

/// Merge records per conversation, folding both directions together.
pub fn aggregate_bidirectional<'r, I>(records: I) -> Vec<Aggregated<BidirectionalKey>>
where
    I: IntoIterator<Item = &'r OutputRecord>,
{
    let mut agg = BidirectionalAggregator::new();
    agg.extend(records);
    agg.finish()
}
