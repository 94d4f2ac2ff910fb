use crate::types::Protocol;

/// Labels in match order. http must come after http2 (and grpc traffic, which
/// dissects as http2) since those stacks also contain "http".
pub const CLASSIFICATION_ORDER: [Protocol; 13] = [
    Protocol::Http2,
    Protocol::Mysql,
    Protocol::Pgsql,
    Protocol::Cql,
    Protocol::Amqp,
    Protocol::Redis,
    Protocol::Dns,
    Protocol::Mongo,
    Protocol::Http,
    Protocol::Ssh,
    Protocol::Kafka,
    Protocol::Mux,
    Protocol::Tls,
];

/// Map a dissector protocol stack such as `sll:ethertype:ip:tcp:http:http2:grpc`
/// to the first canonical label it contains, or [`Protocol::Unknown`].
pub fn classify(stack: &str) -> Protocol {
    CLASSIFICATION_ORDER
        .iter()
        .copied()
        .find(|p| stack.contains(p.as_str()))
        .unwrap_or(Protocol::Unknown)
}
