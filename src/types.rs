use std::fmt;
use std::str::FromStr;

/// Separator between merged messages in aggregated records. Hex payloads never contain it.
pub const MESSAGE_SEPARATOR: &str = ",";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// A row is TCP when its protocol stack mentions tcp anywhere, UDP otherwise.
    pub fn from_stack(stack: &str) -> Self {
        if stack.contains("tcp") {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Canonical protocol label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http2,
    Mysql,
    Pgsql,
    Cql,
    Amqp,
    Redis,
    Dns,
    Mongo,
    Http,
    Ssh,
    Kafka,
    Mux,
    Tls,
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http2 => "http2",
            Protocol::Mysql => "mysql",
            Protocol::Pgsql => "pgsql",
            Protocol::Cql => "cql",
            Protocol::Amqp => "amqp",
            Protocol::Redis => "redis",
            Protocol::Dns => "dns",
            Protocol::Mongo => "mongo",
            Protocol::Http => "http",
            Protocol::Ssh => "ssh",
            Protocol::Kafka => "kafka",
            Protocol::Mux => "mux",
            Protocol::Tls => "tls",
            Protocol::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Protocol::Unknown
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let protocol = match s {
            "http2" => Protocol::Http2,
            "mysql" => Protocol::Mysql,
            "pgsql" => Protocol::Pgsql,
            "cql" => Protocol::Cql,
            "amqp" => Protocol::Amqp,
            "redis" => Protocol::Redis,
            "dns" => Protocol::Dns,
            "mongo" => Protocol::Mongo,
            "http" => Protocol::Http,
            "ssh" => Protocol::Ssh,
            "kafka" => Protocol::Kafka,
            "mux" => Protocol::Mux,
            "tls" => Protocol::Tls,
            "unknown" => Protocol::Unknown,
            other => return Err(format!("unknown protocol label '{other}'")),
        };
        Ok(protocol)
    }
}

/// One framed application message with the connection it was captured on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    /// Hex-encoded message bytes.
    pub message: String,
    pub protocol: Protocol,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
}

impl OutputRecord {
    pub fn src_endpoint(&self) -> String {
        format!("{}:{}", self.src_addr, self.src_port)
    }

    pub fn dst_endpoint(&self) -> String {
        format!("{}:{}", self.dst_addr, self.dst_port)
    }
}

/// Flat dataset schema: `message protocol src_addr dst_addr src_port dst_port`.
impl fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.message, self.protocol, self.src_addr, self.dst_addr, self.src_port, self.dst_port
        )
    }
}

/// Direction-sensitive connection 5-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Direction-agnostic conversation key.
///
/// `endpoints` holds both `addr:port` strings, the lexicographically greater
/// one first, joined by a single space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BidirectionalKey {
    pub protocol: Protocol,
    pub endpoints: String,
}

impl BidirectionalKey {
    pub fn new(protocol: Protocol, a: &str, b: &str) -> Self {
        let (first, second) = if a > b { (a, b) } else { (b, a) };
        BidirectionalKey {
            protocol,
            endpoints: format!("{first} {second}"),
        }
    }
}

/// Messages merged under one group key, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregated<K> {
    pub key: K,
    pub messages: Vec<String>,
}

impl<K> Aggregated<K> {
    pub fn joined_messages(&self) -> String {
        self.messages.join(MESSAGE_SEPARATOR)
    }
}

/// Per-connection schema: `messages protocol src_addr dst_addr src_port dst_port`.
impl fmt::Display for Aggregated<ConnectionKey> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = &self.key;
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.joined_messages(),
            k.protocol,
            k.src_addr,
            k.dst_addr,
            k.src_port,
            k.dst_port
        )
    }
}

/// Bidirectional schema: `messages protocol`.
impl fmt::Display for Aggregated<BidirectionalKey> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.joined_messages(), self.key.protocol)
    }
}
