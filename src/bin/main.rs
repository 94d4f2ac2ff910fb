use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use regex::Regex;
use tracing::{info, warn};

use protocol_dataset_gen::dataset::write_lines;
use protocol_dataset_gen::{
    aggregate_bidirectional, aggregate_connections, collect_records, discover_captures,
    dissect_all, write_dataset, BidirectionalKey, BuildStats, ConnectionKey, Dissector,
    FlatRecordIterator, FramingRule, FramingTable, GroupKey, OutputRecord, Protocol, RecordBuilder,
    RowIterator,
};

#[derive(Parser)]
#[command(
    name = "protocol-dataset-gen",
    about = "Turn dissected packet captures into protocol-classification datasets"
)]
struct Cli {
    /// Dissector output files to read (- for stdin, default: stdin)
    files: Vec<String>,

    /// Walk a capture dataset (DIR/<run>/<pod>/<capture>), dissect every
    /// capture and write the three datasets into DIR
    #[arg(long, value_name = "DIR", conflicts_with_all = ["files", "flat_input", "conn", "bidir"])]
    dataset: Option<PathBuf>,

    /// Capture file name pattern used when walking a dataset
    #[arg(long, value_name = "REGEX", default_value = r"\.pcapng$")]
    capture_pattern: String,

    /// Dissector program
    #[arg(long, value_name = "PATH", default_value = "tshark")]
    tshark: PathBuf,

    /// Concurrent dissector processes (default: available CPUs)
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Register or override a framing rule, repeatable
    #[arg(long = "framing", value_name = "PROTO:FIELD:OVERHEAD")]
    framing: Vec<FramingRule>,

    /// Inputs are an existing flat dataset; only aggregate
    #[arg(long)]
    flat_input: bool,

    /// Output one row per connection
    #[arg(long, group = "output_mode")]
    conn: bool,

    /// Output one row per bidirectional conversation
    #[arg(long, group = "output_mode")]
    bidir: bool,

    /// Show statistics summary
    #[arg(long, group = "output_mode")]
    stats: bool,

    /// Print the dissector command line and exit
    #[arg(long, group = "output_mode")]
    print_command: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with_writer(io::stderr)
        .init();
}

fn compile_regex(pattern: &str, label: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            eprintln!("invalid {label} regex '{pattern}': {e}");
            process::exit(2);
        }
    }
}

fn framing_table(extra: &[FramingRule]) -> FramingTable {
    let mut table = FramingTable::default();
    for rule in extra {
        table.register(rule.clone());
    }
    table
}

fn open_input(files: &[String]) -> Box<dyn Read> {
    if files.is_empty() || (files.len() == 1 && files[0] == "-") {
        return Box::new(io::stdin().lock());
    }

    let mut readers: Vec<Box<dyn Read>> = Vec::new();
    for path in files {
        if path == "-" {
            readers.push(Box::new(io::stdin().lock()));
        } else {
            match File::open(path) {
                Ok(f) => readers.push(Box::new(f)),
                Err(e) => {
                    eprintln!("{path}: {e}");
                    process::exit(1);
                }
            }
        }
    }

    let mut chain: Box<dyn Read> = readers.remove(0);
    for r in readers {
        chain = Box::new(chain.chain(r));
    }
    chain
}

fn write_stdout<I>(items: I)
where
    I: IntoIterator,
    I::Item: std::fmt::Display,
{
    let mut out = BufWriter::new(io::stdout().lock());
    if let Err(e) = write_lines(&mut out, items).and_then(|()| out.flush()) {
        if e.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("write error: {e}");
            process::exit(1);
        }
    }
}

fn read_flat(reader: Box<dyn Read>) -> Vec<OutputRecord> {
    FlatRecordIterator::new(reader)
        .filter_map(|result| match result {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

fn print_stats(stats: Option<&BuildStats>, records: &[OutputRecord]) {
    if let Some(stats) = stats {
        println!("rows: {}", stats.rows);
        if stats.malformed > 0 {
            println!("malformed: {}", stats.malformed);
        }
        println!("unknown protocol: {}", stats.unknown);
        println!("messages: {}", stats.messages);
        println!("duplicates: {}", stats.duplicates);
    }
    println!("records: {}", records.len());

    let connections: HashSet<ConnectionKey> = records
        .iter()
        .map(ConnectionKey::from_record)
        .collect();
    let conversations: HashSet<BidirectionalKey> = records
        .iter()
        .map(BidirectionalKey::from_record)
        .collect();
    println!("connections: {}", connections.len());
    println!("conversations: {}", conversations.len());

    let mut per_protocol: BTreeMap<Protocol, usize> = BTreeMap::new();
    for r in records {
        *per_protocol.entry(r.protocol).or_default() += 1;
    }
    if !per_protocol.is_empty() {
        println!("\nprotocols:");
        for (protocol, count) in &per_protocol {
            println!("  {protocol}: {count}");
        }
    }
}

fn run_dataset(cli: &Cli, root: &Path, framing: FramingTable) {
    let pattern = compile_regex(&cli.capture_pattern, "capture pattern");
    let captures = match discover_captures(root, &pattern) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {e}", root.display());
            process::exit(1);
        }
    };
    info!(captures = captures.len(), "processing dataset");

    let jobs = cli.jobs.unwrap_or_else(rayon::current_num_threads);
    let dissector = Dissector::new(&cli.tshark, framing.clone());
    let dissected = dissect_all(&dissector, &captures, jobs);

    let mut builder = RecordBuilder::new(framing);
    let (records, failed) = collect_records(&mut builder, dissected);
    if failed > 0 {
        warn!(failed, total = captures.len(), "some captures could not be dissected");
    }

    if let Err(e) = write_dataset(root, &records) {
        eprintln!("{}: {e}", root.display());
        process::exit(1);
    }

    if cli.stats {
        println!("captures: {}", captures.len());
        if failed > 0 {
            println!("failed captures: {failed}");
        }
        print_stats(Some(builder.stats()), &records);
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let framing = framing_table(&cli.framing);

    if cli.print_command {
        let dissector = Dissector::new(&cli.tshark, framing);
        println!("{}", dissector.display_command(Path::new("<capture>")));
        return;
    }

    if let Some(root) = &cli.dataset {
        run_dataset(&cli, root, framing);
        return;
    }

    let reader = open_input(&cli.files);

    if cli.flat_input {
        let records = read_flat(reader);
        if cli.conn {
            write_stdout(aggregate_connections(&records));
        } else if cli.bidir {
            write_stdout(aggregate_bidirectional(&records));
        } else if cli.stats {
            print_stats(None, &records);
        } else {
            write_stdout(&records);
        }
        return;
    }

    let mut builder = RecordBuilder::new(framing);
    if !(cli.conn || cli.bidir || cli.stats) {
        write_stdout(builder.records(RowIterator::new(reader)));
        return;
    }

    let records: Vec<OutputRecord> = builder.records(RowIterator::new(reader)).collect();
    if cli.conn {
        write_stdout(aggregate_connections(&records));
    } else if cli.bidir {
        write_stdout(aggregate_bidirectional(&records));
    } else {
        print_stats(Some(builder.stats()), &records);
    }
}
