use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tempfile::TempDir;

use protocol_dataset_gen::dataset::{BIDIR_DATASET, CONN_DATASET, PACKET_DATASET};
use protocol_dataset_gen::{
    collect_records, discover_captures, write_dataset, DissectError, DissectedRow, Dissector,
    FlatRecordIterator, FramingTable, RecordBuilder,
};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"").unwrap();
}

fn redis_row(payload: &str, src: &str, dst: &str, sport: &str, dport: &str) -> DissectedRow {
    DissectedRow {
        tcp_payload: payload.into(),
        protocol_stack: "eth:ethertype:ip:tcp:redis".into(),
        src_addr: src.into(),
        dst_addr: dst.into(),
        tcp_src_port: sport.into(),
        tcp_dst_port: dport.into(),
        ..Default::default()
    }
}

#[test]
fn discover_follows_run_pod_layout() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    touch(&root.join("run2/pod1/b.pcapng"));
    touch(&root.join("run1/pod2/c.pcapng"));
    touch(&root.join("run1/pod1/a.pcapng"));
    touch(&root.join("run1/pod1/a.txt"));
    touch(&root.join("run1/stray.pcapng"));
    touch(&root.join("top.pcapng"));
    touch(&root.join("run1/pod1/deeper/d.pcapng"));

    let pattern = Regex::new(r"\.pcapng$").unwrap();
    let found = discover_captures(root, &pattern).unwrap();
    let rel: Vec<_> = found
        .iter()
        .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
        .collect();
    assert_eq!(
        rel,
        vec![
            PathBuf::from("run1/pod1/a.pcapng"),
            PathBuf::from("run1/pod2/c.pcapng"),
            PathBuf::from("run2/pod1/b.pcapng"),
        ]
    );
}

#[test]
fn collect_skips_failed_captures_and_dedups_across_them() {
    let dissected = vec![
        Ok(vec![Ok(redis_row("2a310d0a", "a", "b", "1000", "6379"))]),
        Err(DissectError::Status {
            capture: PathBuf::from("broken.pcapng"),
            code: Some(2),
            stderr: "cut short in the middle of a packet".into(),
        }),
        Ok(vec![
            Ok(redis_row("2a310d0a", "c", "d", "1001", "6379")),
            Ok(redis_row("2b4f4b0d0a", "b", "a", "6379", "1000")),
        ]),
    ];
    let mut builder = RecordBuilder::new(FramingTable::default());
    let (records, failed) = collect_records(&mut builder, dissected);
    assert_eq!(failed, 1);
    assert_eq!(records.len(), 2);
    assert_eq!(builder.stats().duplicates, 1);
}

#[test]
fn write_dataset_produces_three_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let mut builder = RecordBuilder::new(FramingTable::default());
    let rows = vec![
        redis_row("2a310d0a", "10.0.0.1", "10.0.0.2", "1000", "6379"),
        redis_row("2b4f4b0d0a", "10.0.0.2", "10.0.0.1", "6379", "1000"),
        redis_row("2a320d0a", "10.0.0.1", "10.0.0.2", "1000", "6379"),
    ];
    let records: Vec<_> = builder.records(rows.into_iter().map(Ok)).collect();
    write_dataset(root, &records).unwrap();

    let packets = fs::read_to_string(root.join(PACKET_DATASET)).unwrap();
    assert_eq!(packets.lines().count(), 3);
    let reread: Vec<_> = FlatRecordIterator::new(packets.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(reread, records);

    let conns = fs::read_to_string(root.join(CONN_DATASET)).unwrap();
    assert_eq!(
        conns,
        "2a310d0a,2a320d0a\tredis\t10.0.0.1\t10.0.0.2\t1000\t6379\n\
         2b4f4b0d0a\tredis\t10.0.0.2\t10.0.0.1\t6379\t1000\n"
    );

    let bidir = fs::read_to_string(root.join(BIDIR_DATASET)).unwrap();
    assert_eq!(bidir, "2a310d0a,2b4f4b0d0a,2a320d0a\tredis\n");

    // A rerun replaces rather than appends.
    write_dataset(root, &records).unwrap();
    let packets = fs::read_to_string(root.join(PACKET_DATASET)).unwrap();
    assert_eq!(packets.lines().count(), 3);
}

/// A dissector whose first output line has no protocol-stack field.
#[cfg(unix)]
fn garbled_dissector(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-tshark");
    fs::write(
        &script,
        "#!/bin/sh\nprintf 'aa\\tbb\\n2a310d0a\\t\\teth:ip:tcp:redis\\ta\\tb\\t1\\t\\t6379\\t\\t\\n'\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[cfg(unix)]
#[test]
fn malformed_dissector_line_does_not_fail_capture() {
    let dir = TempDir::new().unwrap();
    let dissector = Dissector::new(garbled_dissector(dir.path()), FramingTable::default());

    let rows = dissector.dissect(Path::new("x.pcapng")).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].is_err());
    assert!(rows[1].is_ok());

    let mut builder = RecordBuilder::new(FramingTable::default());
    let (records, failed) = collect_records(&mut builder, vec![Ok(rows)]);
    assert_eq!(failed, 0);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].to_string(), "2a310d0a\tredis\ta\tb\t1\t6379");
    assert_eq!(builder.stats().malformed, 1);
    assert_eq!(builder.stats().rows, 2);
}
