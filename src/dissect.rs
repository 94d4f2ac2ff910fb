use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::frame::FramingTable;
use crate::row::{DissectedRow, ParseError, RowIterator, FIXED_FIELDS};

#[derive(Debug)]
pub enum DissectError {
    Spawn { program: PathBuf, source: std::io::Error },
    Status { capture: PathBuf, code: Option<i32>, stderr: String },
}

/// Rows of one capture. Lines the dissector printed that could not be parsed
/// are kept as errors so the caller can count and skip them individually.
pub type DissectedRows = Vec<Result<DissectedRow, ParseError>>;

impl fmt::Display for DissectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DissectError::Spawn { program, source } => {
                write!(f, "failed to run {}: {source}", program.display())
            }
            DissectError::Status { capture, code, stderr } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                write!(f, "{}: dissector exited with {code}: {}", capture.display(), stderr.trim())
            }
        }
    }
}

impl std::error::Error for DissectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DissectError::Spawn { source, .. } => Some(source),
            DissectError::Status { .. } => None,
        }
    }
}

/// Runs the external packet dissector (tshark) and reads its field output.
#[derive(Debug, Clone)]
pub struct Dissector {
    program: PathBuf,
    framing: FramingTable,
    decode_as: Vec<String>,
}

impl Dissector {
    pub fn new(program: impl Into<PathBuf>, framing: FramingTable) -> Self {
        Dissector {
            program: program.into(),
            framing,
            // MongoDB is not recognised on its default port without a hint.
            decode_as: vec!["tcp.port==27017,mongo".to_string()],
        }
    }

    pub fn with_decode_as(mut self, decode_as: Vec<String>) -> Self {
        self.decode_as = decode_as;
        self
    }

    /// Arguments for a two-pass field export of `capture`.
    pub fn args(&self, capture: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-2".into(), "-r".into(), capture.into()];
        args.push("-T".into());
        args.push("fields".into());
        for field in FIXED_FIELDS {
            args.push("-e".into());
            args.push(field.into());
        }
        for d in &self.decode_as {
            args.push("-d".into());
            args.push(d.into());
        }
        for rule in self.framing.iter() {
            args.push("-e".into());
            args.push(rule.dissector_field().into());
        }
        args
    }

    /// The full command line, for display.
    pub fn display_command(&self, capture: &Path) -> String {
        let mut line = self.program.display().to_string();
        for arg in self.args(capture) {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Dissect one capture file. Blocks until the dissector exits.
    ///
    /// Only a failure to run the dissector or a non-zero exit fails the
    /// capture; malformed output lines come back as per-row errors.
    pub fn dissect(&self, capture: &Path) -> Result<DissectedRows, DissectError> {
        debug!(capture = %capture.display(), "running dissector");
        let output = Command::new(&self.program)
            .args(self.args(capture))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| DissectError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DissectError::Status {
                capture: capture.to_path_buf(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let rows: DissectedRows = RowIterator::new(&output.stdout[..]).collect();
        let malformed = rows.iter().filter(|r| r.is_err()).count();
        info!(capture = %capture.display(), rows = rows.len(), malformed, "dissected capture");
        Ok(rows)
    }
}

/// Dissect every capture with up to `jobs` concurrent dissector processes.
///
/// Results are returned in the order of `captures`. A failure affects only
/// its own capture.
pub fn dissect_all(
    dissector: &Dissector,
    captures: &[PathBuf],
    jobs: usize,
) -> Vec<Result<DissectedRows, DissectError>> {
    let run = || -> Vec<Result<DissectedRows, DissectError>> {
        captures
            .par_iter()
            .map(|capture| {
                let result = dissector.dissect(capture);
                if let Err(e) = &result {
                    error!(error = %e, "dissection failed");
                }
                result
            })
            .collect()
    };

    match rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
    {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!(error = %e, "could not build dissector pool, using the global pool");
            run()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_layout() {
        let d = Dissector::new("tshark", FramingTable::default());
        assert_eq!(
            d.display_command(Path::new("/data/run/pod/1.pcapng")),
            "tshark -2 -r /data/run/pod/1.pcapng -T fields \
             -e tcp.payload -e udp.payload -e frame.protocols -e ip.src -e ip.dst \
             -e tcp.srcport -e udp.srcport -e tcp.dstport -e udp.dstport \
             -d tcp.port==27017,mongo \
             -e mysql.packet_length -e pgsql.length -e amqp.length"
        );
    }

    #[test]
    fn decode_as_override() {
        let d = Dissector::new("tshark", FramingTable::empty()).with_decode_as(Vec::new());
        let args = d.args(Path::new("x.pcap"));
        assert!(!args.iter().any(|a| a == "-d"));
        assert_eq!(args.len(), 5 + 2 * FIXED_FIELDS.len());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let d = Dissector::new("/nonexistent/dissector-binary", FramingTable::default());
        let err = d.dissect(Path::new("x.pcapng")).unwrap_err();
        assert!(matches!(err, DissectError::Spawn { .. }));
    }

    #[test]
    fn dissect_all_keeps_order_and_isolates_failures() {
        let d = Dissector::new("/nonexistent/dissector-binary", FramingTable::default());
        let captures = vec![PathBuf::from("a.pcapng"), PathBuf::from("b.pcapng")];
        let results = dissect_all(&d, &captures, 4);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
        assert!(dissect_all(&d, &[], 4).is_empty());
    }
}
