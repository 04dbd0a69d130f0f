//! Passive enumeration trigger
//!
//! Reading `/proc/net/tcp{,6}` makes the kernel walk every TCP socket
//! through `tcp{4,6}_seq_show`, which the probes use to backfill flows
//! that were established before they were attached.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

/// Socket tables walked to trigger enumeration
pub const PROC_NET_TCP: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];

/// Count socket rows in a `/proc/net/tcp`-style table, skipping the header
pub fn count_rows(reader: impl BufRead) -> Result<usize> {
    let mut rows = 0;
    for line in reader.lines().skip(1) {
        let line = line.context("Failed to read socket table row")?;
        if !line.trim().is_empty() {
            rows += 1;
        }
    }
    Ok(rows)
}

/// Read one socket table to the end
pub fn walk_table(path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    count_rows(BufReader::new(file))
}

/// Walk every table in `PROC_NET_TCP`
///
/// A missing table (no IPv6 support) is skipped with a warning.
///
/// # Returns
///
/// Total number of socket rows the kernel produced
pub fn trigger_enumeration() -> usize {
    info!("Triggering passive enumeration of existing TCP sockets...");

    let mut total = 0;
    for path in PROC_NET_TCP {
        match walk_table(Path::new(path)) {
            Ok(rows) => {
                debug!("  {} rows in {}", rows, path);
                total += rows;
            }
            Err(e) => warn!("  ⚠ Skipping {}: {:#}", path, e),
        }
    }

    info!("Enumerated {} existing sockets", total);
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 20857 1 0000000000000000 100 0 0 10 0
   1: 0F02000A:D8A2 22D8D0AC:01BB 01 00000000:00000000 02:00000BB8 00000000  1000        0 41235 2 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_count_rows_skips_header() {
        assert_eq!(count_rows(Cursor::new(TCP_TABLE)).unwrap(), 2);
    }

    #[test]
    fn test_count_rows_header_only() {
        let header = TCP_TABLE.lines().next().unwrap();
        assert_eq!(count_rows(Cursor::new(header)).unwrap(), 0);
        assert_eq!(count_rows(Cursor::new("")).unwrap(), 0);
    }

    #[test]
    fn test_walk_missing_table() {
        assert!(walk_table(Path::new("/nonexistent/proc/net/tcp")).is_err());
    }
}
