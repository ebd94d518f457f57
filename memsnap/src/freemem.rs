use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::stream::{BlockInfo, PAGE_SIZE};


/// Configuration for the external free-page scanner. The guest kernel
/// addresses depend on the guest image and must be supplied by the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FreeMemScan {
    pub scanner_bin: PathBuf,
    pub pglist_addr: String,
    pub pfn0_addr: String,
    pub mem_size_mb: u64,
}

/// Asks the external scanner for the guest's free page-frame numbers and
/// shifts them to file page indices using the RAM block's file offset.
///
/// The scanner is strictly advisory: a configuration mismatch, a spawn
/// failure or any stderr output degrade to `None`, meaning "skip no pages".
pub fn scan_free_pfns(scan: &FreeMemScan, snapshot_path: &Path, ram_block: &BlockInfo) -> Option<HashSet<u64>> {
    let actual_mb = ram_block.length / (1024 * 1024);
    if actual_mb != scan.mem_size_mb {
        warn!(
            configured_mb = scan.mem_size_mb,
            actual_mb,
            "guest memory size differs from the scanner configuration; ignoring free memory information"
        );
        return None;
    }

    let output = match Command::new(&scan.scanner_bin)
        .arg(snapshot_path)
        .arg(&scan.pglist_addr)
        .arg(&scan.pfn0_addr)
        .arg(scan.mem_size_mb.to_string())
        .output()
    {
        Ok(output) => output,
        Err(error) => {
            warn!(%error, "free-page scanner could not be run");
            return None;
        },
    };
    if !output.stderr.is_empty() {
        warn!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "free-page scanner reported errors; ignoring free memory information"
        );
        return None;
    }

    let shift = ram_block.offset / PAGE_SIZE;
    let mut pfns = HashSet::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<u64>() {
            Ok(pfn) => {
                pfns.insert(pfn + shift);
            },
            Err(_) => {
                warn!(line, "unparsable free-page scanner output line");
            },
        }
    }
    if pfns.is_empty() {
        return None;
    }
    debug!(free_pages = pfns.len(), "free page list obtained");
    Some(pfns)
}
