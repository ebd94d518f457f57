use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use memsnap::base::BaseMemory;
use memsnap::delta;
use memsnap::differ::{self, OverlayOptions};
use memsnap::freemem::FreeMemScan;
use memsnap::hashlist;
use memsnap::recover;


#[derive(Parser)]
#[command(about = "KVM memory snapshot hashing, differencing and recovery")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the page hash index of a base snapshot and write it next to the
    /// snapshot as a .meta sidecar.
    Hashing {
        /// Base memory snapshot path.
        #[arg(short, long)]
        base: PathBuf,
    },
    /// Compute the overlay describing how a modified snapshot differs from a
    /// base and write it next to the modified snapshot as a .delta file.
    Delta {
        /// Modified (migrated) memory snapshot path.
        #[arg(short, long)]
        migrated: PathBuf,
        /// Base memory snapshot path; its .meta sidecar must exist.
        #[arg(short, long)]
        base: PathBuf,
        /// Base disk image whose .meta sidecar provides extra reference
        /// pages.
        #[arg(long)]
        base_disk: Option<PathBuf>,
        /// Free-page scanner executable; enables freed-page suppression.
        #[arg(long, requires = "pglist_addr", requires = "pfn0_addr", requires = "mem_size_mb")]
        free_scan_bin: Option<PathBuf>,
        /// Guest kernel page-list address, hex.
        #[arg(long, requires = "free_scan_bin")]
        pglist_addr: Option<String>,
        /// Guest kernel first-PFN address, hex.
        #[arg(long, requires = "free_scan_bin")]
        pfn0_addr: Option<String>,
        /// Guest memory size the scanner was built for, in MiB.
        #[arg(long, requires = "free_scan_bin")]
        mem_size_mb: Option<u64>,
    },
    /// Rebuild a modified snapshot from a base and an overlay.
    Recover {
        /// Base memory snapshot path.
        #[arg(short, long)]
        base: PathBuf,
        /// Overlay (.delta) file path.
        #[arg(short, long)]
        delta: PathBuf,
        /// Base disk image, required when the overlay references it.
        #[arg(long)]
        base_disk: Option<PathBuf>,
        /// Original modified snapshot to verify the recovery against.
        #[arg(long)]
        verify: Option<PathBuf>,
    },
}


fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn run_hashing(base: &Path) {
    let hash_list = hashlist::hash_snapshot(base)
        .expect("failed to hash base snapshot");
    let meta_path = with_suffix(base, ".meta");
    hashlist::export_hashlist(&hash_list, &meta_path)
        .expect("failed to write meta file");

    // check integrity of the sidecar we just wrote
    let reloaded = hashlist::import_hashlist(&meta_path)
        .expect("failed to re-import meta file");
    if reloaded != hash_list {
        eprintln!("error: re-imported meta information differs from the original");
        std::process::exit(1);
    }
    println!("meta file written to {} ({} pages)", meta_path.display(), hash_list.len());
}

fn run_delta(
    migrated: &Path,
    base: &Path,
    base_disk: Option<&Path>,
    free_scan_bin: Option<PathBuf>,
    pglist_addr: Option<String>,
    pfn0_addr: Option<String>,
    mem_size_mb: Option<u64>,
) {
    let meta_path = with_suffix(base, ".meta");
    let mut base_mem = BaseMemory::import_from_meta(&meta_path, base)
        .expect("failed to import base memory meta");

    let disk_hashes = base_disk.map(|disk| {
        hashlist::import_hashlist(&with_suffix(disk, ".meta"))
            .expect("failed to import base disk meta")
    });
    let free_scan = match (free_scan_bin, pglist_addr, pfn0_addr, mem_size_mb) {
        (Some(scanner_bin), Some(pglist_addr), Some(pfn0_addr), Some(mem_size_mb)) => {
            Some(FreeMemScan {
                scanner_bin,
                pglist_addr,
                pfn0_addr,
                mem_size_mb,
            })
        },
        _ => None,
    };

    let options = OverlayOptions {
        base_disk_hashes: disk_hashes.as_deref(),
        free_scan: free_scan.as_ref(),
    };
    let outcome = differ::create_memory_overlay(migrated, &mut base_mem, &options)
        .expect("failed to create memory overlay");
    println!("{}", delta::statistics(&outcome.delta_list));
    println!("freed pages dropped: {}", outcome.freed_pages);

    let delta_path = with_suffix(migrated, ".delta");
    delta::write_overlay(&outcome.delta_list, &delta_path)
        .expect("failed to write overlay file");
    println!("overlay written to {}", delta_path.display());
}

fn run_recover(base: &Path, delta: &Path, base_disk: Option<&Path>, verify: Option<&Path>) {
    let out_path = with_suffix(base, ".recover");
    let overlay_map = recover::recover_memory(base, base_disk, delta, &out_path, verify)
        .expect("failed to recover memory");
    println!("overlay map: {}", overlay_map);
    println!("recovered snapshot written to {}", out_path.display());
}

fn main() {
    // set up logging/tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .pretty()
        .init();

    let opts = Opts::parse();
    match opts.command {
        Command::Hashing { base } => run_hashing(&base),
        Command::Delta { migrated, base, base_disk, free_scan_bin, pglist_addr, pfn0_addr, mem_size_mb } => {
            run_delta(
                &migrated,
                &base,
                base_disk.as_deref(),
                free_scan_bin,
                pglist_addr,
                pfn0_addr,
                mem_size_mb,
            );
        },
        Command::Recover { base, delta, base_disk, verify } => {
            run_recover(&base, &delta, base_disk.as_deref(), verify.as_deref());
        },
    }
}
