//! Append configured host entries to the hosts file at startup.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

pub const HOSTS_FILE: &str = "/etc/hosts";

const BEGIN_MARKER: &str = "#### entries added by container-demo-runner ####";
const END_MARKER: &str = "#### end entries added by container-demo-runner ####";

/// The block written for `entries`, including markers.
pub fn entries_block(entries: &str) -> String {
    format!("\n{}\n{}\n{}\n", BEGIN_MARKER, entries, END_MARKER)
}

pub fn append_host_entries(path: &Path, entries: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(entries_block(entries).as_bytes())
        .with_context(|| format!("writing host entries to {}", path.display()))?;
    log::info!("added host entries to {}", path.display());
    Ok(())
}
