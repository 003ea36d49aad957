//! The `.info` sidecar file.
//!
//! A small text file written next to the storage's paged file, recording
//! the access method tag in a human-readable form. This crate is the only
//! reader/writer of this file; it exists so an operator inspecting a
//! storage directory doesn't need to decode the binary heading page to
//! tell a B+Tree storage from anything else this format might grow later.

use crate::error::Result;
use crate::types::AccessMethodKind;
use std::fs;
use std::path::Path;

const KEY: &str = "StorageClrTypeName";

pub fn write(info_path: &Path, access_method: AccessMethodKind) -> Result<()> {
    let value = match access_method {
        AccessMethodKind::BPlusTree => "BPlusTree",
        AccessMethodKind::RadixTree => "RadixTree",
    };
    fs::write(info_path, format!("{KEY}={value}\n"))?;
    Ok(())
}

/// Best-effort read: a missing or unparsable sidecar is not fatal, since
/// the heading page is the authoritative source of truth.
pub fn read(info_path: &Path) -> Option<AccessMethodKind> {
    let content = fs::read_to_string(info_path).ok()?;
    let value = content.lines().find_map(|line| line.strip_prefix(&format!("{KEY}=")))?;
    match value.trim() {
        "BPlusTree" => Some(AccessMethodKind::BPlusTree),
        "RadixTree" => Some(AccessMethodKind::RadixTree),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db.info");
        write(&path, AccessMethodKind::BPlusTree).unwrap();
        assert_eq!(read(&path), Some(AccessMethodKind::BPlusTree));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.info");
        assert_eq!(read(&path), None);
    }
}
