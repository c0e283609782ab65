//! Debug dump of a loaded model's memory layout
//!
//! Written to `<dump_dir>/<model>_layout.json` at load when `dump_dir` is
//! set. Nothing reads it back; failures are logged by the caller.

use crate::allocation::{CopyInfo, IoBinding, LogicalAllocation, MemAllocationTable};
use crate::zero_copy::{CopyOnlyReason, CopyOnlyRegistry, ZeroCopyOffset};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct CopyOnlyEntry {
    pub logical_addr: String,
    pub reason: CopyOnlyReason,
}

#[derive(Debug, Serialize)]
pub struct LayoutDump<'a> {
    pub model: &'a str,
    pub allocations: Vec<LogicalAllocation>,
    pub inputs: &'a [IoBinding],
    pub outputs: &'a [IoBinding],
    pub copy_infos: &'a [CopyInfo],
    pub copy_only: Vec<CopyOnlyEntry>,
    pub zero_copy_offsets: &'a [ZeroCopyOffset],
}

impl<'a> LayoutDump<'a> {
    pub fn new(
        model: &'a str,
        table: &MemAllocationTable,
        inputs: &'a [IoBinding],
        outputs: &'a [IoBinding],
        copy_infos: &'a [CopyInfo],
        registry: &CopyOnlyRegistry,
        zero_copy_offsets: &'a [ZeroCopyOffset],
    ) -> Self {
        let copy_only = registry
            .addresses()
            .filter_map(|addr| {
                registry.reason(addr).map(|reason| CopyOnlyEntry {
                    logical_addr: format!("{addr:#x}"),
                    reason,
                })
            })
            .collect();
        Self {
            model,
            allocations: table.iter().copied().collect(),
            inputs,
            outputs,
            copy_infos,
            copy_only,
            zero_copy_offsets,
        }
    }
}

/// Write `dump` as pretty JSON under `dir`, creating it if needed
pub fn write_layout_dump(dir: &Path, dump: &LayoutDump<'_>) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name: String = dump
        .model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{file_name}_layout.json"));

    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, dump)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(path)
}
