pub mod mbr;

use log::{info, warn};
use serde::Serialize;
use std::fmt::Write;
use std::io::{Read, Seek};

use crate::error::ProbeError;
use crate::fs::DecodeMode;
use mbr::{Mbr, MbrPartitionEntry};

/// A DOS partition table with its logical partitions resolved.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionTable {
    #[serde(flatten)]
    pub mbr: Mbr,
    pub protective_gpt: bool,
}

/// Unified partition info for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    /// fdisk numbering: 1-4 for primary slots, 5 and up for logicals.
    pub number: usize,
    pub type_name: String,
    /// Raw partition type byte.
    pub partition_type_byte: u8,
    pub start_lba: u64,
    pub end_lba: u64,
    pub sectors: u64,
    pub size_bytes: u64,
    pub bootable: bool,
    /// True for logical partitions inside an extended container.
    pub is_logical: bool,
    /// True for the extended container entry itself.
    pub is_extended_container: bool,
}

impl PartitionInfo {
    fn from_entry(number: usize, e: &MbrPartitionEntry, is_logical: bool) -> Self {
        PartitionInfo {
            number,
            type_name: e.partition_type_name().to_string(),
            partition_type_byte: e.partition_type,
            start_lba: e.start_lba as u64,
            end_lba: e.end_lba(),
            sectors: e.total_sectors as u64,
            size_bytes: e.size_bytes(),
            bootable: e.bootable,
            is_logical,
            is_extended_container: e.is_extended(),
        }
    }
}

impl PartitionTable {
    /// Read the boot sector and walk the extended partition, if any.
    ///
    /// A bad boot sector signature always fails. EBR anomalies follow `mode`.
    /// A GPT protective MBR is reported but not interpreted further.
    pub fn detect(reader: &mut (impl Read + Seek), mode: DecodeMode) -> Result<Self, ProbeError> {
        let mut data = [0u8; mbr::SECTOR_SIZE as usize];
        reader.seek(std::io::SeekFrom::Start(0))?;
        reader.read_exact(&mut data)?;
        let mut mbr = Mbr::parse(&data)?;

        let protective_gpt = mbr.is_protective_gpt();
        if protective_gpt {
            warn!("protective MBR found: this disk uses GPT, only the MBR view is shown");
        } else if let Some(base) = mbr.extended_entry().map(|e| e.start_lba) {
            mbr.logical_partitions = mbr::walk_ebr_chain(reader, base, mode)?;
        }

        info!(
            "MBR {:#010x}: {} primary, {} logical partitions",
            mbr.disk_signature,
            mbr.active_entries().len(),
            mbr.logical_partitions.len()
        );
        Ok(PartitionTable {
            mbr,
            protective_gpt,
        })
    }

    /// Non-empty primary slots, numbered by slot.
    pub fn list_physical(&self) -> Vec<PartitionInfo> {
        self.mbr
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, e)| PartitionInfo::from_entry(i + 1, e, false))
            .collect()
    }

    /// Logical partitions in chain order, numbered from 5.
    pub fn list_logical(&self) -> Vec<PartitionInfo> {
        self.mbr
            .logical_partitions
            .iter()
            .enumerate()
            .map(|(j, e)| PartitionInfo::from_entry(5 + j, e, true))
            .collect()
    }

    /// Render the table the way `fdisk -l` lists a DOS label.
    pub fn format_as_fdisk_table(&self, device_name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Disklabel type: dos");
        let _ = writeln!(out, "Disk identifier: {:#010x}", self.mbr.disk_signature);
        if self.protective_gpt {
            let _ = writeln!(out, "(protective MBR; the real table is GPT)");
        }
        let _ = writeln!(out);

        let rows: Vec<PartitionInfo> = self
            .list_physical()
            .into_iter()
            .chain(self.list_logical())
            .collect();
        let width = rows
            .iter()
            .map(|p| device_name.len() + p.number.to_string().len())
            .max()
            .unwrap_or(0)
            .max("Device".len());

        let _ = writeln!(
            out,
            "{:<width$} Boot {:>10} {:>10} {:>10} {:>9} {:>2} Type",
            "Device", "Start", "End", "Sectors", "Size", "Id"
        );
        for p in &rows {
            let _ = writeln!(
                out,
                "{:<width$} {:<4} {:>10} {:>10} {:>10} {:>9} {:>2x} {}",
                format!("{device_name}{}", p.number),
                if p.bootable { "*" } else { "" },
                p.start_lba,
                p.end_lba,
                p.sectors,
                format_size(p.size_bytes),
                p.partition_type_byte,
                p.type_name
            );
        }
        out
    }
}

/// Format a byte count as a human-readable size string using binary (base-1024) units.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
