use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};

use crate::error::ProbeError;
use crate::fs::DecodeMode;

pub const SECTOR_SIZE: u64 = 512;
const MBR_SIGNATURE: u16 = 0xAA55;
const DISK_SIGNATURE_OFFSET: usize = 440;
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;

/// Maximum number of EBRs followed before the chain is rejected.
pub const MAX_LOGICAL_PARTITIONS: usize = 64;

/// CHS (Cylinder-Head-Sector) address extracted from MBR partition entry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChsAddress {
    pub head: u8,
    pub sector: u8,   // bits 0-5 only (6 bits)
    pub cylinder: u16, // 10 bits: 2 high bits from sector byte + 8 bits from cylinder byte
}

impl ChsAddress {
    fn parse(bytes: &[u8]) -> Self {
        ChsAddress {
            head: bytes[0],
            sector: bytes[1] & 0x3F,
            cylinder: ((bytes[1] as u16 & 0xC0) << 2) | bytes[2] as u16,
        }
    }
}

/// A single MBR or EBR partition table entry.
#[derive(Debug, Clone, Serialize)]
pub struct MbrPartitionEntry {
    pub bootable: bool,
    pub partition_type: u8,
    /// Absolute for primary and logical entries, as read for EBR links.
    pub start_lba: u32,
    pub total_sectors: u32,
    pub chs_start: ChsAddress,
    pub chs_end: ChsAddress,
}

impl MbrPartitionEntry {
    fn parse(data: &[u8]) -> Self {
        MbrPartitionEntry {
            bootable: data[0] == 0x80,
            chs_start: ChsAddress::parse(&data[1..4]),
            partition_type: data[4],
            chs_end: ChsAddress::parse(&data[5..8]),
            start_lba: LittleEndian::read_u32(&data[8..12]),
            total_sectors: LittleEndian::read_u32(&data[12..16]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partition_type == 0x00 && self.start_lba == 0 && self.total_sectors == 0
    }

    /// Check if this entry is an extended partition container (CHS, LBA, or Linux).
    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F | 0x85)
    }

    pub fn end_lba(&self) -> u64 {
        (self.start_lba as u64 + self.total_sectors as u64).saturating_sub(1)
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors as u64 * SECTOR_SIZE
    }

    pub fn partition_type_name(&self) -> &'static str {
        match self.partition_type {
            0x00 => "Empty",
            0x01 => "FAT12",
            0x04 => "FAT16 (<32MB)",
            0x05 => "Extended",
            0x06 => "FAT16 (>32MB)",
            0x07 => "NTFS/HPFS/exFAT",
            0x0B => "FAT32 (CHS)",
            0x0C => "FAT32 (LBA)",
            0x0E => "FAT16 (LBA)",
            0x0F => "Extended (LBA)",
            0x11 => "Hidden FAT12",
            0x14 => "Hidden FAT16 (<32MB)",
            0x16 => "Hidden FAT16 (>32MB)",
            0x1B => "Hidden FAT32 (CHS)",
            0x1C => "Hidden FAT32 (LBA)",
            0x1E => "Hidden FAT16 (LBA)",
            0x27 => "Windows RE",
            0x42 => "Dynamic Disk",
            0x82 => "Linux swap",
            0x83 => "Linux",
            0x85 => "Linux Extended",
            0x8E => "Linux LVM",
            0xA5 => "FreeBSD",
            0xA6 => "OpenBSD",
            0xAF => "HFS/HFS+",
            0xEE => "GPT Protective",
            0xEF => "EFI System",
            0xFD => "Linux RAID",
            _ => "Unknown",
        }
    }
}

/// Check the trailing 0x55AA and split a boot sector into its four entries.
fn parse_sector(
    data: &[u8; SECTOR_SIZE as usize],
    sector: u64,
) -> Result<[MbrPartitionEntry; 4], ProbeError> {
    let signature = LittleEndian::read_u16(&data[510..512]);
    if signature != MBR_SIGNATURE {
        return Err(ProbeError::BadSignature {
            sector,
            actual: signature,
        });
    }
    Ok(std::array::from_fn(|i| {
        let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        MbrPartitionEntry::parse(&data[offset..offset + PARTITION_ENTRY_SIZE])
    }))
}

fn read_sector(
    reader: &mut (impl Read + Seek),
    sector: u64,
) -> Result<[u8; SECTOR_SIZE as usize], ProbeError> {
    reader.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
    let mut data = [0u8; SECTOR_SIZE as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Parsed MBR (Master Boot Record).
#[derive(Debug, Clone, Serialize)]
pub struct Mbr {
    pub disk_signature: u32,
    pub entries: [MbrPartitionEntry; 4],
    /// Logical partitions found by following the EBR chain of the extended
    /// entry, with absolute start sectors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logical_partitions: Vec<MbrPartitionEntry>,
}

impl Mbr {
    /// Parse an MBR from exactly 512 bytes.
    pub fn parse(data: &[u8; SECTOR_SIZE as usize]) -> Result<Self, ProbeError> {
        let entries = parse_sector(data, 0)?;
        Ok(Mbr {
            disk_signature: LittleEndian::read_u32(&data[DISK_SIGNATURE_OFFSET..]),
            entries,
            logical_partitions: Vec::new(),
        })
    }

    /// Check if this MBR is a GPT protective MBR.
    pub fn is_protective_gpt(&self) -> bool {
        let non_empty = self.active_entries();
        non_empty.len() == 1 && non_empty[0].partition_type == 0xEE
    }

    /// Return only non-empty partition entries.
    pub fn active_entries(&self) -> Vec<&MbrPartitionEntry> {
        self.entries.iter().filter(|e| !e.is_empty()).collect()
    }

    /// The first extended entry; any further ones are ignored.
    pub fn extended_entry(&self) -> Option<&MbrPartitionEntry> {
        self.entries.iter().find(|e| e.is_extended())
    }
}

/// Follow the EBR chain of an extended partition starting at `extended_base`.
///
/// Each EBR holds at most one data entry, whose start is relative to the EBR
/// itself, and at most one extended link, whose start is relative to
/// `extended_base`. The first of each kind wins. The chain ends at an EBR
/// without a link.
///
/// A bad EBR signature fails the whole walk in strict mode; in best-effort
/// mode it ends the chain and keeps what was found so far. Following more
/// than [`MAX_LOGICAL_PARTITIONS`] EBRs is always an error, which also
/// catches link cycles.
pub fn walk_ebr_chain(
    reader: &mut (impl Read + Seek),
    extended_base: u32,
    mode: DecodeMode,
) -> Result<Vec<MbrPartitionEntry>, ProbeError> {
    let mut logical_partitions = Vec::new();
    let mut relative = 0u32;
    let mut hops = 0usize;

    loop {
        hops += 1;
        if hops > MAX_LOGICAL_PARTITIONS {
            return Err(ProbeError::ChainTooLong {
                limit: MAX_LOGICAL_PARTITIONS,
            });
        }

        let ebr_lba = extended_base.saturating_add(relative);
        let data = read_sector(reader, ebr_lba as u64)?;
        let entries = match parse_sector(&data, ebr_lba as u64) {
            Ok(entries) => entries,
            Err(e) => {
                mode.tolerate(Err(e))?;
                break;
            }
        };

        if let Some(entry) = entries.iter().find(|e| !e.is_empty() && !e.is_extended()) {
            let mut logical = entry.clone();
            logical.start_lba = ebr_lba.saturating_add(entry.start_lba);
            debug!(
                "EBR at sector {ebr_lba}: logical {} at sector {}",
                logical.partition_type_name(),
                logical.start_lba
            );
            logical_partitions.push(logical);
        }

        match entries.iter().find(|e| e.is_extended()) {
            Some(link) => relative = link.start_lba,
            None => break,
        }
    }

    Ok(logical_partitions)
}
