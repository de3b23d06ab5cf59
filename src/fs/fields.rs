//! Table-driven pretty printer for fixed on-disk layouts.
//!
//! Each structure is described by a static slice of [`Field`]s (name,
//! offset, encoding). Rendering walks the table against a raw buffer; fields
//! that fall past the end of the buffer are shown as truncated rather than
//! read out of bounds.

use byteorder::{BigEndian, ByteOrder};
use std::fmt::Write;

/// Encoding of one on-disk field. All integers are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    /// Shown in hex (magics, checksums, flag words).
    Hex16,
    Hex32,
    Hex64,
    Uuid,
    /// Fixed-width, NUL-padded text.
    Text(usize),
}

impl FieldKind {
    pub fn width(&self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 | FieldKind::Hex16 => 2,
            FieldKind::U32 | FieldKind::Hex32 => 4,
            FieldKind::U64 | FieldKind::Hex64 => 8,
            FieldKind::Uuid => 16,
            FieldKind::Text(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }

    /// Format this field's value from `data`, or `None` if it does not fit.
    pub fn format(&self, data: &[u8]) -> Option<String> {
        let end = self.offset + self.kind.width();
        let raw = data.get(self.offset..end)?;
        Some(match self.kind {
            FieldKind::U8 => raw[0].to_string(),
            FieldKind::U16 => BigEndian::read_u16(raw).to_string(),
            FieldKind::U32 => BigEndian::read_u32(raw).to_string(),
            FieldKind::U64 => BigEndian::read_u64(raw).to_string(),
            FieldKind::Hex16 => format!("{:#06x}", BigEndian::read_u16(raw)),
            FieldKind::Hex32 => format!("{:#010x}", BigEndian::read_u32(raw)),
            FieldKind::Hex64 => format!("{:#018x}", BigEndian::read_u64(raw)),
            FieldKind::Uuid => format_uuid(raw),
            FieldKind::Text(_) => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                format!("\"{}\"", String::from_utf8_lossy(&raw[..end]))
            }
        })
    }
}

/// Render `data` as `title` using a field table, one `name = value` per line.
pub fn render_fields(title: &str, fields: &[Field], data: &[u8]) -> String {
    let width = fields.iter().map(|f| f.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    let _ = writeln!(out, "{title}:");
    for field in fields {
        let value = field
            .format(data)
            .unwrap_or_else(|| "<truncated>".to_string());
        let _ = writeln!(out, "  {:<width$} = {value}", field.name);
    }
    out
}

/// Format 16 raw bytes as a canonical 8-4-4-4-12 UUID string.
pub fn format_uuid(raw: &[u8]) -> String {
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    if hex.len() != 32 {
        return hex;
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Classic 16-bytes-per-line hex dump with an ASCII column.
pub fn hexdump(data: &[u8], base_offset: u64) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", base_offset + (i * 16) as u64);
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[Field] = &[
        Field::new("magic", 0, FieldKind::Hex32),
        Field::new("count", 4, FieldKind::U16),
        Field::new("name", 6, FieldKind::Text(4)),
        Field::new("big", 10, FieldKind::U64),
    ];

    #[test]
    fn test_render_fields() {
        let mut data = vec![0u8; 18];
        data[0..4].copy_from_slice(&0x58465342u32.to_be_bytes());
        data[4..6].copy_from_slice(&7u16.to_be_bytes());
        data[6..8].copy_from_slice(b"ab");
        data[10..18].copy_from_slice(&(1u64 << 40).to_be_bytes());
        let text = render_fields("test", TABLE, &data);
        assert!(text.starts_with("test:\n"));
        assert!(text.contains("magic = 0x58465342"));
        assert!(text.contains("count = 7"));
        assert!(text.contains("name  = \"ab\""));
        assert!(text.contains("big   = 1099511627776"));
    }

    #[test]
    fn test_truncated_field() {
        let data = [0u8; 8];
        let text = render_fields("short", TABLE, &data);
        assert!(text.contains("big   = <truncated>"));
    }

    #[test]
    fn test_format_uuid() {
        let raw: Vec<u8> = (0u8..16).collect();
        assert_eq!(format_uuid(&raw), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn test_hexdump() {
        let dump = hexdump(b"XFSB\0\0\0\x01", 0x200);
        assert!(dump.starts_with("00000200  58 46 53 42 00 00 00 01"));
        assert!(dump.trim_end().ends_with("|XFSB....|"));
    }
}
