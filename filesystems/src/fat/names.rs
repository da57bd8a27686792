// Name coding for the FAT family: 8.3 short names with numeric tails,
// VFAT long-name slots, and exFAT name hashing plus the upcase table.

use fathom_core::{Error, Result};

use super::boot_sector::exfat_table_checksum;

/// Characters forbidden in long names (plus all control characters).
const INVALID_LFN_CHARS: &str = "\"*/:<>?\\|";
/// Additional characters forbidden in 8.3 names.
const INVALID_SHORT_CHARS: &str = "+,;=[]. ";

pub const LFN_CHARS_PER_SLOT: usize = 13;
pub const EXFAT_CHARS_PER_SLOT: usize = 15;
pub const MAX_NAME_LEN: usize = 255;

pub const ATTR_LFN: u8 = 0x0F;
pub const LFN_LAST_FLAG: u8 = 0x40;

/// Validates a long file name for either FAT LFN or exFAT use.
pub fn validate_long_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidName(name.into()));
    }
    if name.encode_utf16().count() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!("{}: name too long", name)));
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return Err(Error::InvalidName(format!(
            "{}: trailing space or dot",
            name
        )));
    }
    for c in name.chars() {
        if c < ' ' || INVALID_LFN_CHARS.contains(c) {
            return Err(Error::InvalidName(format!(
                "{}: reserved character {:?}",
                name, c
            )));
        }
    }
    Ok(())
}

/// True when `name` survives as a plain 8.3 entry without LFN slots.
pub fn fits_short_name(name: &str) -> bool {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    let ok = |s: &str| {
        s.chars().all(|c| {
            c.is_ascii_uppercase()
                || c.is_ascii_digit()
                || "!#$%&'()-@^_`{}~".contains(c)
        })
    };
    ok(base) && ok(ext)
}

fn sanitize_83_part(part: &str) -> String {
    part.to_uppercase()
        .chars()
        .filter(|&c| {
            c.is_ascii()
                && c > ' '
                && !INVALID_LFN_CHARS.contains(c)
                && !INVALID_SHORT_CHARS.contains(c)
        })
        .collect()
}

/// Packs base and extension into the 11-byte space-padded on-disk form.
pub fn pack_83(base: &str, ext: &str) -> [u8; 11] {
    let mut raw = [0x20u8; 11];
    for (i, b) in base.bytes().take(8).enumerate() {
        raw[i] = b;
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        raw[8 + i] = b;
    }
    // 0xE5 means "deleted"; a real leading 0xE5 is stored as 0x05.
    if raw[0] == 0xE5 {
        raw[0] = 0x05;
    }
    raw
}

/// Decodes the 11-byte form back into "BASE.EXT".
pub fn unpack_83(raw: &[u8; 11]) -> String {
    let mut name = String::new();
    for i in 0..8 {
        let mut b = raw[i];
        if b == 0x20 {
            break;
        }
        if i == 0 && b == 0x05 {
            b = 0xE5;
        }
        name.push(b as char);
    }
    let mut ext = String::new();
    for &b in &raw[8..11] {
        if b == 0x20 {
            break;
        }
        ext.push(b as char);
    }
    if !ext.is_empty() {
        name.push('.');
        name.push_str(&ext);
    }
    name
}

/// Derives the 8.3 form for a long name: uppercase, strip invalid
/// characters, truncate, and append the smallest `~n` tail that avoids a
/// collision in the target directory.
pub fn gen_short_name<F>(long_name: &str, mut exists: F) -> Result<[u8; 11]>
where
    F: FnMut(&[u8; 11]) -> bool,
{
    let (base_part, ext_part) = match long_name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (long_name, ""),
    };
    let mut base = sanitize_83_part(base_part);
    let ext: String = sanitize_83_part(ext_part).chars().take(3).collect();
    if base.is_empty() {
        base.push('_');
    }

    // A name already in valid 8.3 form is stored untouched.
    if fits_short_name(&long_name.to_uppercase())
        && long_name.to_uppercase() == long_name
    {
        let raw = pack_83(&base, &ext);
        if !exists(&raw) {
            return Ok(raw);
        }
    }

    for n in 1..=999_999u32 {
        let tail = format!("~{}", n);
        let keep = 8usize.saturating_sub(tail.len());
        let candidate: String = base.chars().take(keep).collect::<String>() + &tail;
        let raw = pack_83(&candidate, &ext);
        if !exists(&raw) {
            return Ok(raw);
        }
    }
    Err(Error::InvalidName(format!(
        "{}: no free numeric tail",
        long_name
    )))
}

/// Single-byte checksum of the 8.3 form, repeated in every LFN slot.
pub fn lfn_checksum(short_raw: &[u8; 11]) -> u8 {
    short_raw
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1 | sum << 7).wrapping_add(b))
}

/// Builds the LFN slot group for a name, in on-disk order (last slot
/// first, each carrying the short-entry checksum).
pub fn build_lfn_slots(long_name: &str, short_raw: &[u8; 11]) -> Vec<[u8; 32]> {
    let checksum = lfn_checksum(short_raw);
    let utf16: Vec<u16> = long_name.encode_utf16().collect();
    let slot_count = utf16.len().div_ceil(LFN_CHARS_PER_SLOT);
    let mut slots = Vec::with_capacity(slot_count);
    for i in (0..slot_count).rev() {
        let mut slot = [0xFFu8; 32];
        slot[0] = (i + 1) as u8 | if i == slot_count - 1 { LFN_LAST_FLAG } else { 0 };
        slot[11] = ATTR_LFN;
        slot[12] = 0;
        slot[13] = checksum;
        slot[26] = 0;
        slot[27] = 0;
        // 13 UTF-16 units per slot at offsets 1, 14 and 28; the name is
        // zero-terminated, then 0xFFFF-filled.
        const OFFSETS: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
        let mut src = i * LFN_CHARS_PER_SLOT;
        for (at, count) in OFFSETS {
            for j in 0..count {
                let value = match src.cmp(&utf16.len()) {
                    std::cmp::Ordering::Less => utf16[src],
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 0xFFFF,
                };
                slot[at + j * 2..at + j * 2 + 2].copy_from_slice(&value.to_le_bytes());
                src += 1;
            }
        }
        slots.push(slot);
    }
    slots
}

/// Extracts the 13 UTF-16 units of one LFN slot.
pub fn lfn_slot_chars(slot: &[u8; 32]) -> [u16; 13] {
    let mut out = [0u16; 13];
    let mut k = 0;
    for (at, count) in [(1usize, 5usize), (14, 6), (28, 2)] {
        for j in 0..count {
            out[k] = u16::from_le_bytes([slot[at + j * 2], slot[at + j * 2 + 1]]);
            k += 1;
        }
    }
    out
}

/// Joins accumulated slot chars (sequence order) into the final name.
pub fn assemble_lfn(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

// ============================================================================
// exFAT
// ============================================================================

/// 16-bit rotate-add checksum over an exFAT directory entry set; bytes 2
/// and 3 of the primary entry (the checksum field itself) are skipped.
pub fn exfat_set_checksum(set: &[u8]) -> u16 {
    let mut hash = 0u16;
    for (i, &b) in set.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        hash = (hash << 15 | hash >> 1).wrapping_add(b as u16);
    }
    hash
}

/// 16-bit rotate-add hash over the upcased UTF-16LE name.
pub fn exfat_name_hash(upcased_utf16: &[u16]) -> u16 {
    let mut hash = 0u16;
    for unit in upcased_utf16 {
        for b in unit.to_le_bytes() {
            hash = (hash << 15 | hash >> 1).wrapping_add(b as u16);
        }
    }
    hash
}

/// exFAT case-folding table, loaded from the volume at mount.
#[derive(Debug, Clone)]
pub struct UpcaseTable {
    map: Vec<u16>,
}

impl UpcaseTable {
    /// ASCII-only fallback: identity except a-z -> A-Z.
    pub fn default_ascii() -> Self {
        let mut map: Vec<u16> = (0..=0xFFFFu32).map(|c| c as u16).collect();
        for c in b'a'..=b'z' {
            map[c as usize] = (c - b'a' + b'A') as u16;
        }
        Self { map }
    }

    /// Expands the on-disk table. A 0xFFFF word introduces an identity
    /// run whose length follows; anything else is an explicit mapping.
    pub fn from_disk(raw: &[u8]) -> Result<Self> {
        let mut map: Vec<u16> = (0..=0xFFFFu32).map(|c| c as u16).collect();
        let mut logical = 0usize;
        let mut i = 0usize;
        while i + 1 < raw.len() && logical <= 0xFFFF {
            let word = u16::from_le_bytes([raw[i], raw[i + 1]]);
            if word == 0xFFFF && i + 3 < raw.len() {
                let run = u16::from_le_bytes([raw[i + 2], raw[i + 3]]) as usize;
                logical += run;
                i += 4;
            } else {
                if logical > 0xFFFF {
                    return Err(Error::BadFormat("upcase table overruns 0xFFFF".into()));
                }
                map[logical] = word;
                logical += 1;
                i += 2;
            }
        }
        Ok(Self { map })
    }

    /// Compressed ASCII table written by mkfs: identity up to 'a', the
    /// 26 uppercase mappings, then identity to the end.
    pub fn compressed_ascii() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xFFFFu16.to_le_bytes());
        out.extend_from_slice(&0x0061u16.to_le_bytes());
        for c in b'A'..=b'Z' {
            out.extend_from_slice(&(c as u16).to_le_bytes());
        }
        out.extend_from_slice(&0xFFFFu16.to_le_bytes());
        out.extend_from_slice(&((0x10000u32 - 0x7B) as u16).to_le_bytes());
        out
    }

    pub fn checksum_of(raw: &[u8]) -> u32 {
        exfat_table_checksum(raw)
    }

    pub fn upcase_unit(&self, unit: u16) -> u16 {
        self.map[unit as usize]
    }

    pub fn upcase_utf16(&self, units: &[u16]) -> Vec<u16> {
        units.iter().map(|&u| self.upcase_unit(u)).collect()
    }

    pub fn upcase_str(&self, s: &str) -> String {
        let units: Vec<u16> = s.encode_utf16().map(|u| self.upcase_unit(u)).collect();
        String::from_utf16_lossy(&units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_reserved() {
        assert!(validate_long_name("ok name.txt").is_ok());
        assert!(validate_long_name("bad:name").is_err());
        assert!(validate_long_name("trailing.").is_err());
        assert!(validate_long_name("").is_err());
    }

    #[test]
    fn test_fits_short_name() {
        assert!(fits_short_name("README.TXT"));
        assert!(fits_short_name("A"));
        assert!(!fits_short_name("readme.txt")); // lowercase needs LFN
        assert!(!fits_short_name("LONGFILENAME.TXT"));
        assert!(!fits_short_name("A.TOOLONG"));
    }

    #[test]
    fn test_gen_short_name_simple() {
        let raw = gen_short_name("README.TXT", |_| false).unwrap();
        assert_eq!(&raw, b"README  TXT");
        assert_eq!(unpack_83(&raw), "README.TXT");
    }

    #[test]
    fn test_gen_short_name_numeric_tail() {
        // The canonical derivation: 27 chars with spaces collapse to a
        // six-char stem plus ~1.
        let raw = gen_short_name("long file name with spaces.dat", |_| false).unwrap();
        assert_eq!(&raw, b"LONGFI~1DAT");
        assert_eq!(unpack_83(&raw), "LONGFI~1.DAT");
    }

    #[test]
    fn test_gen_short_name_collision_bumps_tail() {
        let taken = [*b"LONGFI~1DAT", *b"LONGFI~2DAT"];
        let raw = gen_short_name("long file name with spaces.dat", |c| {
            taken.contains(c)
        })
        .unwrap();
        assert_eq!(&raw, b"LONGFI~3DAT");
    }

    #[test]
    fn test_lfn_group_shape() {
        // 27 UTF-16 units need ceil(27/13) = 3 slots.
        let name = "long file name with spaces.dat";
        assert_eq!(name.encode_utf16().count(), 30);
        let short = gen_short_name(name, |_| false).unwrap();
        let slots = build_lfn_slots(name, &short);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0][0], LFN_LAST_FLAG | 3);
        assert_eq!(slots[1][0], 2);
        assert_eq!(slots[2][0], 1);
        let checksum = lfn_checksum(&short);
        assert!(slots.iter().all(|s| s[13] == checksum && s[11] == ATTR_LFN));
    }

    #[test]
    fn test_lfn_roundtrip() {
        let name = "Fünf Dateien im Ördner.log";
        let short = gen_short_name(name, |_| false).unwrap();
        let slots = build_lfn_slots(name, &short);
        // Reassemble in sequence order (slots are stored last-first).
        let mut units = Vec::new();
        for slot in slots.iter().rev() {
            units.extend_from_slice(&lfn_slot_chars(slot));
        }
        assert_eq!(assemble_lfn(&units), name);
    }

    #[test]
    fn test_exfat_name_hash_uses_upcase() {
        let table = UpcaseTable::default_ascii();
        let a: Vec<u16> = "hello.txt".encode_utf16().collect();
        let b: Vec<u16> = "HELLO.TXT".encode_utf16().collect();
        assert_eq!(
            exfat_name_hash(&table.upcase_utf16(&a)),
            exfat_name_hash(&table.upcase_utf16(&b))
        );
    }

    #[test]
    fn test_upcase_compressed_roundtrip() {
        let compressed = UpcaseTable::compressed_ascii();
        let table = UpcaseTable::from_disk(&compressed).unwrap();
        assert_eq!(table.upcase_unit(b'a' as u16), b'A' as u16);
        assert_eq!(table.upcase_unit(b'Z' as u16), b'Z' as u16);
        assert_eq!(table.upcase_unit(0x20AC), 0x20AC); // identity past ASCII
        assert_eq!(table.upcase_str("grüße"), "GRüßE");
    }

    #[test]
    fn test_set_checksum_skips_own_field() {
        let mut set = vec![0x85u8; 96];
        let base = exfat_set_checksum(&set);
        set[2] = 0xAB;
        set[3] = 0xCD;
        assert_eq!(base, exfat_set_checksum(&set));
        set[40] = 0x01;
        assert_ne!(base, exfat_set_checksum(&set));
    }
}
