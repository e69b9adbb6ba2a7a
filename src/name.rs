//! Filename handling: legality rules, long-to-short conversion, and the
//! OEM code page used by short names.
//!
//! Long names are UTF-16 and keep their case; short names are stored in the
//! OEM code page, upper-cased. Characters a long name may carry but a short
//! name may not become `_` in the generated alias; spaces and extra dots
//! are dropped outright. When the alias is not a faithful rendering of the
//! long name (or collides with an existing entry), a `~N` tail makes it
//! unique within its directory: `~1` through `~4` against the plain basis,
//! then a Windows-style 2-letter + 4-hex-digit rehash for `N >= 5`.

use alloc::collections::BTreeMap;
use alloc::string::String;
use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::{DIR_ENTRY_DELETED, SPACE};

/// Characters never legal in a long name.
const LONG_ILLEGAL: &[u8] = b"\\/:*?\"<>|";
/// Additionally illegal in a short name (legal in long names).
const SHORT_ONLY_ILLEGAL: &[u8] = b"+,;=[] ";

/// MS device names; a short name whose 8-byte base matches one of these is
/// rejected regardless of its extension.
const DEVICE_NAMES: [&[u8]; 4] = [b"CON", b"PRN", b"AUX", b"NUL"];

#[rustfmt::skip]
const CP850_HIGH: [u16; 128] = [
    0x00C7, 0x00FC, 0x00E9, 0x00E2, 0x00E4, 0x00E0, 0x00E5, 0x00E7,
    0x00EA, 0x00EB, 0x00E8, 0x00EF, 0x00EE, 0x00EC, 0x00C4, 0x00C5,
    0x00C9, 0x00E6, 0x00C6, 0x00F4, 0x00F6, 0x00F2, 0x00FB, 0x00F9,
    0x00FF, 0x00D6, 0x00DC, 0x00F8, 0x00A3, 0x00D8, 0x00D7, 0x0192,
    0x00E1, 0x00ED, 0x00F3, 0x00FA, 0x00F1, 0x00D1, 0x00AA, 0x00BA,
    0x00BF, 0x00AE, 0x00AC, 0x00BD, 0x00BC, 0x00A1, 0x00AB, 0x00BB,
    0x2591, 0x2592, 0x2593, 0x2502, 0x2524, 0x00C1, 0x00C2, 0x00C0,
    0x00A9, 0x2563, 0x2551, 0x2557, 0x255D, 0x00A2, 0x00A5, 0x2510,
    0x2514, 0x2534, 0x252C, 0x251C, 0x2500, 0x253C, 0x00E3, 0x00C3,
    0x255A, 0x2554, 0x2569, 0x2566, 0x2560, 0x2550, 0x256C, 0x00A4,
    0x00F0, 0x00D0, 0x00CA, 0x00CB, 0x00C8, 0x0131, 0x00CD, 0x00CE,
    0x00CF, 0x2518, 0x250C, 0x2588, 0x2584, 0x00A6, 0x00CC, 0x2580,
    0x00D3, 0x00DF, 0x00D4, 0x00D2, 0x00F5, 0x00D5, 0x00B5, 0x00FE,
    0x00DE, 0x00DA, 0x00DB, 0x00D9, 0x00FD, 0x00DD, 0x00AF, 0x00B4,
    0x00AD, 0x00B1, 0x2017, 0x00BE, 0x00B6, 0x00A7, 0x00F7, 0x00B8,
    0x00B0, 0x00A8, 0x00B7, 0x00B9, 0x00B3, 0x00B2, 0x25A0, 0x00A0,
];

#[rustfmt::skip]
const CP1252_HIGH: [u16; 128] = [
    0x20AC, 0x0081, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021,
    0x02C6, 0x2030, 0x0160, 0x2039, 0x0152, 0x008D, 0x017D, 0x008F,
    0x0090, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014,
    0x02DC, 0x2122, 0x0161, 0x203A, 0x0153, 0x009D, 0x017E, 0x0178,
    0x00A0, 0x00A1, 0x00A2, 0x00A3, 0x00A4, 0x00A5, 0x00A6, 0x00A7,
    0x00A8, 0x00A9, 0x00AA, 0x00AB, 0x00AC, 0x00AD, 0x00AE, 0x00AF,
    0x00B0, 0x00B1, 0x00B2, 0x00B3, 0x00B4, 0x00B5, 0x00B6, 0x00B7,
    0x00B8, 0x00B9, 0x00BA, 0x00BB, 0x00BC, 0x00BD, 0x00BE, 0x00BF,
    0x00C0, 0x00C1, 0x00C2, 0x00C3, 0x00C4, 0x00C5, 0x00C6, 0x00C7,
    0x00C8, 0x00C9, 0x00CA, 0x00CB, 0x00CC, 0x00CD, 0x00CE, 0x00CF,
    0x00D0, 0x00D1, 0x00D2, 0x00D3, 0x00D4, 0x00D5, 0x00D6, 0x00D7,
    0x00D8, 0x00D9, 0x00DA, 0x00DB, 0x00DC, 0x00DD, 0x00DE, 0x00DF,
    0x00E0, 0x00E1, 0x00E2, 0x00E3, 0x00E4, 0x00E5, 0x00E6, 0x00E7,
    0x00E8, 0x00E9, 0x00EA, 0x00EB, 0x00EC, 0x00ED, 0x00EE, 0x00EF,
    0x00F0, 0x00F1, 0x00F2, 0x00F3, 0x00F4, 0x00F5, 0x00F6, 0x00F7,
    0x00F8, 0x00F9, 0x00FA, 0x00FB, 0x00FC, 0x00FD, 0x00FE, 0x00FF,
];

fn build_reverse(table: &[u16; 128]) -> BTreeMap<u16, u8> {
    let mut map = BTreeMap::new();
    for (i, &cp) in table.iter().enumerate() {
        map.entry(cp).or_insert(0x80 + i as u8);
    }
    map
}

lazy_static! {
    static ref CP850_REVERSE: BTreeMap<u16, u8> = build_reverse(&CP850_HIGH);
    static ref CP1252_REVERSE: BTreeMap<u16, u8> = build_reverse(&CP1252_HIGH);
}

/// The OEM code page used for short names on a volume, selected at mount
/// time. CP850 is the kernel default; CP1252 the userland one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OemCodepage {
    Cp850,
    Cp1252,
}

impl OemCodepage {
    /// Resolve a mount option string; unknown names fall back to CP850.
    pub fn by_name(name: &str) -> OemCodepage {
        if name.eq_ignore_ascii_case("cp1252") || name.eq_ignore_ascii_case("1252") {
            OemCodepage::Cp1252
        } else {
            if !name.eq_ignore_ascii_case("cp850") && !name.eq_ignore_ascii_case("850") {
                log::warn!("unknown OEM code page {:?}, using cp850", name);
            }
            OemCodepage::Cp850
        }
    }

    fn table(self) -> &'static [u16; 128] {
        match self {
            OemCodepage::Cp850 => &CP850_HIGH,
            OemCodepage::Cp1252 => &CP1252_HIGH,
        }
    }

    fn reverse(self) -> &'static BTreeMap<u16, u8> {
        match self {
            OemCodepage::Cp850 => &CP850_REVERSE,
            OemCodepage::Cp1252 => &CP1252_REVERSE,
        }
    }

    pub fn to_unicode(self, byte: u8) -> char {
        if byte < 0x80 {
            byte as char
        } else {
            char::from_u32(self.table()[(byte - 0x80) as usize] as u32).unwrap_or('_')
        }
    }

    pub fn from_unicode(self, c: char) -> Option<u8> {
        let cp = c as u32;
        if cp < 0x80 {
            return Some(cp as u8);
        }
        if cp > 0xFFFF {
            return None;
        }
        self.reverse().get(&(cp as u16)).copied()
    }
}

/// Whether `name` is acceptable as a long filename. `.` and `..` fail here;
/// the directory engine special-cases them before name handling.
pub fn legal_long(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut only_dots_and_spaces = true;
    for c in name.chars() {
        if (c as u32) < 0x20 {
            return false;
        }
        if c.is_ascii() && LONG_ILLEGAL.contains(&(c as u8)) {
            return false;
        }
        if c != '.' && c != ' ' {
            only_dots_and_spaces = false;
        }
    }
    !only_dots_and_spaces
}

/// Whether a raw 11-byte short name is storable: printable OEM bytes and
/// not a reserved MS device name.
pub fn legal_short(raw: &[u8; 11]) -> bool {
    if raw[0] == SPACE || raw[0] == crate::DIR_ENTRY_FREE {
        return false;
    }
    for (i, &b) in raw.iter().enumerate() {
        if b < 0x20 && !(i == 0 && b == crate::DIR_ENTRY_KANJI) {
            return false;
        }
        if b == b'.' || b == b'/' {
            return false;
        }
        if LONG_ILLEGAL.contains(&b) || SHORT_ONLY_ILLEGAL.contains(&b) && b != SPACE {
            return false;
        }
    }
    !is_device_base(&raw[..8])
}

fn is_device_base(base: &[u8]) -> bool {
    let end = base.iter().position(|&b| b == SPACE).unwrap_or(base.len());
    let base = &base[..end];
    for dev in DEVICE_NAMES {
        if base.eq_ignore_ascii_case(dev) {
            return true;
        }
    }
    // COM0..COM9 and LPT0..LPT9.
    if base.len() == 4 && base[3].is_ascii_digit() {
        let three = &base[..3];
        if three.eq_ignore_ascii_case(b"COM") || three.eq_ignore_ascii_case(b"LPT") {
            return true;
        }
    }
    false
}

/// Whether a long name would collide with a reserved device name once
/// shortened (used by rename).
pub fn is_reserved_device_name(name: &str) -> bool {
    let base = match name.find('.') {
        Some(i) => &name[..i],
        None => name,
    };
    base.len() <= 8 && is_device_base(base.as_bytes())
}

/// Derive the 8+3 basis for `name`. Returns the space-padded 11 bytes and
/// whether anything was lost along the way (case folding, dropped or
/// substituted characters, truncation); a lossy basis always gets a `~N`
/// tail.
pub fn short_basis(name: &str, cp: OemCodepage) -> ([u8; 11], bool) {
    let mut lossy = false;

    // The extension comes from the last dot, unless the name has no dot or
    // only the leading dots of a dotfile.
    let trimmed = name.trim_end_matches(|c| c == ' ' || c == '.');
    if trimmed.len() != name.len() {
        lossy = true;
    }
    let (base_part, ext_part) = match trimmed.rfind('.') {
        Some(0) | None => (trimmed, ""),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
    };

    let mut out = [SPACE; 11];
    let mut fill = |src: &str, lo: usize, hi: usize, lossy: &mut bool| {
        let mut at = lo;
        for c in src.chars() {
            if c == ' ' || c == '.' {
                *lossy = true;
                continue;
            }
            if at == hi {
                *lossy = true;
                break;
            }
            let upper = c.to_ascii_uppercase();
            if upper != c {
                *lossy = true;
            }
            let upper = if upper.is_ascii() {
                upper
            } else {
                let folded = upper.to_uppercase().next().unwrap_or(upper);
                if folded != c {
                    *lossy = true;
                }
                folded
            };
            let byte = match cp.from_unicode(upper) {
                Some(b)
                    if b >= 0x20
                        && !LONG_ILLEGAL.contains(&b)
                        && !SHORT_ONLY_ILLEGAL.contains(&b) =>
                {
                    b
                }
                _ => {
                    *lossy = true;
                    b'_'
                }
            };
            out[at] = byte;
            at += 1;
        }
    };
    fill(base_part, 0, 8, &mut lossy);
    fill(ext_part, 8, 11, &mut lossy);

    if out[0] == SPACE {
        // Nothing usable survived; synthesize a placeholder basis.
        out[0] = b'_';
        lossy = true;
    }
    if out[0] == DIR_ENTRY_DELETED {
        out[0] = crate::DIR_ENTRY_KANJI;
    }
    (out, lossy)
}

/// Splice `~n` after the first `keep` bytes of the 8-byte base.
fn numeric_tail(basis: &[u8; 11], n: u32) -> [u8; 11] {
    let mut digits = [0u8; 7];
    let mut len = 0;
    let mut v = n;
    while v > 0 {
        digits[len] = b'0' + (v % 10) as u8;
        v /= 10;
        len += 1;
    }
    let keep_max = 8 - (len + 1);
    let base_len = basis[..8]
        .iter()
        .position(|&b| b == SPACE)
        .unwrap_or(8)
        .min(keep_max);

    let mut out = *basis;
    out[base_len] = b'~';
    for i in 0..len {
        out[base_len + 1 + i] = digits[len - 1 - i];
    }
    for b in out[base_len + 1 + len..8].iter_mut() {
        *b = SPACE;
    }
    out
}

/// 16-bit hash of the original long name, used by the `N >= 5` rehash form.
fn name_hash(name: &str) -> u16 {
    let mut hash: u16 = 0;
    for unit in name.encode_utf16() {
        hash = hash.rotate_left(3) ^ unit;
    }
    hash
}

/// First two basis letters, four hex digits, then `~n`.
fn hashed_tail(basis: &[u8; 11], hash: u16, n: u32) -> [u8; 11] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = *basis;
    for b in out[..8].iter_mut() {
        if *b == SPACE {
            *b = b'0';
        }
    }
    out[2] = HEX[(hash >> 12) as usize & 0xF];
    out[3] = HEX[(hash >> 8) as usize & 0xF];
    out[4] = HEX[(hash >> 4) as usize & 0xF];
    out[5] = HEX[hash as usize & 0xF];
    numeric_tail(&out, n)
}

/// Produce a unique short name for `name` within a directory. `exists`
/// answers whether a candidate raw name is already taken.
pub fn long_to_short(
    name: &str,
    cp: OemCodepage,
    mut exists: impl FnMut(&[u8; 11]) -> Result<bool>,
) -> Result<[u8; 11]> {
    let (basis, lossy) = short_basis(name, cp);

    if !lossy && legal_short(&basis) && !exists(&basis)? {
        return Ok(basis);
    }

    for n in 1..=4u32 {
        let candidate = numeric_tail(&basis, n);
        if legal_short(&candidate) && !exists(&candidate)? {
            return Ok(candidate);
        }
    }

    let hash = name_hash(name);
    for n in 5..=999_999u32 {
        let candidate = hashed_tail(&basis, hash, n);
        if legal_short(&candidate) && !exists(&candidate)? {
            return Ok(candidate);
        }
    }

    Err(Error::NameTaken)
}

/// Decode a raw short name for presentation: OEM to Unicode, a dot between
/// base and extension, case folded per the directory entry's case flags.
pub fn short_display(raw: &[u8; 11], case_flags: u8, cp: OemCodepage) -> String {
    use crate::entry::{CASE_LOWER_BASE, CASE_LOWER_EXT};
    let mut out = String::new();
    for &b in raw[..8].iter().take_while(|&&b| b != SPACE) {
        let c = cp.to_unicode(b);
        if case_flags & CASE_LOWER_BASE != 0 {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    if raw[8] != SPACE {
        out.push('.');
        for &b in raw[8..].iter().take_while(|&&b| b != SPACE) {
            let c = cp.to_unicode(b);
            if case_flags & CASE_LOWER_EXT != 0 {
                out.extend(c.to_lowercase());
            } else {
                out.push(c);
            }
        }
    }
    out
}

/// Encode a volume label: up to 11 OEM characters, upper-cased, space
/// padded. Labels reject the long-name specials outright.
pub fn label_from_str(label: &str, cp: OemCodepage) -> Result<[u8; 11]> {
    let mut out = [SPACE; 11];
    let mut at = 0;
    for c in label.chars() {
        if at == 11 {
            return Err(Error::NameTooLong);
        }
        let upper = c.to_ascii_uppercase();
        if (upper as u32) < 0x20 || (upper.is_ascii() && LONG_ILLEGAL.contains(&(upper as u8))) {
            return Err(Error::BadName);
        }
        out[at] = cp.from_unicode(upper).ok_or(Error::BadName)?;
        at += 1;
    }
    Ok(out)
}

/// Label for display: trailing spaces stripped, lower-cased.
pub fn label_display(raw: &[u8; 11], cp: OemCodepage) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != SPACE)
        .map(|i| i + 1)
        .unwrap_or(0);
    let mut out = String::new();
    for &b in &raw[..end] {
        out.extend(cp.to_unicode(b).to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_collisions(_: &[u8; 11]) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn legal_long_rules() {
        assert!(legal_long("hello.txt"));
        assert!(legal_long("spaces are fine"));
        assert!(legal_long(".profile"));
        assert!(!legal_long(""));
        assert!(!legal_long("."));
        assert!(!legal_long(".."));
        assert!(!legal_long(". .."));
        assert!(!legal_long("a\\b"));
        assert!(!legal_long("a*b"));
        assert!(!legal_long("a\x1fb"));
        assert!(!legal_long("what?"));
    }

    #[test]
    fn device_names_rejected() {
        assert!(!legal_short(b"CON        "));
        assert!(!legal_short(b"NUL     TXT"));
        assert!(!legal_short(b"COM4       "));
        assert!(!legal_short(b"LPT0    LOG"));
        assert!(legal_short(b"CONSOLE    "));
        assert!(legal_short(b"COMMAND COM"));
        assert!(is_reserved_device_name("aux.txt"));
        assert!(!is_reserved_device_name("auxiliary.txt"));
    }

    #[test]
    fn clean_names_pass_through_untailed() {
        let raw = long_to_short("README.TXT", OemCodepage::Cp850, no_collisions).unwrap();
        assert_eq!(&raw, b"README  TXT");
    }

    #[test]
    fn lossy_names_get_a_numeric_tail() {
        let raw =
            long_to_short("A file with a long name.txt", OemCodepage::Cp850, no_collisions)
                .unwrap();
        assert_eq!(&raw, b"AFILEW~1TXT");

        // Lower case alone forces the tail as well.
        let raw = long_to_short("readme.txt", OemCodepage::Cp850, no_collisions).unwrap();
        assert_eq!(&raw, b"README~1TXT");
    }

    #[test]
    fn collisions_walk_the_tail() {
        let taken: &[&[u8; 11]] = &[b"AFILEW~1TXT", b"AFILEW~2TXT"];
        let raw = long_to_short(
            "A file with a long name.txt",
            OemCodepage::Cp850,
            |candidate| Ok(taken.contains(&candidate)),
        )
        .unwrap();
        assert_eq!(&raw, b"AFILEW~3TXT");
    }

    #[test]
    fn heavy_collision_switches_to_hash_form() {
        let raw = long_to_short("collision prone name.dat", OemCodepage::Cp850, |c| {
            // Every plain-basis candidate is taken; the hashed form has hex
            // digits in bytes 2..6 and gets through.
            Ok(!c[2..6].iter().all(|b| b.is_ascii_hexdigit()))
        })
        .unwrap();
        // 2 basis letters, 4 hex digits, ~5.
        assert_eq!(raw[6], b'~');
        assert_eq!(raw[7], b'5');
        assert!(raw[2..6].iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(&raw[8..], b"DAT");
    }

    #[test]
    fn basis_handles_dotfiles_and_substitutions() {
        let (basis, lossy) = short_basis(".profile", OemCodepage::Cp850);
        assert!(lossy);
        assert_eq!(&basis, b"PROFILE    ");

        let (basis, lossy) = short_basis("foo[1].c", OemCodepage::Cp850);
        assert!(lossy);
        assert_eq!(&basis, b"FOO_1_  C  ");
    }

    #[test]
    fn oem_round_trip() {
        for cp in [OemCodepage::Cp850, OemCodepage::Cp1252] {
            for byte in 0x20u8..=0xFF {
                if byte == 0x7F {
                    continue;
                }
                let c = cp.to_unicode(byte);
                assert_eq!(cp.from_unicode(c), Some(byte), "byte {:#x}", byte);
            }
        }
        // CP850 has no euro sign; CP1252 does.
        assert_eq!(OemCodepage::Cp850.from_unicode('€'), None);
        assert_eq!(OemCodepage::Cp1252.from_unicode('€'), Some(0x80));
    }

    #[test]
    fn labels() {
        let raw = label_from_str("TestVol", OemCodepage::Cp850).unwrap();
        assert_eq!(&raw, b"TESTVOL    ");
        assert_eq!(label_display(&raw, OemCodepage::Cp850), "testvol");
        assert!(label_from_str("way too long label", OemCodepage::Cp850).is_err());
        assert!(label_from_str("bad/label", OemCodepage::Cp850).is_err());
    }
}
