use anyhow::{bail, Result};

use super::Time;
use crate::TarError;

/// Keywords for PAX extended header records.
pub const PAX_NONE: &str = ""; // Indicates that no PAX key is suitable
pub const PAX_PATH: &str = "path";
pub const PAX_LINKPATH: &str = "linkpath";
pub const PAX_SIZE: &str = "size";
pub const PAX_UID: &str = "uid";
pub const PAX_GID: &str = "gid";
pub const PAX_UNAME: &str = "uname";
pub const PAX_GNAME: &str = "gname";
pub const PAX_MTIME: &str = "mtime";
pub const PAX_ATIME: &str = "atime";
pub const PAX_CTIME: &str = "ctime"; // Removed from a later revision of the PAX spec, but was valid
pub const PAX_CHARSET: &str = "charset"; // Currently unused
pub const PAX_COMMENT: &str = "comment"; // Currently unused

pub const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// Keywords for GNU sparse files in a PAX extended header.
pub const PAX_GNU_SPARSE: &str = "GNU.sparse.";
pub const PAX_GNU_SPARSE_NUMBLOCKS: &str = "GNU.sparse.numblocks";
pub const PAX_GNU_SPARSE_OFFSET: &str = "GNU.sparse.offset";
pub const PAX_GNU_SPARSE_NUMBYTES: &str = "GNU.sparse.numbytes";
pub const PAX_GNU_SPARSE_MAP: &str = "GNU.sparse.map";
pub const PAX_GNU_SPARSE_NAME: &str = "GNU.sparse.name";
pub const PAX_GNU_SPARSE_MAJOR: &str = "GNU.sparse.major";
pub const PAX_GNU_SPARSE_MINOR: &str = "GNU.sparse.minor";
pub const PAX_GNU_SPARSE_SIZE: &str = "GNU.sparse.size";
pub const PAX_GNU_SPARSE_REALSIZE: &str = "GNU.sparse.realsize";

/// Upper bound on the body of a meta file (PAX records, GNU long names).
pub(crate) const MAX_META_FILE_SIZE: usize = 1 << 20;

// Helper to extract null-terminated strings
pub(crate) fn parse_string(buf: &[u8]) -> Result<String> {
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..nul]) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => bail!(TarError::InvalidHeader("string field is not valid UTF-8")),
    }
}

/// Writes `s` into `dst`, truncating to fit and NUL-terminating when there is
/// room. A value truncated on a `/` would look like a directory to some
/// readers, so a trailing slash produced by truncation is replaced with NUL.
pub(crate) fn format_string(dst: &mut [u8], s: &str) {
    let b = s.as_bytes();
    let n = b.len().min(dst.len());
    dst[..n].copy_from_slice(&b[..n]);
    if n < dst.len() {
        dst[n..].fill(0);
    }
    if b.len() > dst.len() && dst[dst.len() - 1] == b'/' {
        let kept = dst.iter().rposition(|&c| c != b'/').map_or(0, |i| i + 1);
        dst[kept] = 0;
    }
}

// Helper to parse octal fields, which may be padded with leading or trailing
// NULs and spaces. An empty field decodes as zero.
pub(crate) fn parse_octal<T>(buf: &[u8]) -> Result<T>
where
    T: num_traits::Num,
{
    let s = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(_) => bail!(TarError::InvalidHeader("octal field is not valid text")),
    };
    let s = s.trim_matches(|c| c == '\0' || c == ' ');
    if s.is_empty() {
        return Ok(T::zero());
    }
    match T::from_str_radix(s, 8) {
        Ok(v) => Ok(v),
        Err(_) => bail!(TarError::InvalidHeader("invalid octal field")),
    }
}

/// Parses a numeric field, dispatching on the encoding: if the high bit of
/// the first byte is set the field is base-256 (big-endian two's complement,
/// the second-highest bit carrying the sign through an inversion mask),
/// otherwise it is octal.
pub(crate) fn parse_numeric(buf: &[u8]) -> Result<i64> {
    if let Some(&first) = buf.first() {
        if first & 0x80 != 0 {
            let inv: u8 = if first & 0x40 != 0 { 0xff } else { 0x00 };
            let mut x: u64 = 0;
            for (i, &b) in buf.iter().enumerate() {
                let mut c = b ^ inv;
                if i == 0 {
                    c &= 0x7f; // Ignore the binary flag bit
                }
                if x >> 56 > 0 {
                    bail!(TarError::InvalidHeader("base-256 field overflows 64 bits"));
                }
                x = x << 8 | c as u64;
            }
            if x >> 63 > 0 {
                bail!(TarError::InvalidHeader("base-256 field overflows 64 bits"));
            }
            return Ok(if inv == 0xff { !(x as i64) } else { x as i64 });
        }
    }
    Ok(parse_octal::<u64>(buf)? as i64)
}

/// True when `x` encodes as octal in `n` bytes, leaving room for the
/// terminating NUL.
pub(crate) fn fits_in_octal(n: usize, x: i64) -> bool {
    let oct_bits = (n.saturating_sub(1)) as u32 * 3;
    x >= 0 && (n >= 22 || x < 1i64 << oct_bits)
}

/// True when `x` encodes as base-256 in `n` bytes.
pub(crate) fn fits_in_base256(n: usize, x: i64) -> bool {
    let bin_bits = (n.saturating_sub(1)) as u32 * 8;
    n >= 9 || (x >= -(1i64 << bin_bits) && x < 1i64 << bin_bits)
}

pub(crate) fn format_octal(dst: &mut [u8], x: i64) -> Result<()> {
    if !fits_in_octal(dst.len(), x) {
        bail!(TarError::FieldTooLong);
    }
    let s = format!("{:0>width$o}", x, width = dst.len() - 1);
    format_string(dst, &s);
    Ok(())
}

/// Writes `x` as octal if it fits, else as base-256 with the high bit of the
/// first byte marking the binary encoding.
pub(crate) fn format_numeric(dst: &mut [u8], x: i64) -> Result<()> {
    if fits_in_octal(dst.len(), x) {
        return format_octal(dst, x);
    }
    if fits_in_base256(dst.len(), x) {
        let mut v = x;
        for b in dst.iter_mut().rev() {
            *b = v as u8;
            v >>= 8;
        }
        dst[0] |= 0x80;
        return Ok(());
    }
    bail!(TarError::FieldTooLong)
}

// ASCII here also excludes NUL, which no string field may carry.
pub(crate) fn is_ascii_str(s: &str) -> bool {
    s.bytes().all(|b| b < 0x80 && b != 0)
}

pub(crate) fn has_nul(s: &str) -> bool {
    s.bytes().any(|b| b == 0)
}

/// Best-effort ASCII coercion: non-ASCII bytes and NULs are dropped.
pub(crate) fn to_ascii(s: &str) -> String {
    if is_ascii_str(s) {
        return s.to_string();
    }
    s.bytes().filter(|&b| b < 0x80 && b != 0).map(char::from).collect()
}

pub(crate) fn parse_decimal(s: &str) -> Result<i64> {
    match s.parse::<i64>() {
        Ok(v) => Ok(v),
        Err(_) => bail!(TarError::InvalidHeader("invalid decimal field")),
    }
}

/// Validates a PAX record: keys must be non-empty and free of `=`; values of
/// keys that map onto USTAR string fields must be free of NUL.
pub(crate) fn valid_pax_record(k: &str, v: &str) -> bool {
    if k.is_empty() || k.contains('=') {
        return false;
    }
    match k {
        PAX_PATH | PAX_LINKPATH | PAX_UNAME | PAX_GNAME => !has_nul(v),
        _ => !has_nul(k),
    }
}

/// Parses one PAX record from the front of `s`.
///
/// # Arguments
/// * `s` - Record stream, starting at a `"%d %s=%s\n"` record.
///
/// # Returns
/// * `Ok((key, value, rest))` - The parsed record and the remaining stream.
/// * `Err(e)` - If the record is malformed.
pub(crate) fn parse_pax_record(s: &str) -> Result<(String, String, &str)> {
    let malformed = || TarError::InvalidHeader("malformed PAX record");
    let (n_str, rest) = s.split_once(' ').ok_or_else(malformed)?;
    let n: usize = n_str.parse().map_err(|_| malformed())?;
    if n < 5 || n > s.len() {
        bail!(malformed());
    }
    // Convert from an index in `s` to an index in `rest`.
    let n = n
        .checked_sub(n_str.len() + 1)
        .filter(|&n| n > 0 && rest.is_char_boundary(n))
        .ok_or_else(malformed)?;
    let (rec, rem) = rest.split_at(n);
    let rec = rec.strip_suffix('\n').ok_or_else(malformed)?;
    let (k, v) = rec.split_once('=').ok_or_else(malformed)?;
    if !valid_pax_record(k, v) {
        bail!(malformed());
    }
    Ok((k.to_string(), v.to_string(), rem))
}

/// Formats one PAX record as `"%d %s=%s\n"`, where the length prefix counts
/// itself.
pub(crate) fn format_pax_record(k: &str, v: &str) -> Result<String> {
    if !valid_pax_record(k, v) {
        bail!(TarError::InvalidHeader("invalid PAX record"));
    }
    let padding = 3; // ' ', '=' and '\n'
    let mut size = k.len() + v.len() + padding;
    size += itoa::Buffer::new().format(size).len();
    let record = format!("{size} {k}={v}\n");
    if record.len() == size {
        return Ok(record);
    }
    // Adding the size field grew the record by one digit.
    let size = record.len();
    Ok(format!("{size} {k}={v}\n"))
}

/// Formats a PAX timestamp as `%d.%09d` with trailing fractional zeros
/// stripped; a whole-second instant omits the fraction entirely. A negative
/// instant shares one sign between the integer and fractional parts.
pub(crate) fn format_pax_time(ts: Time) -> String {
    let (mut secs, mut nsecs) = (ts.secs(), ts.nanos() as i64);
    if nsecs == 0 {
        return itoa::Buffer::new().format(secs).to_string();
    }
    let mut sign = "";
    if secs < 0 {
        sign = "-";
        secs = -(secs + 1); // Carry one second into the fraction
        nsecs = 1_000_000_000 - nsecs;
    }
    let s = format!("{sign}{secs}.{nsecs:09}");
    s.trim_end_matches('0').to_string()
}

/// Parses a PAX timestamp. The fractional part is optional and truncated to
/// nanosecond precision.
pub(crate) fn parse_pax_time(s: &str) -> Result<Time> {
    const MAX_NANO_DIGITS: usize = 9;
    let (ss, sn) = match s.find('.') {
        Some(pos) => (&s[..pos], &s[pos + 1..]),
        None => (s, ""),
    };
    let secs = parse_decimal(ss)?;
    if sn.is_empty() {
        return Ok(Time::from_unix(secs, 0));
    }
    if !sn.bytes().all(|b| b.is_ascii_digit()) {
        bail!(TarError::InvalidHeader("invalid PAX timestamp"));
    }
    let sn = if sn.len() < MAX_NANO_DIGITS {
        let width = MAX_NANO_DIGITS;
        format!("{sn:0<width$}")
    } else {
        sn[..MAX_NANO_DIGITS].to_string()
    };
    let nsecs = parse_decimal(&sn)?;
    if ss.starts_with('-') {
        Ok(Time::from_unix(secs, -nsecs))
    } else {
        Ok(Time::from_unix(secs, nsecs))
    }
}
