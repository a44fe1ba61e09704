pub(crate) mod block;
pub mod codec;

use anyhow::{bail, Result};
use indexmap::IndexMap;

use self::codec::*;

/// Setuid, setgid and sticky bits.
pub const ISUID: i64 = 0o4000;
pub const ISGID: i64 = 0o2000;
pub const ISVTX: i64 = 0o1000;

/// File type nibble, as it may appear in a decoded mode field.
pub const ISDIR: i64 = 0o40000;
pub const ISFIFO: i64 = 0o10000;
pub const ISREG: i64 = 0o100000;
pub const ISLNK: i64 = 0o120000;
pub const ISBLK: i64 = 0o60000;
pub const ISCHR: i64 = 0o20000;
pub const ISSOCK: i64 = 0o140000;

/// Header type flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlag {
    /// Regular file.
    Reg,
    /// Legacy regular file, promoted to `Reg` or `Dir` when written.
    RegA,
    /// Hard link.
    Link,
    /// Symbolic link.
    Symlink,
    /// Character device node.
    Char,
    /// Block device node.
    Block,
    /// Directory.
    Dir,
    /// Named pipe.
    Fifo,
    /// Reserved.
    Cont,
    /// PAX extended header, applies to the next entry only.
    XHeader,
    /// PAX global header, applies to all subsequent entries.
    XGlobalHeader,
    /// GNU long name meta entry.
    GnuLongName,
    /// GNU long link name meta entry.
    GnuLongLink,
    /// Old-GNU sparse file.
    GnuSparse,
    Unknown(u8),
}

impl From<u8> for TypeFlag {
    fn from(value: u8) -> Self {
        match value {
            b'0' => Self::Reg,
            0 => Self::RegA,
            b'1' => Self::Link,
            b'2' => Self::Symlink,
            b'3' => Self::Char,
            b'4' => Self::Block,
            b'5' => Self::Dir,
            b'6' => Self::Fifo,
            b'7' => Self::Cont,
            b'x' => Self::XHeader,
            b'g' => Self::XGlobalHeader,
            b'L' => Self::GnuLongName,
            b'K' => Self::GnuLongLink,
            b'S' => Self::GnuSparse,
            v => Self::Unknown(v),
        }
    }
}

impl From<TypeFlag> for u8 {
    fn from(value: TypeFlag) -> Self {
        match value {
            TypeFlag::Reg => b'0',
            TypeFlag::RegA => 0,
            TypeFlag::Link => b'1',
            TypeFlag::Symlink => b'2',
            TypeFlag::Char => b'3',
            TypeFlag::Block => b'4',
            TypeFlag::Dir => b'5',
            TypeFlag::Fifo => b'6',
            TypeFlag::Cont => b'7',
            TypeFlag::XHeader => b'x',
            TypeFlag::XGlobalHeader => b'g',
            TypeFlag::GnuLongName => b'L',
            TypeFlag::GnuLongLink => b'K',
            TypeFlag::GnuSparse => b'S',
            TypeFlag::Unknown(v) => v,
        }
    }
}

impl Default for TypeFlag {
    fn default() -> Self {
        TypeFlag::Reg
    }
}

impl TypeFlag {
    /// True for types that never carry a payload, whatever `size` says.
    pub fn is_header_only(self) -> bool {
        matches!(
            self,
            TypeFlag::Link
                | TypeFlag::Symlink
                | TypeFlag::Char
                | TypeFlag::Block
                | TypeFlag::Dir
                | TypeFlag::Fifo
        )
    }
}

/// A set of archive formats. Single members are `V7`, `USTAR`, `PAX`, `GNU`
/// and `STAR`; a header may carry a union of them while several remain
/// feasible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Format(u32);

impl Format {
    pub const NONE: Format = Format(0);
    pub const V7: Format = Format(1 << 0);
    pub const USTAR: Format = Format(1 << 1);
    pub const PAX: Format = Format(1 << 2);
    pub const GNU: Format = Format(1 << 3);
    pub const STAR: Format = Format(1 << 4);

    pub(crate) const ANY: Format =
        Format(Format::V7.0 | Format::USTAR.0 | Format::PAX.0 | Format::GNU.0 | Format::STAR.0);

    /// True when the sets intersect.
    pub fn has(self, other: Format) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: Format) -> Format {
        Format(self.0 | other.0)
    }

    pub(crate) fn may_be(&mut self, other: Format) {
        self.0 |= other.0;
    }

    pub(crate) fn may_only_be(&mut self, other: Format) {
        self.0 &= other.0;
    }

    pub(crate) fn must_not_be(&mut self, other: Format) {
        self.0 &= !other.0;
    }
}

/// An instant with nanosecond resolution, pinned to the Unix epoch. The
/// all-zero instant means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    secs: i64,
    nsecs: u32,
}

impl Time {
    pub const ZERO: Time = Time { secs: 0, nsecs: 0 };

    /// Builds an instant from seconds and a nanosecond offset, which may be
    /// negative or exceed one second; it is normalized into `0..1e9` by
    /// carrying whole seconds.
    pub fn from_unix(secs: i64, nsecs: i64) -> Self {
        let carry = nsecs.div_euclid(1_000_000_000);
        Time {
            secs: secs + carry,
            nsecs: nsecs.rem_euclid(1_000_000_000) as u32,
        }
    }

    pub fn secs(self) -> i64 {
        self.secs
    }

    pub fn nanos(self) -> u32 {
        self.nsecs
    }

    pub fn is_zero(self) -> bool {
        self == Time::ZERO
    }
}

/// One logical archive entry.
///
/// All fields are plain data; the reader produces one `Header` per entry and
/// the writer consumes one per `write_header` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    /// Entry type.
    pub flag: TypeFlag,
    /// File name.
    pub name: String,
    /// Target of a hard or symbolic link.
    pub link_name: String,
    /// Logical payload size in bytes.
    pub size: i64,
    /// Permission and mode bits.
    pub mode: i64,
    /// Owner user ID.
    pub uid: i32,
    /// Owner group ID.
    pub gid: i32,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
    /// Modification time.
    pub mod_time: Time,
    /// Access time; requires PAX, GNU or STAR.
    pub access_time: Time,
    /// Change time; requires PAX, GNU or STAR.
    pub change_time: Time,
    /// Device major number.
    pub dev_major: i64,
    /// Device minor number.
    pub dev_minor: i64,
    /// PAX records carried by the entry. Keys are unique; output order is
    /// lexicographic regardless of insertion order.
    pub pax_records: IndexMap<String, String>,
    /// Extended attributes, stored on the wire as `SCHILY.xattr.` records.
    pub xattr: IndexMap<String, String>,
    /// Formats this header is known or allowed to use.
    pub format: Format,
}

impl Header {
    pub fn new(flag: TypeFlag) -> Self {
        Header {
            flag,
            ..Header::default()
        }
    }

    /// The mode with the file type nibble filled in, the way a stat-like
    /// consumer expects it. The type flag wins over any nibble already
    /// embedded in `mode`.
    pub fn file_mode(&self) -> i64 {
        let perm = self.mode & 0o7777;
        let embedded = self.mode & !0o7777;
        let kind = match self.flag {
            TypeFlag::Dir => ISDIR,
            TypeFlag::Symlink => ISLNK,
            TypeFlag::Char => ISCHR,
            TypeFlag::Block => ISBLK,
            TypeFlag::Fifo => ISFIFO,
            TypeFlag::Reg | TypeFlag::RegA | TypeFlag::Cont | TypeFlag::GnuSparse => match embedded
            {
                ISDIR | ISFIFO | ISLNK | ISBLK | ISCHR | ISSOCK => embedded,
                _ => ISREG,
            },
            _ => embedded,
        };
        perm | kind
    }

    /// Decides which formats can represent this header.
    ///
    /// Every field is tested against each family's encoding limits; a field a
    /// family cannot carry removes that family and, when PAX is still in
    /// play, lands in the returned PAX override map under its canonical key.
    ///
    /// # Returns
    /// * `Ok((allowed, pax_overrides))` - The feasible format set and the PAX
    ///   records needed to represent the rejected fields.
    /// * `Err(e)` - If no format can represent the header, with the reasons,
    ///   or if the header violates a hard rule.
    pub fn allowed_formats(&self) -> Result<(Format, IndexMap<String, String>)> {
        let mut chk = FormatChecker {
            header: self,
            allowed: Format::USTAR.union(Format::PAX).union(Format::GNU),
            prefer_pax: false,
            pax: IndexMap::new(),
            why_no_ustar: None,
            why_no_pax: None,
            why_no_gnu: None,
        };
        let mut why_only_pax: Option<&'static str> = None;

        chk.verify_string(&self.name, block::V7_NAME.len(), "name", PAX_PATH);
        chk.verify_string(&self.link_name, block::V7_LINKNAME.len(), "link_name", PAX_LINKPATH);
        chk.verify_string(&self.uname, block::USTAR_UNAME.len(), "uname", PAX_UNAME);
        chk.verify_string(&self.gname, block::USTAR_GNAME.len(), "gname", PAX_GNAME);
        chk.verify_numeric(self.mode, block::V7_MODE.len(), "mode", PAX_NONE);
        chk.verify_numeric(self.uid as i64, block::V7_UID.len(), "uid", PAX_UID);
        chk.verify_numeric(self.gid as i64, block::V7_GID.len(), "gid", PAX_GID);
        chk.verify_numeric(self.size, block::V7_SIZE.len(), "size", PAX_SIZE);
        chk.verify_numeric(self.dev_major, block::USTAR_DEVMAJOR.len(), "dev_major", PAX_NONE);
        chk.verify_numeric(self.dev_minor, block::USTAR_DEVMINOR.len(), "dev_minor", PAX_NONE);
        chk.verify_time(self.mod_time, block::V7_MTIME.len(), "mod_time", PAX_MTIME);
        chk.verify_time(self.access_time, block::GNU_ATIME.len(), "access_time", PAX_ATIME);
        chk.verify_time(self.change_time, block::GNU_CTIME.len(), "change_time", PAX_CTIME);

        match self.flag {
            TypeFlag::Reg | TypeFlag::Char | TypeFlag::Block | TypeFlag::Fifo | TypeFlag::GnuSparse => {
                // Links and symlinks may legitimately point at directories.
                if self.name.ends_with('/') {
                    bail!("tar header name may not have a trailing slash: {:?}", self.name);
                }
            }
            TypeFlag::XHeader | TypeFlag::GnuLongName | TypeFlag::GnuLongLink => {
                bail!("tar header type flag is reserved for the encoder");
            }
            TypeFlag::XGlobalHeader => {
                let allowed_fields = Header {
                    name: self.name.clone(),
                    flag: self.flag,
                    xattr: self.xattr.clone(),
                    pax_records: self.pax_records.clone(),
                    format: self.format,
                    ..Header::default()
                };
                if *self != allowed_fields {
                    bail!("tar header may only set name, xattr and PAX records for a global extended header");
                }
                why_only_pax = Some("only PAX supports global extended headers");
                chk.allowed.may_only_be(Format::PAX);
            }
            _ => {}
        }
        if !self.flag.is_header_only() && self.size < 0 {
            bail!("tar header has a negative size");
        }

        if !self.xattr.is_empty() {
            for (k, v) in &self.xattr {
                chk.pax.insert(format!("{PAX_SCHILY_XATTR}{k}"), v.clone());
            }
            why_only_pax = Some("only PAX supports xattr");
            chk.allowed.may_only_be(Format::PAX);
        }
        if !self.pax_records.is_empty() {
            for (k, v) in &self.pax_records {
                if !valid_pax_record(k, v) {
                    bail!("invalid PAX record: {k:?} = {v:?}");
                }
                if k.starts_with(PAX_GNU_SPARSE) {
                    bail!("tar header may not manually encode GNU sparse records");
                }
                chk.pax.insert(k.clone(), v.clone());
            }
            why_only_pax = Some("only PAX supports PAX records");
            chk.allowed.may_only_be(Format::PAX);
        }
        for (k, v) in &chk.pax {
            if !valid_pax_record(k, v) {
                bail!("invalid PAX record: {k:?} = {v:?}");
            }
        }

        // Sub-second precision would be silently truncated by USTAR.
        if chk.prefer_pax && chk.allowed.has(Format::PAX) {
            chk.allowed.must_not_be(Format::USTAR);
            chk.why_no_ustar
                .get_or_insert_with(|| "USTAR cannot encode sub-second times".to_string());
        }
        if self.format != Format::NONE {
            let mut want = self.format;
            if want.has(Format::PAX) && !chk.prefer_pax {
                // At the header level PAX is a superset of USTAR.
                want.may_be(Format::USTAR);
            }
            chk.allowed.may_only_be(want);
        }
        if chk.allowed == Format::NONE {
            let mut reasons: Vec<String> = Vec::new();
            if self.format == Format::USTAR {
                reasons.push("format specifies USTAR".to_string());
                reasons.extend(chk.why_no_ustar);
            } else if self.format == Format::PAX {
                reasons.push("format specifies PAX".to_string());
                reasons.extend(chk.why_no_pax);
            } else if self.format == Format::GNU {
                reasons.push("format specifies GNU".to_string());
                reasons.extend(chk.why_no_gnu);
            } else {
                reasons.extend(chk.why_no_ustar);
                reasons.extend(chk.why_no_pax);
                reasons.extend(chk.why_no_gnu);
            }
            reasons.extend(why_only_pax.map(str::to_string));
            bail!("tar header cannot be encoded: {}", reasons.join("; "));
        }
        Ok((chk.allowed, chk.pax))
    }
}

/// Mutable state of the per-field format feasibility walk.
struct FormatChecker<'a> {
    header: &'a Header,
    allowed: Format,
    prefer_pax: bool,
    pax: IndexMap<String, String>,
    why_no_ustar: Option<String>,
    why_no_pax: Option<String>,
    why_no_gnu: Option<String>,
}

impl FormatChecker<'_> {
    fn verify_string(&mut self, s: &str, max: usize, field: &str, pax_key: &'static str) {
        let too_long = s.len() > max;
        // Overlong names and link names ride in GNU long-name meta entries.
        let allow_long_gnu = pax_key == PAX_PATH || pax_key == PAX_LINKPATH;
        if has_nul(s) || (too_long && !allow_long_gnu) {
            self.why_no_gnu = Some(format!("GNU cannot encode {field}={s:?}"));
            self.allowed.must_not_be(Format::GNU);
        }
        if !is_ascii_str(s) || too_long {
            let can_split_ustar = pax_key == PAX_PATH;
            if !can_split_ustar || split_ustar_path(s).is_none() {
                self.why_no_ustar = Some(format!("USTAR cannot encode {field}={s:?}"));
                self.allowed.must_not_be(Format::USTAR);
            }
            if pax_key == PAX_NONE {
                self.why_no_pax = Some(format!("PAX cannot encode {field}={s:?}"));
                self.allowed.must_not_be(Format::PAX);
            } else {
                self.pax.insert(pax_key.to_string(), s.to_string());
            }
        }
        if let Some(v) = self.header.pax_records.get(pax_key) {
            if v == s {
                self.pax.insert(pax_key.to_string(), v.clone());
            }
        }
    }

    fn verify_numeric(&mut self, n: i64, max: usize, field: &str, pax_key: &'static str) {
        if !fits_in_base256(max, n) {
            self.why_no_gnu = Some(format!("GNU cannot encode {field}={n}"));
            self.allowed.must_not_be(Format::GNU);
        }
        if !fits_in_octal(max, n) {
            self.why_no_ustar = Some(format!("USTAR cannot encode {field}={n}"));
            self.allowed.must_not_be(Format::USTAR);
            if pax_key == PAX_NONE {
                self.why_no_pax = Some(format!("PAX cannot encode {field}={n}"));
                self.allowed.must_not_be(Format::PAX);
            } else {
                self.pax
                    .insert(pax_key.to_string(), itoa::Buffer::new().format(n).to_string());
            }
        }
    }

    fn verify_time(&mut self, ts: Time, max: usize, field: &str, pax_key: &'static str) {
        if ts.is_zero() {
            return; // Unset is always representable
        }
        if !fits_in_base256(max, ts.secs()) {
            self.why_no_gnu = Some(format!("GNU cannot encode {field}={ts:?}"));
            self.allowed.must_not_be(Format::GNU);
        }
        let is_mtime = pax_key == PAX_MTIME;
        let fits_octal = fits_in_octal(max, ts.secs());
        if (is_mtime && !fits_octal) || !is_mtime {
            self.why_no_ustar = Some(format!("USTAR cannot encode {field}={ts:?}"));
            self.allowed.must_not_be(Format::USTAR);
        }
        let needs_nanos = ts.nanos() != 0;
        if !is_mtime || !fits_octal || needs_nanos {
            self.prefer_pax = true;
            if pax_key == PAX_NONE {
                self.why_no_pax = Some(format!("PAX cannot encode {field}={ts:?}"));
                self.allowed.must_not_be(Format::PAX);
            } else {
                self.pax.insert(pax_key.to_string(), format_pax_time(ts));
            }
        }
    }
}

/// Splits a path into a USTAR `(prefix, suffix)` pair at a `/`, such that the
/// suffix fits the 100-byte name field and the prefix the 155-byte prefix
/// field. Returns `None` when no such split exists.
pub(crate) fn split_ustar_path(name: &str) -> Option<(&str, &str)> {
    let name_size = block::V7_NAME.len();
    let prefix_size = block::USTAR_PREFIX.len();

    let mut length = name.len();
    if length <= name_size || !is_ascii_str(name) {
        return None;
    }
    if length > prefix_size + 1 {
        length = prefix_size + 1;
    } else if name.as_bytes()[length - 1] == b'/' {
        length -= 1;
    }

    let i = name[..length].rfind('/')?;
    let nlen = name.len() - i - 1;
    if i == 0 || nlen == 0 || nlen > name_size || i > prefix_size {
        return None;
    }
    Some((&name[..i], &name[i + 1..]))
}
