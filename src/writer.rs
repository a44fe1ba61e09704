use std::io::{self, Read, Write};

use anyhow::{bail, Result};
use indexmap::IndexMap;

use crate::header::block::{self, block_padding, Block, ZERO_BLOCK};
use crate::header::codec::{self, MAX_META_FILE_SIZE};
use crate::header::{split_ustar_path, Format, Header, Time, TypeFlag};
use crate::sparse::SparseEntry;
use crate::TarError;

/// Streaming tar archive writer.
///
/// Entries are written as a header followed by the payload bytes, supplied
/// through the `std::io::Write` impl. The payload is gated to the `size`
/// declared in the header, and the zero padding to the next block boundary is
/// deferred until the next header or the final trailer.
pub struct TarWriter<W: Write> {
    inner: W,
    pad: i64,
    payload: PayloadWriter,
    blk: Block,
    closed: bool,
    broken: bool,
}

/// Per-entry payload sink.
///
/// `Sparse` forwards bytes inside data fragments and discards bytes inside
/// holes; it exists to pass through previously parsed sparse entries and is
/// never installed by `write_header`.
enum PayloadWriter {
    Regular {
        remaining: i64,
    },
    Sparse {
        fragments: Vec<SparseEntry>,
        cursor: usize,
        pos: i64,
        remaining: i64,
    },
}

impl PayloadWriter {
    fn logical_remaining(&self) -> i64 {
        match self {
            PayloadWriter::Regular { remaining } => *remaining,
            PayloadWriter::Sparse { fragments, pos, .. } => {
                fragments.last().map_or(0, |f| f.end_offset()) - pos
            }
        }
    }
}

impl<W: Write> TarWriter<W> {
    pub fn new(inner: W) -> Self {
        TarWriter {
            inner,
            pad: 0,
            payload: PayloadWriter::Regular { remaining: 0 },
            blk: ZERO_BLOCK,
            closed: false,
            broken: false,
        }
    }

    /// Begins a new archive entry.
    ///
    /// Settles the previous entry first: its payload budget must be fully
    /// written, and its padding is emitted here. The header is then encoded
    /// in the most portable format it allows, emitting PAX extended records
    /// or GNU long-name entries as needed.
    ///
    /// # Arguments
    /// * `header` - The entry to write. Not mutated; normalization happens on
    ///   an internal copy.
    ///
    /// # Returns
    /// * `Ok(())` - Header (and any meta entries) written; the writer now
    ///   accepts exactly `header.size` payload bytes.
    /// * `Err(e)` - If the previous entry is unfinished, the header cannot be
    ///   encoded, or the transport fails.
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.check_open()?;
        self.finish_entry()?;

        let mut hdr = header.clone();
        // Avoid the legacy flag: promote by trailing-slash inspection.
        if hdr.flag == TypeFlag::RegA {
            hdr.flag = if hdr.name.ends_with('/') {
                TypeFlag::Dir
            } else {
                TypeFlag::Reg
            };
        }
        // Without an explicit format request, drop the access and change
        // times so they alone do not promote every entry to PAX.
        if hdr.format == Format::NONE {
            hdr.access_time = Time::ZERO;
            hdr.change_time = Time::ZERO;
        }

        let (allowed, pax_overrides) = hdr.allowed_formats()?;
        let res = if allowed.has(Format::USTAR) {
            self.write_ustar_header(&mut hdr)
        } else if allowed.has(Format::PAX) {
            self.write_pax_header(&mut hdr, &pax_overrides)
        } else {
            self.write_gnu_header(&mut hdr)
        };
        if res.is_err() {
            self.broken = true;
        }
        res
    }

    /// Copies `r` into the current entry's payload.
    pub fn append_payload(&mut self, mut r: impl Read) -> Result<u64> {
        Ok(io::copy(&mut r, self)?)
    }

    /// Finishes the archive: settles the last entry, writes the two-block
    /// trailer and flushes the transport. Closing an already closed writer is
    /// a no-op; an unfinished entry fails before any trailer byte is written.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.check_open()?;
        self.closed = true;
        self.finish_entry()?;
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Closes the archive and hands back the transport.
    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        Ok(self.inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            bail!(TarError::WriteAfterClose);
        }
        if self.broken {
            bail!("tar writer is in an invalid state from a previous error");
        }
        Ok(())
    }

    /// Settles the current entry: the payload budget must be exhausted, and
    /// the deferred padding is written out.
    fn finish_entry(&mut self) -> Result<()> {
        let remaining = self.payload.logical_remaining();
        if remaining > 0 {
            bail!("tar entry is missing {remaining} bytes of payload");
        }
        if self.pad > 0 {
            self.inner.write_all(&ZERO_BLOCK[..self.pad as usize])?;
            self.pad = 0;
        }
        Ok(())
    }

    fn write_ustar_header(&mut self, hdr: &mut Header) -> Result<()> {
        let mut name_prefix = String::new();
        if let Some((prefix, suffix)) = split_ustar_path(&hdr.name) {
            let (prefix, suffix) = (prefix.to_string(), suffix.to_string());
            name_prefix = prefix;
            hdr.name = suffix;
        }

        self.template_v7_plus(hdr, false, false);
        codec::format_string(&mut self.blk[block::USTAR_PREFIX], &name_prefix);
        block::set_format(&mut self.blk, Format::USTAR);
        self.write_raw_header(hdr.size, hdr.flag)
    }

    fn write_pax_header(
        &mut self,
        hdr: &mut Header,
        pax_overrides: &IndexMap<String, String>,
    ) -> Result<()> {
        let real_name = hdr.name.clone();
        let is_global = hdr.flag == TypeFlag::XGlobalHeader;
        if !pax_overrides.is_empty() || is_global {
            // Records are rendered in lexicographic key order so the output
            // is deterministic.
            let mut keys: Vec<&String> = pax_overrides.keys().collect();
            keys.sort();
            let mut data = String::new();
            for k in keys {
                data.push_str(&codec::format_pax_record(k, &pax_overrides[k])?);
            }
            if data.len() > MAX_META_FILE_SIZE {
                bail!(TarError::FieldTooLong);
            }

            let (name, flag) = if is_global {
                let name = if real_name.is_empty() {
                    "GlobalHead.0.0".to_string()
                } else {
                    real_name.clone()
                };
                (name, TypeFlag::XGlobalHeader)
            } else {
                let (dir, file) = split_dir_base(&real_name);
                let name = if dir == "." {
                    format!("PaxHeaders.0/{file}")
                } else {
                    format!("{dir}/PaxHeaders.0/{file}")
                };
                (name, TypeFlag::XHeader)
            };
            self.write_raw_file(&name, &data, flag, Format::PAX)?;
            if is_global {
                return Ok(());
            }
        }

        // The USTAR portion of a PAX header carries a best-effort ASCII
        // rendition of the string fields; the records hold the real values.
        self.template_v7_plus(hdr, true, false);
        block::set_format(&mut self.blk, Format::PAX);
        self.write_raw_header(hdr.size, hdr.flag)
    }

    fn write_gnu_header(&mut self, hdr: &mut Header) -> Result<()> {
        const LONG_NAME: &str = "././@LongLink";
        if hdr.name.len() > block::V7_NAME.len() {
            let data = format!("{}\x00", hdr.name);
            self.write_raw_file(LONG_NAME, &data, TypeFlag::GnuLongName, Format::GNU)?;
        }
        if hdr.link_name.len() > block::V7_LINKNAME.len() {
            let data = format!("{}\x00", hdr.link_name);
            self.write_raw_file(LONG_NAME, &data, TypeFlag::GnuLongLink, Format::GNU)?;
        }

        self.template_v7_plus(hdr, false, true);
        if !hdr.access_time.is_zero() {
            // Validated by allowed_formats, cannot fail to fit.
            let _ = codec::format_numeric(&mut self.blk[block::GNU_ATIME], hdr.access_time.secs());
        }
        if !hdr.change_time.is_zero() {
            let _ = codec::format_numeric(&mut self.blk[block::GNU_CTIME], hdr.change_time.secs());
        }
        block::set_format(&mut self.blk, Format::GNU);
        self.write_raw_header(hdr.size, hdr.flag)
    }

    /// Fills the scratch block with the V7 fields plus the USTAR user, group
    /// and device fields. Strings are optionally coerced to ASCII; numbers
    /// use octal or base-256. Fields that fit no encoding are zeroed, since
    /// `allowed_formats` already rerouted them into PAX records.
    fn template_v7_plus(&mut self, hdr: &Header, ascii_strings: bool, base256: bool) {
        fn put_num(dst: &mut [u8], x: i64, base256: bool) {
            let ok = if base256 {
                codec::format_numeric(dst, x).is_ok()
            } else {
                codec::format_octal(dst, x).is_ok()
            };
            if !ok {
                let _ = codec::format_octal(dst, 0);
            }
        }
        let coerce = |s: &str| {
            if ascii_strings {
                codec::to_ascii(s)
            } else {
                s.to_string()
            }
        };

        self.blk = ZERO_BLOCK;
        self.blk[block::V7_TYPEFLAG] = hdr.flag.into();
        codec::format_string(&mut self.blk[block::V7_NAME], &coerce(&hdr.name));
        codec::format_string(&mut self.blk[block::V7_LINKNAME], &coerce(&hdr.link_name));
        put_num(&mut self.blk[block::V7_MODE], hdr.mode, base256);
        put_num(&mut self.blk[block::V7_UID], hdr.uid as i64, base256);
        put_num(&mut self.blk[block::V7_GID], hdr.gid as i64, base256);
        put_num(&mut self.blk[block::V7_SIZE], hdr.size, base256);
        put_num(&mut self.blk[block::V7_MTIME], hdr.mod_time.secs(), base256);
        codec::format_string(&mut self.blk[block::USTAR_UNAME], &coerce(&hdr.uname));
        codec::format_string(&mut self.blk[block::USTAR_GNAME], &coerce(&hdr.gname));
        put_num(&mut self.blk[block::USTAR_DEVMAJOR], hdr.dev_major, base256);
        put_num(&mut self.blk[block::USTAR_DEVMINOR], hdr.dev_minor, base256);
    }

    /// Writes a self-contained meta file such as a PAX extended header or a
    /// GNU long-name entry.
    fn write_raw_file(&mut self, name: &str, data: &str, flag: TypeFlag, format: Format) -> Result<()> {
        self.blk = ZERO_BLOCK;

        // Best effort for the meta file's own name.
        let mut name = codec::to_ascii(name);
        name.truncate(block::V7_NAME.len());
        let name = name.trim_end_matches('/');

        codec::format_string(&mut self.blk[block::V7_NAME], name);
        codec::format_octal(&mut self.blk[block::V7_MODE], 0)?;
        codec::format_octal(&mut self.blk[block::V7_UID], 0)?;
        codec::format_octal(&mut self.blk[block::V7_GID], 0)?;
        codec::format_octal(&mut self.blk[block::V7_SIZE], data.len() as i64)?;
        codec::format_octal(&mut self.blk[block::V7_MTIME], 0)?;
        self.blk[block::V7_TYPEFLAG] = flag.into();
        block::set_format(&mut self.blk, format);

        self.write_raw_header(data.len() as i64, flag)?;
        self.write_all(data.as_bytes())?;
        Ok(())
    }

    /// Emits the scratch block and arms the payload budget for the entry.
    fn write_raw_header(&mut self, size: i64, flag: TypeFlag) -> Result<()> {
        self.finish_entry()?;
        self.inner.write_all(&self.blk)?;
        let size = if flag.is_header_only() { 0 } else { size };
        self.payload = PayloadWriter::Regular { remaining: size };
        self.pad = block_padding(size);
        Ok(())
    }
}

/// Splits a name into directory and base components the way `dirname` and
/// `basename` do: trailing slashes are dropped before splitting, and a name
/// with no directory component left (no slash, or only a leading `./`) gets
/// the directory `"."`.
fn split_dir_base(name: &str) -> (&str, &str) {
    let trimmed = name.trim_end_matches('/');
    let (dir, file) = match trimmed.rfind('/') {
        Some(i) => (trimmed[..i].trim_end_matches('/'), &trimmed[i + 1..]),
        None => (".", trimmed),
    };
    if dir.is_empty() {
        (".", file)
    } else {
        (dir, file)
    }
}

impl<W: Write> Write for TarWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other(TarError::WriteAfterClose));
        }
        let Self {
            inner,
            payload,
            broken,
            ..
        } = self;
        let fail = |broken: &mut bool, e: io::Error| {
            *broken = true;
            Err(e)
        };
        match payload {
            PayloadWriter::Regular { remaining } => {
                let overflow = buf.len() as i64 > *remaining;
                let b = if overflow {
                    &buf[..*remaining as usize]
                } else {
                    buf
                };
                if !b.is_empty() {
                    if let Err(e) = inner.write_all(b) {
                        return fail(broken, e);
                    }
                    *remaining -= b.len() as i64;
                }
                if overflow {
                    return Err(io::Error::other(TarError::WriteTooLong));
                }
                Ok(b.len())
            }
            PayloadWriter::Sparse {
                fragments,
                cursor,
                pos,
                remaining,
            } => {
                let logical_end = fragments.last().map_or(*pos, |f| f.end_offset());
                let overflow = buf.len() as i64 > logical_end - *pos;
                let b = if overflow {
                    &buf[..(logical_end - *pos) as usize]
                } else {
                    buf
                };
                let mut written = 0usize;
                while written < b.len() {
                    let frag = fragments[*cursor];
                    let left = b.len() - written;
                    let nf = if *pos < frag.offset {
                        // Inside a hole: the bytes are dropped.
                        (left as i64).min(frag.offset - *pos) as usize
                    } else {
                        let nf = (left as i64).min(frag.end_offset() - *pos) as usize;
                        if let Err(e) = inner.write_all(&b[written..written + nf]) {
                            return fail(broken, e);
                        }
                        *remaining -= nf as i64;
                        nf
                    };
                    written += nf;
                    *pos += nf as i64;
                    if *pos >= frag.end_offset() && *cursor + 1 < fragments.len() {
                        *cursor += 1;
                    }
                }
                if logical_end == *pos && *remaining > 0 {
                    return Err(io::Error::other(TarError::UnreferencedData));
                }
                if overflow {
                    return Err(io::Error::other(TarError::WriteTooLong));
                }
                Ok(written)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
