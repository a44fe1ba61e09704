use std::io::{self, Read, Write};

use anyhow::{bail, Result};
use indexmap::IndexMap;

use crate::header::block::{self, block_padding, Block, BLOCK_SIZE, ZERO_BLOCK};
use crate::header::codec::{self, MAX_META_FILE_SIZE};
use crate::header::{Format, Header, Time, TypeFlag};
use crate::sparse::{invert_sparse_entries, validate_sparse_entries, SparseEntry};
use crate::TarError;

/// Streaming tar archive reader.
///
/// `next_entry` yields one logical `Header` per archive member, transparently
/// folding PAX extended records and GNU long-name meta entries into the
/// header that follows them. The member's payload is then available through
/// the `std::io::Read` impl until the next call to `next_entry`.
pub struct TarReader<R: Read> {
    inner: R,
    pad: i64,
    payload: PayloadReader,
    blk: Block,
    started: bool,
    broken: bool,
}

/// Per-entry payload source.
///
/// `Sparse` presents the logical byte stream of a sparse member: bytes inside
/// a hole fragment read as zeros, bytes outside come from the underlying
/// physical stream, whose budget is tracked in `remaining`.
enum PayloadReader {
    Regular {
        remaining: i64,
    },
    Sparse {
        holes: Vec<SparseEntry>,
        cursor: usize,
        pos: i64,
        remaining: i64,
    },
}

impl PayloadReader {
    fn physical_remaining(&self) -> i64 {
        match self {
            PayloadReader::Regular { remaining } => *remaining,
            PayloadReader::Sparse { remaining, .. } => *remaining,
        }
    }
}

impl<R: Read> TarReader<R> {
    pub fn new(inner: R) -> Self {
        TarReader {
            inner,
            pad: 0,
            payload: PayloadReader::Regular { remaining: 0 },
            blk: ZERO_BLOCK,
            started: false,
            broken: false,
        }
    }

    /// Advances to the next logical entry.
    ///
    /// Any unread payload of the current entry is skipped. Meta entries (PAX
    /// extended headers, GNU long names) are consumed and merged into the
    /// following real header; a PAX global header is returned as an entry of
    /// its own.
    ///
    /// # Returns
    /// * `Ok(Some(header))` - The next entry; read its payload through
    ///   `std::io::Read`.
    /// * `Ok(None)` - End of archive.
    /// * `Err(e)` - If the archive is malformed or the transport fails.
    pub fn next_entry(&mut self) -> Result<Option<Header>> {
        if self.broken {
            bail!("tar reader is in an invalid state from a previous error");
        }
        match self.next_inner() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Copies the remainder of the current entry's payload into `w`.
    pub fn copy_payload_to(&mut self, mut w: impl Write) -> Result<u64> {
        Ok(io::copy(&mut *self, &mut w)?)
    }

    /// Hands back the transport, positioned wherever reading stopped.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn next_inner(&mut self) -> Result<Option<Header>> {
        let mut pax_records: IndexMap<String, String> = IndexMap::new();
        let mut gnu_long_name = String::new();
        let mut gnu_long_link = String::new();
        let mut format = Format::ANY;

        loop {
            self.discard_current()?;
            let mut hdr = match self.read_header()? {
                Some(h) => h,
                None => return Ok(None),
            };
            self.install_regular(&hdr)?;
            format.may_only_be(hdr.format);

            match hdr.flag {
                TypeFlag::XHeader => {
                    format.may_only_be(Format::PAX);
                    let records = self.parse_pax_body()?;
                    // Merge into the accumulator; a later record wins.
                    pax_records.extend(records);
                }
                TypeFlag::XGlobalHeader => {
                    format.may_only_be(Format::PAX);
                    let records = self.parse_pax_body()?;
                    merge_pax(&mut hdr, &records)?;
                    return Ok(Some(Header {
                        name: hdr.name,
                        flag: hdr.flag,
                        xattr: hdr.xattr,
                        pax_records: hdr.pax_records,
                        format,
                        ..Header::default()
                    }));
                }
                TypeFlag::GnuLongName => {
                    format.may_only_be(Format::GNU);
                    let body = self.read_meta_file()?;
                    gnu_long_name = codec::parse_string(&body)?;
                }
                TypeFlag::GnuLongLink => {
                    format.may_only_be(Format::GNU);
                    let body = self.read_meta_file()?;
                    gnu_long_link = codec::parse_string(&body)?;
                }
                _ => {
                    merge_pax(&mut hdr, &pax_records)?;
                    if !gnu_long_name.is_empty() {
                        hdr.name = gnu_long_name;
                    }
                    if !gnu_long_link.is_empty() {
                        hdr.link_name = gnu_long_link;
                    }
                    // Legacy archives suffix directories with a slash.
                    if hdr.flag == TypeFlag::Reg && hdr.name.ends_with('/') {
                        hdr.flag = TypeFlag::Dir;
                    }

                    // The extended records may have changed the size, so arm
                    // the payload reader again before the sparse overlay.
                    self.install_regular(&hdr)?;
                    self.install_sparse(&mut hdr, &mut format)?;

                    if format.has(Format::USTAR) && format.has(Format::PAX) {
                        format.may_only_be(Format::USTAR);
                    }
                    hdr.format = format;
                    return Ok(Some(hdr));
                }
            }
        }
    }

    /// Skips whatever is left of the current entry, padding included.
    fn discard_current(&mut self) -> Result<()> {
        let mut n = self.payload.physical_remaining() + self.pad;
        let mut scratch = [0u8; BLOCK_SIZE];
        while n > 0 {
            let take = n.min(BLOCK_SIZE as i64) as usize;
            self.inner.read_exact(&mut scratch[..take])?;
            n -= take as i64;
        }
        self.pad = 0;
        self.payload = PayloadReader::Regular { remaining: 0 };
        Ok(())
    }

    /// Reads and decodes one header block.
    ///
    /// # Returns
    /// * `Ok(Some(header))` - A checksum-valid header.
    /// * `Ok(None)` - End of archive: true end of stream, the two-zero-block
    ///   trailer, or a checksum failure on the very first block (tolerating
    ///   archives padded with stray bytes).
    /// * `Err(e)` - A zero block followed by data, a checksum failure after
    ///   the first header, or a transport failure.
    fn read_header(&mut self) -> Result<Option<Header>> {
        if !read_block_or_eof(&mut self.inner, &mut self.blk)? {
            return Ok(None);
        }
        if self.blk == ZERO_BLOCK {
            if !read_block_or_eof(&mut self.inner, &mut self.blk)? {
                return Ok(None);
            }
            if self.blk == ZERO_BLOCK {
                return Ok(None);
            }
            bail!(TarError::InvalidHeader("zero block followed by data"));
        }

        let format = block::detect_format(&self.blk);
        if format == Format::NONE {
            if !self.started {
                return Ok(None);
            }
            bail!(TarError::InvalidHeader("header checksum mismatch"));
        }
        self.started = true;

        let mut hdr = Header::default();
        hdr.format = format;
        hdr.flag = TypeFlag::from(self.blk[block::V7_TYPEFLAG]);
        hdr.name = codec::parse_string(&self.blk[block::V7_NAME])?;
        hdr.link_name = codec::parse_string(&self.blk[block::V7_LINKNAME])?;
        hdr.size = codec::parse_numeric(&self.blk[block::V7_SIZE])?;
        hdr.mode = codec::parse_numeric(&self.blk[block::V7_MODE])?;
        hdr.uid = codec::parse_numeric(&self.blk[block::V7_UID])? as i32;
        hdr.gid = codec::parse_numeric(&self.blk[block::V7_GID])? as i32;
        hdr.mod_time = Time::from_unix(codec::parse_numeric(&self.blk[block::V7_MTIME])?, 0);

        if format != Format::V7 {
            hdr.uname = codec::parse_string(&self.blk[block::USTAR_UNAME])?;
            hdr.gname = codec::parse_string(&self.blk[block::USTAR_GNAME])?;
            hdr.dev_major = codec::parse_numeric(&self.blk[block::USTAR_DEVMAJOR])?;
            hdr.dev_minor = codec::parse_numeric(&self.blk[block::USTAR_DEVMINOR])?;

            let mut prefix = String::new();
            if format.has(Format::USTAR) || format.has(Format::PAX) {
                prefix = codec::parse_string(&self.blk[block::USTAR_PREFIX])?;

                // The parser is more liberal than what USTAR permits, so the
                // format claim is dropped when the block is not strictly
                // formed. The fields parsed above still stand.
                if self.blk.iter().any(|&b| b >= 0x80) {
                    hdr.format = Format::NONE;
                }
                let nul_ended = |r: std::ops::Range<usize>| self.blk[r].last() == Some(&0);
                if !(nul_ended(block::V7_SIZE)
                    && nul_ended(block::V7_MODE)
                    && nul_ended(block::V7_UID)
                    && nul_ended(block::V7_GID)
                    && nul_ended(block::V7_MTIME)
                    && nul_ended(block::USTAR_DEVMAJOR)
                    && nul_ended(block::USTAR_DEVMINOR))
                {
                    hdr.format = Format::NONE;
                }
            } else if format.has(Format::STAR) {
                prefix = codec::parse_string(&self.blk[block::STAR_PREFIX])?;
                hdr.access_time =
                    Time::from_unix(codec::parse_numeric(&self.blk[block::STAR_ATIME])?, 0);
                hdr.change_time =
                    Time::from_unix(codec::parse_numeric(&self.blk[block::STAR_CTIME])?, 0);
            } else if format.has(Format::GNU) {
                // Some writers leave junk in the GNU time fields; tolerate it
                // and keep the times unset.
                if self.blk[block::GNU_ATIME][0] != 0 {
                    if let Ok(v) = codec::parse_numeric(&self.blk[block::GNU_ATIME]) {
                        hdr.access_time = Time::from_unix(v, 0);
                    }
                }
                if self.blk[block::GNU_CTIME][0] != 0 {
                    if let Ok(v) = codec::parse_numeric(&self.blk[block::GNU_CTIME]) {
                        hdr.change_time = Time::from_unix(v, 0);
                    }
                }
            }
            if !prefix.is_empty() {
                hdr.name = format!("{prefix}/{}", hdr.name);
            }
        }
        Ok(Some(hdr))
    }

    /// Arms the payload reader for `hdr`, treating header-only types as
    /// empty.
    fn install_regular(&mut self, hdr: &Header) -> Result<()> {
        let mut nb = hdr.size;
        if hdr.flag.is_header_only() {
            nb = 0;
        }
        if nb < 0 {
            bail!(TarError::InvalidHeader("negative entry size"));
        }
        self.pad = block_padding(nb);
        self.payload = PayloadReader::Regular { remaining: nb };
        Ok(())
    }

    /// Installs the sparse overlay when `hdr` describes a sparse member, in
    /// any of the three encodings: old-GNU ('S' flag with a map in the header
    /// block), PAX 0.x (map in extended records), or PAX 1.0 (map inline at
    /// the start of the payload).
    fn install_sparse(&mut self, hdr: &mut Header, format: &mut Format) -> Result<()> {
        let spd = if hdr.flag == TypeFlag::GnuSparse {
            Some(self.read_old_gnu_sparse_map(hdr, format)?)
        } else {
            self.read_gnu_sparse_pax(hdr, format)?
        };
        let Some(spd) = spd else { return Ok(()) };

        if hdr.flag.is_header_only() || !validate_sparse_entries(&spd, hdr.size) {
            bail!(TarError::InvalidHeader("invalid sparse map"));
        }
        let holes = invert_sparse_entries(&spd, hdr.size);
        let physical = self.payload.physical_remaining();
        self.payload = PayloadReader::Sparse {
            holes,
            cursor: 0,
            pos: 0,
            remaining: physical,
        };
        Ok(())
    }

    /// Decodes the old-GNU sparse map from the header block and any
    /// continuation blocks, and swaps the header size for the real (logical)
    /// size.
    fn read_old_gnu_sparse_map(
        &mut self,
        hdr: &mut Header,
        format: &mut Format,
    ) -> Result<Vec<SparseEntry>> {
        if block::detect_format(&self.blk) != Format::GNU {
            bail!(TarError::InvalidHeader("sparse flag outside a GNU header"));
        }
        format.may_only_be(Format::GNU);

        hdr.size = codec::parse_numeric(&self.blk[block::GNU_REAL_SIZE])?;
        let mut spd = Vec::new();
        let (mut region, mut max_entries, mut ext_flag) =
            (block::GNU_SPARSE, 4usize, block::GNU_IS_EXTENDED);
        loop {
            let blk_region = &self.blk[region.clone()];
            for i in 0..max_entries {
                let (offset_buf, length_buf) = block::sparse_entry_fields(blk_region, i);
                // The termination condition used by GNU and BSD tar.
                if offset_buf[0] == 0 {
                    break;
                }
                let offset = codec::parse_numeric(offset_buf)?;
                let length = codec::parse_numeric(length_buf)?;
                spd.push(SparseEntry::new(offset, length));
            }
            if self.blk[ext_flag] == 0 {
                return Ok(spd);
            }
            self.inner.read_exact(&mut self.blk)?;
            (region, max_entries, ext_flag) =
                (block::GNU_SPARSE_EXT, 21, block::GNU_SPARSE_EXT_IS_EXTENDED);
        }
    }

    /// Decodes the PAX flavors of the GNU sparse map, if the extended records
    /// say this member has one.
    fn read_gnu_sparse_pax(
        &mut self,
        hdr: &mut Header,
        format: &mut Format,
    ) -> Result<Option<Vec<SparseEntry>>> {
        let major = hdr.pax_records.get(codec::PAX_GNU_SPARSE_MAJOR).map(String::as_str);
        let minor = hdr.pax_records.get(codec::PAX_GNU_SPARSE_MINOR).map(String::as_str);
        let is_1x0 = match (major, minor) {
            (Some("0"), Some("0" | "1")) => false,
            (Some("1"), Some("0")) => true,
            (m, n) if m.is_some() || n.is_some() => return Ok(None), // Unknown version
            _ if hdr.pax_records.contains_key(codec::PAX_GNU_SPARSE_MAP) => {
                false // 0.0 and 0.1 had no version records, so guess
            }
            _ => return Ok(None), // Not sparse
        };
        format.may_only_be(Format::PAX);

        if let Some(name) = hdr.pax_records.get(codec::PAX_GNU_SPARSE_NAME) {
            if !name.is_empty() {
                hdr.name = name.clone();
            }
        }
        let size_record = hdr
            .pax_records
            .get(codec::PAX_GNU_SPARSE_SIZE)
            .or_else(|| hdr.pax_records.get(codec::PAX_GNU_SPARSE_REALSIZE));
        if let Some(v) = size_record {
            hdr.size = codec::parse_decimal(v)?;
        }

        if is_1x0 {
            Ok(Some(self.read_sparse_map_1x0()?))
        } else {
            Ok(Some(read_sparse_map_0x1(&hdr.pax_records)?))
        }
    }

    /// Reads the PAX 1.0 inline sparse map from the start of the payload:
    /// newline-delimited decimals, the entry count first. Tokens are consumed
    /// in whole 512-byte blocks so the payload afterwards starts on a block
    /// boundary.
    fn read_sparse_map_1x0(&mut self) -> Result<Vec<SparseEntry>> {
        fn feed(
            r: &mut impl Read,
            buf: &mut Vec<u8>,
            newlines: &mut i64,
            need: i64,
        ) -> Result<()> {
            while *newlines < need {
                let mut blk = [0u8; BLOCK_SIZE];
                r.read_exact(&mut blk)?;
                *newlines += blk.iter().filter(|&&b| b == b'\n').count() as i64;
                buf.extend_from_slice(&blk);
            }
            Ok(())
        }

        let mut buf = Vec::new();
        let mut newlines = 0i64;
        let mut pos = 0usize;
        let mut next_token = |buf: &Vec<u8>, pos: &mut usize, newlines: &mut i64| -> String {
            *newlines -= 1;
            let start = *pos;
            let end = buf[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(buf.len(), |i| start + i);
            *pos = end + 1;
            String::from_utf8_lossy(&buf[start..end]).into_owned()
        };

        feed(&mut *self, &mut buf, &mut newlines, 1)?;
        let num_entries = codec::parse_decimal(&next_token(&buf, &mut pos, &mut newlines))?;
        if num_entries < 0 || num_entries.checked_mul(2).is_none() {
            bail!(TarError::InvalidHeader("invalid sparse map entry count"));
        }

        feed(&mut *self, &mut buf, &mut newlines, 2 * num_entries)?;
        let mut spd = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let offset = codec::parse_decimal(&next_token(&buf, &mut pos, &mut newlines))?;
            let length = codec::parse_decimal(&next_token(&buf, &mut pos, &mut newlines))?;
            spd.push(SparseEntry::new(offset, length));
        }
        Ok(spd)
    }

    /// Parses the body of a PAX extended header into records. The
    /// order-sensitive 0.0 sparse keys are gathered separately and joined
    /// into a `GNU.sparse.map` record, normalizing that format to 0.1.
    fn parse_pax_body(&mut self) -> Result<IndexMap<String, String>> {
        let body = self.read_meta_file()?;
        let body = match std::str::from_utf8(&body) {
            Ok(s) => s,
            Err(_) => bail!(TarError::InvalidHeader("PAX records are not valid UTF-8")),
        };

        let mut sparse_map: Vec<String> = Vec::new();
        let mut records = IndexMap::new();
        let mut rest = body;
        while !rest.is_empty() {
            let (key, value, rem) = codec::parse_pax_record(rest)?;
            rest = rem;
            match key.as_str() {
                codec::PAX_GNU_SPARSE_OFFSET | codec::PAX_GNU_SPARSE_NUMBYTES => {
                    // Offsets and lengths must alternate, offset first.
                    if (sparse_map.len() % 2 == 0 && key != codec::PAX_GNU_SPARSE_OFFSET)
                        || (sparse_map.len() % 2 == 1 && key != codec::PAX_GNU_SPARSE_NUMBYTES)
                        || value.contains(',')
                    {
                        bail!(TarError::InvalidHeader("malformed sparse map records"));
                    }
                    sparse_map.push(value);
                }
                _ => {
                    records.insert(key, value);
                }
            }
        }
        if !sparse_map.is_empty() {
            records.insert(codec::PAX_GNU_SPARSE_MAP.to_string(), sparse_map.join(","));
        }
        Ok(records)
    }

    /// Reads the whole payload of a meta entry, bounded to keep a hostile
    /// header from ballooning memory.
    fn read_meta_file(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = (&mut *self).take(MAX_META_FILE_SIZE as u64 + 1).read_to_end(&mut buf)?;
        if n > MAX_META_FILE_SIZE {
            bail!(TarError::FieldTooLong);
        }
        Ok(buf)
    }
}

impl<R: Read> Read for TarReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Self { inner, payload, .. } = self;
        match payload {
            PayloadReader::Regular { remaining } => {
                if *remaining <= 0 || buf.is_empty() {
                    return Ok(0);
                }
                let take = (buf.len() as i64).min(*remaining) as usize;
                let n = inner.read(&mut buf[..take])?;
                *remaining -= n as i64;
                if n == 0 && *remaining > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated tar entry payload",
                    ));
                }
                Ok(n)
            }
            PayloadReader::Sparse {
                holes,
                cursor,
                pos,
                remaining,
            } => {
                let logical_end = holes.last().map_or(*pos, |h| h.end_offset());
                let want = (buf.len() as i64).min(logical_end - *pos) as usize;
                let mut filled = 0usize;
                while filled < want {
                    let hole = holes[*cursor];
                    let left = want - filled;
                    let nf = if *pos < hole.offset {
                        // Inside a data fragment: bytes come from the archive.
                        let take = (left as i64).min(hole.offset - *pos) as usize;
                        if (take as i64) > *remaining {
                            return Err(io::Error::other(TarError::MissingData));
                        }
                        inner.read_exact(&mut buf[filled..filled + take]).map_err(|e| {
                            if e.kind() == io::ErrorKind::UnexpectedEof {
                                io::Error::other(TarError::MissingData)
                            } else {
                                e
                            }
                        })?;
                        *remaining -= take as i64;
                        take
                    } else {
                        // Inside a hole fragment: the bytes read as zeros.
                        let take = (left as i64).min(hole.end_offset() - *pos) as usize;
                        buf[filled..filled + take].fill(0);
                        take
                    };
                    filled += nf;
                    *pos += nf as i64;
                    if *pos >= hole.end_offset() && *cursor + 1 < holes.len() {
                        *cursor += 1;
                    }
                }
                if logical_end == *pos && *remaining > 0 {
                    return Err(io::Error::other(TarError::UnreferencedData));
                }
                Ok(filled)
            }
        }
    }
}

/// Folds PAX records into the header fields they override. An empty value
/// keeps the value from the USTAR portion. The full record set, sparse keys
/// included, is retained on the header.
pub(crate) fn merge_pax(hdr: &mut Header, records: &IndexMap<String, String>) -> Result<()> {
    for (k, v) in records {
        if v.is_empty() {
            continue;
        }
        match k.as_str() {
            codec::PAX_PATH => hdr.name = v.clone(),
            codec::PAX_LINKPATH => hdr.link_name = v.clone(),
            codec::PAX_UNAME => hdr.uname = v.clone(),
            codec::PAX_GNAME => hdr.gname = v.clone(),
            codec::PAX_UID => hdr.uid = codec::parse_decimal(v)? as i32,
            codec::PAX_GID => hdr.gid = codec::parse_decimal(v)? as i32,
            codec::PAX_ATIME => hdr.access_time = codec::parse_pax_time(v)?,
            codec::PAX_MTIME => hdr.mod_time = codec::parse_pax_time(v)?,
            codec::PAX_CTIME => hdr.change_time = codec::parse_pax_time(v)?,
            codec::PAX_SIZE => hdr.size = codec::parse_decimal(v)?,
            _ => {
                if let Some(name) = k.strip_prefix(codec::PAX_SCHILY_XATTR) {
                    hdr.xattr.insert(name.to_string(), v.clone());
                }
            }
        }
    }
    if !records.is_empty() {
        hdr.pax_records = records.clone();
    }
    Ok(())
}

/// Decodes the PAX 0.1 sparse map: `GNU.sparse.numblocks` entries as
/// comma-separated decimals in `GNU.sparse.map`.
fn read_sparse_map_0x1(records: &IndexMap<String, String>) -> Result<Vec<SparseEntry>> {
    let num_entries = records
        .get(codec::PAX_GNU_SPARSE_NUMBLOCKS)
        .map(|v| codec::parse_decimal(v))
        .transpose()?
        .unwrap_or(-1);
    if num_entries < 0 || num_entries.checked_mul(2).is_none() {
        bail!(TarError::InvalidHeader("invalid sparse map entry count"));
    }

    let map = records
        .get(codec::PAX_GNU_SPARSE_MAP)
        .map(String::as_str)
        .unwrap_or("");
    let mut tokens: Vec<&str> = map.split(',').collect();
    if tokens.len() == 1 && tokens[0].is_empty() {
        tokens.clear();
    }
    if tokens.len() as i64 != 2 * num_entries {
        bail!(TarError::InvalidHeader("sparse map does not match its entry count"));
    }

    let mut spd = Vec::with_capacity(num_entries as usize);
    for pair in tokens.chunks(2) {
        let offset = codec::parse_decimal(pair[0])?;
        let length = codec::parse_decimal(pair[1])?;
        spd.push(SparseEntry::new(offset, length));
    }
    Ok(spd)
}

/// Reads one full block, distinguishing a clean end of stream (`Ok(false)`)
/// from a block truncated mid-way (an error).
fn read_block_or_eof(r: &mut impl Read, blk: &mut Block) -> io::Result<bool> {
    let mut n = 0;
    while n < BLOCK_SIZE {
        match r.read(&mut blk[n..]) {
            Ok(0) if n == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated tar header block",
                ))
            }
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
