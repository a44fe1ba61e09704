//! ## About
//! This crate provides a streaming reader and writer for Unix tar archives,
//! covering the historical V7 layout and its principal extensions: USTAR
//! (POSIX.1-1988), PAX (POSIX.1-2001) and GNU. STAR headers produced by
//! Schily's tar are decoded as well.
//!
//! The writer picks the most portable format each entry allows, emitting PAX
//! extended records or GNU long-name entries when a field outgrows the
//! classic header. The reader folds those meta entries back into one logical
//! [`Header`] per member and presents sparse members as their full,
//! zero-filled logical byte stream.
//!
//! ## Writing an archive
//! ```
//! use std::io::Write;
//! use tarstream::{Header, TarWriter};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut writer = TarWriter::new(Vec::new());
//! let mut header = Header::default();
//! header.name = "greeting.txt".to_string();
//! header.size = 5;
//! header.mode = 0o644;
//! writer.write_header(&header)?;
//! writer.write_all(b"hello")?;
//! let bytes = writer.into_inner()?;
//! assert_eq!(bytes.len() % 512, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Reading it back
//! ```
//! # use std::io::{Cursor, Read, Write};
//! # use tarstream::{Header, TarReader, TarWriter};
//! # fn main() -> anyhow::Result<()> {
//! # let mut writer = TarWriter::new(Vec::new());
//! # let mut header = Header::default();
//! # header.name = "greeting.txt".to_string();
//! # header.size = 5;
//! # writer.write_header(&header)?;
//! # writer.write_all(b"hello")?;
//! # let bytes = writer.into_inner()?;
//! let mut reader = TarReader::new(Cursor::new(bytes));
//! while let Some(entry) = reader.next_entry()? {
//!     let mut payload = Vec::new();
//!     reader.read_to_end(&mut payload)?;
//!     assert_eq!(entry.name, "greeting.txt");
//!     assert_eq!(payload, b"hello");
//! }
//! # Ok(())
//! # }
//! ```

pub mod header;
pub mod reader;
pub mod sparse;
pub mod writer;

pub use crate::header::block::BLOCK_SIZE;
pub use crate::header::{Format, Header, Time, TypeFlag};
pub use crate::reader::TarReader;
pub use crate::sparse::SparseEntry;
pub use crate::writer::TarWriter;

/// A `tarstream`-related error.
///
/// Archive-level operations return [`anyhow::Result`], carrying one of these
/// kinds when the failure is the archive's fault rather than the transport's.
/// The `std::io::Read`/`std::io::Write` impls wrap them in `std::io::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TarError {
    /// The header block or a meta entry violates the wire format.
    #[error("invalid tar header: {0}")]
    InvalidHeader(&'static str),
    /// A field does not fit the format selected for the entry.
    #[error("tar header field too long")]
    FieldTooLong,
    /// More payload bytes were written than the header announced.
    #[error("write beyond the entry's declared size")]
    WriteTooLong,
    /// The archive was already finished with its trailer.
    #[error("write on a closed tar archive")]
    WriteAfterClose,
    /// A sparse map references data the archive does not contain.
    #[error("sparse entry references non-existent data")]
    MissingData,
    /// The archive contains data the sparse map never references.
    #[error("sparse file carries unreferenced data")]
    UnreferencedData,
}
