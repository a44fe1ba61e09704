use std::io::{Cursor, Read, Write};

use tarstream::{Format, Header, TarError, TarReader, TarWriter, Time, TypeFlag, BLOCK_SIZE};

/// Writes `(header, payload)` pairs into an in-memory archive.
fn build_archive(entries: &[(Header, &[u8])]) -> Vec<u8> {
    let mut writer = TarWriter::new(Vec::new());
    for (header, payload) in entries {
        writer.write_header(header).unwrap();
        writer.write_all(payload).unwrap();
    }
    writer.into_inner().unwrap()
}

/// Reads every entry of an archive back as `(header, payload)` pairs.
fn read_archive(bytes: Vec<u8>) -> Vec<(Header, Vec<u8>)> {
    let mut reader = TarReader::new(Cursor::new(bytes));
    let mut entries = Vec::new();
    while let Some(header) = reader.next_entry().unwrap() {
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).unwrap();
        entries.push((header, payload));
    }
    entries
}

fn file_header(name: &str, size: i64, mode: i64) -> Header {
    Header {
        name: name.to_string(),
        size,
        mode,
        mod_time: Time::from_unix(1_254_699_560, 0),
        ..Header::default()
    }
}

#[test]
fn three_file_archive_round_trips() {
    let files: &[(&str, &[u8])] = &[
        ("readme.txt", b"This archive contains some text files."),
        ("minerals.txt", b"Mineral names:\nalunite\nchromium\nvlasovite"),
        ("todo.txt", b"Get crystal mining license."),
    ];
    let entries: Vec<(Header, &[u8])> = files
        .iter()
        .map(|&(name, data)| (file_header(name, data.len() as i64, 0o600), data))
        .collect();
    let bytes = build_archive(&entries);
    let got = read_archive(bytes);

    assert_eq!(got.len(), files.len());
    for ((header, payload), &(name, data)) in got.iter().zip(files) {
        assert_eq!(header.name, name);
        assert_eq!(header.mode, 0o600);
        assert_eq!(header.size, data.len() as i64);
        assert_eq!(header.flag, TypeFlag::Reg);
        assert_eq!(payload, data);
    }
}

#[test]
fn long_name_forces_pax() {
    let name = "ab".repeat(100);
    let bytes = build_archive(&[(file_header(&name, 5, 0o644), b"     ")]);

    let text = String::from_utf8_lossy(&bytes).into_owned();
    assert!(text.contains("PaxHeaders.0"), "no PAX meta entry in archive");

    let got = read_archive(bytes);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.format, Format::PAX);
    assert_eq!(got[0].1, b"     ");
}

#[test]
fn dot_prefixed_long_name_gets_a_clean_meta_entry() {
    let name = format!("./{}", "a".repeat(200));
    let bytes = build_archive(&[(file_header(&name, 0, 0o644), b"")]);
    // The meta entry's own name leads the archive and must not keep the "./".
    assert!(bytes.starts_with(b"PaxHeaders.0/a"));

    let got = read_archive(bytes);
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn long_directory_name_meta_entry_keeps_its_basename() {
    let name = format!("{}/", "d".repeat(200));
    let mut header = file_header(&name, 0, 0o755);
    header.flag = TypeFlag::Dir;
    let bytes = build_archive(&[(header, b"")]);
    assert!(bytes.starts_with(b"PaxHeaders.0/d"));

    let got = read_archive(bytes);
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.flag, TypeFlag::Dir);
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn xattrs_round_trip() {
    let mut header = file_header("kilt.txt", 5, 0o644);
    header
        .xattr
        .insert("user.key".to_string(), "value".to_string());
    let got = read_archive(build_archive(&[(header, b"Kilts")]));

    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0.xattr.get("user.key").unwrap(), "value");
    assert_eq!(got[0].1, b"Kilts");
}

#[test]
fn pax_records_appear_in_lexicographic_order() {
    let mut header = file_header("ordered", 0, 0o644);
    for key in ["foo", "bar", "baz", "qux"] {
        header.xattr.insert(key.to_string(), key.to_string());
    }
    let bytes = build_archive(&[(header, b"")]);
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let positions: Vec<usize> = ["bar=bar", "baz=baz", "foo=foo", "qux=qux"]
        .iter()
        .map(|needle| text.find(needle).expect("missing record"))
        .collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "records out of order: {positions:?}"
    );
}

#[test]
fn writer_enforces_the_payload_budget() {
    let mut writer = TarWriter::new(Vec::new());
    let mut dir = file_header("dir/", 0, 0o755);
    dir.flag = TypeFlag::Dir;
    writer.write_header(&dir).unwrap();
    let err = writer.write(b"x").unwrap_err();
    let kind = err.get_ref().and_then(|e| e.downcast_ref::<TarError>());
    assert_eq!(kind, Some(&TarError::WriteTooLong));

    let mut writer = TarWriter::new(Vec::new());
    writer
        .write_header(&file_header("short.txt", 5, 0o644))
        .unwrap();
    assert!(writer.close().is_err());
}

#[test]
fn empty_archive_yields_no_entries() {
    let mut writer = TarWriter::new(Vec::new());
    writer.close().unwrap();
    let bytes = writer.into_inner().unwrap();
    assert_eq!(bytes.len(), 2 * BLOCK_SIZE);

    let mut reader = TarReader::new(Cursor::new(bytes));
    assert!(reader.next_entry().unwrap().is_none());
}

#[test]
fn hundred_byte_name_needs_no_meta_entry() {
    let name = "a".repeat(100);
    let bytes = build_archive(&[(file_header(&name, 0, 0o644), b"")]);
    // One header block plus the trailer: no PAX or GNU meta entry.
    assert_eq!(bytes.len(), 3 * BLOCK_SIZE);
    let got = read_archive(bytes);
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.format, Format::USTAR);
}

#[test]
fn splittable_101_byte_name_still_fits_ustar() {
    let name = format!("{}/{}", "d".repeat(40), "f".repeat(60));
    let bytes = build_archive(&[(file_header(&name, 0, 0o644), b"")]);
    assert_eq!(bytes.len(), 3 * BLOCK_SIZE);
    let got = read_archive(bytes);
    // The prefix and suffix are rejoined on read.
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.format, Format::USTAR);
}

#[test]
fn unsplittable_101_byte_name_goes_pax() {
    let name = "a".repeat(101);
    let bytes = build_archive(&[(file_header(&name, 0, 0o644), b"")]);
    let got = read_archive(bytes);
    assert_eq!(got[0].0.name, name);
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn access_time_is_dropped_without_an_explicit_format() {
    let mut header = file_header("atime.txt", 0, 0o644);
    header.access_time = Time::from_unix(1_254_699_561, 0);
    let bytes = build_archive(&[(header, b"")]);
    // The writer zeroed the access time, so USTAR remained possible.
    assert_eq!(bytes.len(), 3 * BLOCK_SIZE);
    let got = read_archive(bytes);
    assert!(got[0].0.access_time.is_zero());
    assert_eq!(got[0].0.format, Format::USTAR);
}

#[test]
fn access_time_survives_under_pax() {
    let mut header = file_header("atime.txt", 0, 0o644);
    header.access_time = Time::from_unix(1_254_699_561, 0);
    header.format = Format::PAX;
    let got = read_archive(build_archive(&[(header, b"")]));
    assert_eq!(got[0].0.access_time, Time::from_unix(1_254_699_561, 0));
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn access_time_survives_under_gnu() {
    let mut header = file_header("atime.bin", 0, 0o644);
    header.access_time = Time::from_unix(1_254_699_561, 0);
    header.change_time = Time::from_unix(1_254_699_562, 0);
    header.format = Format::GNU;
    let got = read_archive(build_archive(&[(header, b"")]));
    assert_eq!(got[0].0.access_time, Time::from_unix(1_254_699_561, 0));
    assert_eq!(got[0].0.change_time, Time::from_unix(1_254_699_562, 0));
    assert_eq!(got[0].0.format, Format::GNU);
}

#[test]
fn subsecond_mtime_forces_pax_and_survives() {
    let mut header = file_header("precise.txt", 0, 0o644);
    header.mod_time = Time::from_unix(1_254_699_560, 123_456_789);
    let got = read_archive(build_archive(&[(header, b"")]));
    assert_eq!(got[0].0.mod_time, Time::from_unix(1_254_699_560, 123_456_789));
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn links_and_special_files_round_trip() {
    let mut symlink = file_header("current", 0, 0o777);
    symlink.flag = TypeFlag::Symlink;
    symlink.link_name = "release-1.2.3".to_string();

    let mut hardlink = file_header("copy.txt", 0, 0o644);
    hardlink.flag = TypeFlag::Link;
    hardlink.link_name = "original.txt".to_string();

    let mut device = file_header("null", 0, 0o666);
    device.flag = TypeFlag::Char;
    device.dev_major = 1;
    device.dev_minor = 3;

    let mut fifo = file_header("pipe", 0, 0o600);
    fifo.flag = TypeFlag::Fifo;

    let got = read_archive(build_archive(&[
        (symlink.clone(), b""),
        (hardlink.clone(), b""),
        (device.clone(), b""),
        (fifo.clone(), b""),
    ]));
    assert_eq!(got.len(), 4);
    assert_eq!(got[0].0.flag, TypeFlag::Symlink);
    assert_eq!(got[0].0.link_name, symlink.link_name);
    assert_eq!(got[1].0.flag, TypeFlag::Link);
    assert_eq!(got[1].0.link_name, hardlink.link_name);
    assert_eq!(got[2].0.flag, TypeFlag::Char);
    assert_eq!(got[2].0.dev_major, 1);
    assert_eq!(got[2].0.dev_minor, 3);
    assert_eq!(got[3].0.flag, TypeFlag::Fifo);
}

#[test]
fn owner_names_round_trip() {
    let mut header = file_header("owned.txt", 0, 0o644);
    header.uid = 1042;
    header.gid = 2042;
    header.uname = "miner".to_string();
    header.gname = "geology".to_string();
    let got = read_archive(build_archive(&[(header.clone(), b"")]));
    assert_eq!(got[0].0.uid, header.uid);
    assert_eq!(got[0].0.gid, header.gid);
    assert_eq!(got[0].0.uname, header.uname);
    assert_eq!(got[0].0.gname, header.gname);
}

#[test]
fn large_uid_round_trips_through_pax() {
    let mut header = file_header("bigid.txt", 0, 0o644);
    header.uid = 0o10000000; // Too wide for the 8-byte octal field
    let got = read_archive(build_archive(&[(header.clone(), b"")]));
    assert_eq!(got[0].0.uid, header.uid);
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn long_link_name_round_trips_through_gnu() {
    let mut header = file_header("shortcut", 0, 0o777);
    header.flag = TypeFlag::Symlink;
    header.link_name = format!("targets/{}", "t".repeat(120));
    header.format = Format::GNU;
    let got = read_archive(build_archive(&[(header.clone(), b"")]));
    assert_eq!(got[0].0.link_name, header.link_name);
    assert_eq!(got[0].0.format, Format::GNU);
}

#[test]
fn non_ascii_name_round_trips_through_pax() {
    let header = file_header("durée.txt", 0, 0o644);
    let got = read_archive(build_archive(&[(header.clone(), b"")]));
    assert_eq!(got[0].0.name, "durée.txt");
    assert_eq!(got[0].0.format, Format::PAX);
}

#[test]
fn global_header_round_trips() {
    let mut global = Header::new(TypeFlag::XGlobalHeader);
    global
        .pax_records
        .insert("comment".to_string(), "set by the archiver".to_string());
    let file = file_header("after.txt", 2, 0o644);

    let got = read_archive(build_archive(&[(global, b""), (file, b"hi")]));
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].0.flag, TypeFlag::XGlobalHeader);
    assert_eq!(
        got[0].0.pax_records.get("comment").unwrap(),
        "set by the archiver"
    );
    assert_eq!(got[1].0.name, "after.txt");
    assert_eq!(got[1].1, b"hi");
}

#[test]
fn payload_not_fully_read_does_not_break_iteration() {
    let entries: [(Header, &[u8]); 2] = [
        (file_header("big.bin", 1000, 0o644), &[0x5au8; 1000]),
        (file_header("next.txt", 4, 0o644), b"done"),
    ];
    let bytes = build_archive(&entries);
    let mut reader = TarReader::new(Cursor::new(bytes));

    let first = reader.next_entry().unwrap().unwrap();
    assert_eq!(first.name, "big.bin");
    // Skip the payload entirely and move on.
    let second = reader.next_entry().unwrap().unwrap();
    assert_eq!(second.name, "next.txt");
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).unwrap();
    assert_eq!(payload, b"done");
}
