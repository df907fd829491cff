//! Archive builders shared by the update tests

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write a zip with `entries` to `path` and return its checksum
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> String {
    let bytes = zip_bytes(entries);
    std::fs::write(path, &bytes).unwrap();
    sha256_hex(&bytes)
}

/// Zip archive with `entries`, in memory
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// A minimal but realistic bundle archive whose contents mention `tag`
pub fn bundle_zip(tag: &str) -> Vec<u8> {
    let code = format!("__d(function(){{console.log({:?})}});", tag);
    zip_bytes(&[
        ("index.bundle", code.as_bytes()),
        ("assets/", b""),
        ("assets/logo.png", b"\x89PNG fake image"),
    ])
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    let mut file = File::create(path).unwrap();
    file.write_all(bytes).unwrap();
}
