use std::{fs, path::Path, path::PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode_parser::{DecodeError, Value, parse_one, raw_dict_value};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bencode(#[from] DecodeError),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{0}'")]
    InvalidField(&'static str),

    #[error("piece hash blob length {0} is not a multiple of 20")]
    HashBlobLength(usize),

    #[error("torrent lists no files")]
    NoFiles,

    #[error("{hashes} piece hashes do not cover {length} bytes in {piece_length}-byte pieces")]
    PieceCountMismatch {
        hashes: usize,
        length: u64,
        piece_length: u64,
    },
}

/// One file of the download, relative to the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable description of a torrent, shared by every session.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u64,
    pub total_length: u64,
    pub name: String,
    /// A single entry for single-file torrents.
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    /// Builds single-file metadata and checks the piece layout invariants.
    pub fn single_file(
        announce: impl Into<String>,
        info_hash: [u8; 20],
        name: impl Into<String>,
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, TorrentError> {
        let name = name.into();
        let files = vec![FileEntry {
            path: PathBuf::from(&name),
            length: total_length,
        }];
        let meta = Self {
            announce: announce.into(),
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            name,
            files,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; the last piece may be shorter.
    pub fn piece_len(&self, index: usize) -> u64 {
        let count = self.piece_count() as u64;
        if count == 0 || index as u64 >= count {
            return 0;
        }
        if index as u64 == count - 1 {
            self.total_length - (count - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    fn validate(&self) -> Result<(), TorrentError> {
        if self.files.is_empty() {
            return Err(TorrentError::NoFiles);
        }
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidField("piece length"));
        }
        let expected = self.total_length.div_ceil(self.piece_length);
        if expected != self.piece_hashes.len() as u64 {
            return Err(TorrentError::PieceCountMismatch {
                hashes: self.piece_hashes.len(),
                length: self.total_length,
                piece_length: self.piece_length,
            });
        }
        Ok(())
    }
}

fn get_string(dict: &Value, key: &'static str) -> Result<String, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or(TorrentError::InvalidField(key))
}

fn get_u64(dict: &Value, key: &'static str) -> Result<u64, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(TorrentError::InvalidField(key))
}

fn parse_files(info: &Value) -> Result<Vec<FileEntry>, TorrentError> {
    let list = info
        .get(b"files")
        .and_then(Value::as_list)
        .ok_or(TorrentError::InvalidField("files"))?;

    let mut files = Vec::with_capacity(list.len());
    for entry in list {
        let length = get_u64(entry, "length")?;
        let segments = entry
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or(TorrentError::MissingField("path"))?;

        let mut path = PathBuf::new();
        for segment in segments {
            let segment = segment.as_str().ok_or(TorrentError::InvalidField("path"))?;
            // Keep every component inside the destination root.
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\']) {
                return Err(TorrentError::InvalidField("path"));
            }
            path.push(segment);
        }
        if path.as_os_str().is_empty() {
            return Err(TorrentError::InvalidField("path"));
        }
        files.push(FileEntry { path, length });
    }
    Ok(files)
}

/// Parse torrent from file path
pub fn parse_torrent_file(file_path: impl AsRef<Path>) -> Result<TorrentMetadata, TorrentError> {
    let data = fs::read(file_path)?;
    parse_torrent_bytes(&data)
}

/// Parse torrent from byte slice
pub fn parse_torrent_bytes(data: &[u8]) -> Result<TorrentMetadata, TorrentError> {
    let top_level = parse_one(data)?;
    if top_level.as_dict().is_none() {
        return Err(TorrentError::InvalidField("<root>"));
    }

    let announce = get_string(&top_level, "announce")?;
    let info = top_level
        .get(b"info")
        .filter(|v| v.as_dict().is_some())
        .ok_or(TorrentError::MissingField("info"))?;

    let raw_info = raw_dict_value(data, b"info")?.ok_or(TorrentError::MissingField("info"))?;
    let info_hash: [u8; 20] = Sha1::digest(raw_info).into();
    let name = get_string(info, "name")?;
    let piece_length = get_u64(info, "piece length")?;

    let pieces_bytes = info
        .get(b"pieces")
        .ok_or(TorrentError::MissingField("pieces"))?
        .as_bytes()
        .ok_or(TorrentError::InvalidField("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::HashBlobLength(pieces_bytes.len()));
    }
    let piece_hashes: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let files = if info.get(b"length").is_some() {
        vec![FileEntry {
            path: PathBuf::from(&name),
            length: get_u64(info, "length")?,
        }]
    } else {
        parse_files(info)?
    };
    let total_length = files.iter().map(|f| f.length).sum();

    let meta = TorrentMetadata {
        announce,
        info_hash,
        piece_hashes,
        piece_length,
        total_length,
        name,
        files,
    };
    meta.validate()?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn single_file_torrent(pieces: usize, length: i64) -> Value {
        dict(vec![
            ("announce", bytes("http://tracker.example.com:6969/announce")),
            (
                "info",
                dict(vec![
                    ("length", Value::Integer(length)),
                    ("name", bytes("file.bin")),
                    ("piece length", Value::Integer(16384)),
                    ("pieces", Value::Bytes(vec![7u8; 20 * pieces])),
                ]),
            ),
        ])
    }

    #[test]
    fn test_parse_single_file() {
        let torrent = single_file_torrent(2, 20000);
        let meta = parse_torrent_bytes(&torrent.encode()).unwrap();

        assert_eq!(meta.announce, "http://tracker.example.com:6969/announce");
        assert_eq!(meta.name, "file.bin");
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.total_length, 20000);
        assert_eq!(meta.piece_len(0), 16384);
        assert_eq!(meta.piece_len(1), 3616);
        assert_eq!(meta.piece_len(2), 0);
        assert!(!meta.is_multi_file());

        let info = torrent.get(b"info").unwrap();
        let expected: [u8; 20] = Sha1::digest(info.encode()).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        // keys deliberately out of canonical order
        let mut info = b"d4:name1:a12:piece lengthi4e6:lengthi4e6:pieces20:".to_vec();
        info.extend_from_slice(&[3u8; 20]);
        info.push(b'e');
        let mut data = b"d8:announce19:http://tracker.test4:info".to_vec();
        data.extend_from_slice(&info);
        data.push(b'e');

        let meta = parse_torrent_bytes(&data).unwrap();
        let expected: [u8; 20] = Sha1::digest(&info).into();
        assert_eq!(meta.info_hash, expected);
        assert_ne!(meta.info_hash, <[u8; 20]>::from(Sha1::digest(parse_one(&info).unwrap().encode())));
        assert_eq!(meta.total_length, 4);
    }

    #[test]
    fn test_parse_multi_file() {
        let files = Value::List(vec![
            dict(vec![
                ("length", Value::Integer(10000)),
                ("path", Value::List(vec![bytes("docs"), bytes("a.txt")])),
            ]),
            dict(vec![
                ("length", Value::Integer(6384)),
                ("path", Value::List(vec![bytes("b.txt")])),
            ]),
        ]);
        let torrent = dict(vec![
            ("announce", bytes("http://t/announce")),
            (
                "info",
                dict(vec![
                    ("files", files),
                    ("name", bytes("bundle")),
                    ("piece length", Value::Integer(16384)),
                    ("pieces", Value::Bytes(vec![1u8; 20])),
                ]),
            ),
        ]);

        let meta = parse_torrent_bytes(&torrent.encode()).unwrap();
        assert!(meta.is_multi_file());
        assert_eq!(meta.total_length, 16384);
        assert_eq!(meta.files[0].path, PathBuf::from("docs").join("a.txt"));
        assert_eq!(meta.files[1].length, 6384);
    }

    #[test]
    fn test_reject_bad_hash_blob() {
        let mut torrent = single_file_torrent(1, 100);
        if let Value::Dictionary(root) = &mut torrent {
            if let Some(Value::Dictionary(info)) = root.get_mut(b"info".as_slice()) {
                info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 21]));
            }
        }
        assert_matches!(
            parse_torrent_bytes(&torrent.encode()),
            Err(TorrentError::HashBlobLength(21))
        );
    }

    #[test]
    fn test_reject_piece_count_mismatch() {
        let torrent = single_file_torrent(3, 20000);
        assert_matches!(
            parse_torrent_bytes(&torrent.encode()),
            Err(TorrentError::PieceCountMismatch { hashes: 3, .. })
        );
    }

    #[test]
    fn test_reject_missing_announce() {
        let torrent = dict(vec![("info", dict(vec![]))]);
        assert_matches!(
            parse_torrent_bytes(&torrent.encode()),
            Err(TorrentError::MissingField("announce"))
        );
    }

    #[test]
    fn test_reject_path_traversal() {
        let torrent = dict(vec![
            ("announce", bytes("http://t/announce")),
            (
                "info",
                dict(vec![
                    (
                        "files",
                        Value::List(vec![dict(vec![
                            ("length", Value::Integer(1)),
                            ("path", Value::List(vec![bytes(".."), bytes("x")])),
                        ])]),
                    ),
                    ("name", bytes("bundle")),
                    ("piece length", Value::Integer(16384)),
                    ("pieces", Value::Bytes(vec![1u8; 20])),
                ]),
            ),
        ]);
        assert_matches!(
            parse_torrent_bytes(&torrent.encode()),
            Err(TorrentError::InvalidField("path"))
        );
    }

    #[test]
    fn test_single_file_constructor_validates() {
        assert_matches!(
            TorrentMetadata::single_file("http://t", [0; 20], "f", 16384, 32768, vec![[0; 20]]),
            Err(TorrentError::PieceCountMismatch { .. })
        );
        let meta =
            TorrentMetadata::single_file("http://t", [0; 20], "f", 16384, 32768, vec![[0; 20]; 2])
                .unwrap();
        assert_eq!(meta.piece_len(1), 16384);
    }
}
