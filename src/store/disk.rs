use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    sync::Arc,
};

use crate::torrent::TorrentMetadata;

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Writes the concatenated pieces out to the torrent's file layout.
///
/// Single-file torrents go straight to `root`; multi-file torrents treat `root`
/// as a directory and split the byte stream at file boundaries.
pub(crate) fn write_pieces(
    meta: &TorrentMetadata,
    root: &Path,
    pieces: &[Arc<[u8]>],
) -> io::Result<()> {
    if !meta.is_multi_file() {
        create_parent(root)?;
        let mut out = BufWriter::new(File::create(root)?);
        for piece in pieces {
            out.write_all(piece)?;
        }
        return out.flush();
    }

    fs::create_dir_all(root)?;
    let (mut piece_idx, mut offset) = (0usize, 0usize);
    for entry in &meta.files {
        let path = root.join(&entry.path);
        create_parent(&path)?;
        let mut out = BufWriter::new(File::create(&path)?);

        let mut remaining = entry.length as usize;
        while remaining > 0 {
            let piece = pieces.get(piece_idx).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pieces end before the file layout does",
                )
            })?;
            let available = &piece[offset..];
            let n = available.len().min(remaining);
            out.write_all(&available[..n])?;
            remaining -= n;
            offset += n;
            if offset == piece.len() {
                piece_idx += 1;
                offset = 0;
            }
        }
        out.flush()?;
    }
    Ok(())
}

/// Reads an existing single file piece by piece. Errors if it is shorter than the layout.
pub(crate) fn read_pieces(meta: &TorrentMetadata, path: &Path) -> io::Result<Vec<Vec<u8>>> {
    let mut file = BufReader::new(File::open(path)?);
    (0..meta.piece_count())
        .map(|index| {
            let mut buf = vec![0u8; meta.piece_len(index) as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .collect()
}
