//! Content digests used as the deduplication key.
//!
//! Input is consumed in fixed 4 KiB chunks so memory stays flat whatever the
//! file size. The digest is lowercase hex SHA-256.

use sha2::{Digest, Sha256};
use std::{io, path::Path};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt},
};

/// Bytes read from the source per iteration.
pub const CHUNK_SIZE: usize = 4096;

/// Hash everything `reader` yields until EOF.
///
/// I/O errors from the reader are returned unchanged.
pub async fn hash_reader<R>(mut reader: R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the contents of a local file.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path).await?;
    hash_reader(file).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_vectors() {
        assert_eq!(
            hash_reader(&b""[..]).await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_reader(&b"abc"[..]).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn chunked_digest_matches_one_shot() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let expected = hex::encode(Sha256::digest(&data));

        assert_eq!(hash_reader(&data[..]).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn file_digest_matches_reader_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"same bytes").await.unwrap();

        assert_eq!(
            hash_file(&path).await.unwrap(),
            hash_reader(&b"same bytes"[..]).await.unwrap()
        );
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = hash_file(Path::new("/definitely/not/here.bin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
