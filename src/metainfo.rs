use crate::Sha1Hash;
use serde_bencode::Error;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in the torrent, derived from the length of the
    /// concatenated piece hash string.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated piece hash string into individual 20 byte
    /// SHA-1 digests, one per piece, in piece order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
    /// BEP 47 file attribute string. A `p` character marks the file as a
    /// padding file, which exists only to align the following file to a
    /// piece boundary and is never written to disk nor projected into a
    /// piece priority above `0`.
    pub attr: Option<String>,
    /// The SHA-1 hash of this specific file, when the torrent carries
    /// per-file hashes (BEP 47). Unused by piece verification, which always
    /// operates on whole pieces.
    #[serde(default)]
    pub sha1: Option<ByteBuf>,
}

impl File {
    /// Returns true if this file's `attr` string contains the padding
    /// marker `p`.
    pub fn is_padding(&self) -> bool {
        self.attr
            .as_ref()
            .map(|attr| attr.contains('p'))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_file_attr() {
        let padding = File {
            path: vec![".pad".to_string(), "1234".to_string()],
            length: 1234,
            attr: Some("p".to_string()),
            sha1: None,
        };
        assert!(padding.is_padding());

        let regular = File {
            path: vec!["movie.mkv".to_string()],
            length: 1 << 30,
            attr: None,
            sha1: None,
        };
        assert!(!regular.is_padding());
    }

    #[test]
    fn test_piece_count() {
        let info = Info {
            name: "test".to_string(),
            pieces: vec![0u8; 20 * 3],
            piece_length: 16384,
            length: Some(16384 * 2 + 100),
            files: None,
            private: None,
        };
        let metainfo = Metainfo { info };
        assert_eq!(metainfo.piece_count(), 3);
    }

    #[test]
    fn test_piece_hashes_splits_concatenated_string() {
        let mut pieces = vec![1u8; 20];
        pieces.extend(vec![2u8; 20]);
        let info = Info {
            name: "test".to_string(),
            pieces,
            piece_length: 16384,
            length: Some(16384 * 2),
            files: None,
            private: None,
        };
        let metainfo = Metainfo { info };
        let hashes = metainfo.piece_hashes();
        assert_eq!(hashes, vec![[1u8; 20], [2u8; 20]]);
    }
}
