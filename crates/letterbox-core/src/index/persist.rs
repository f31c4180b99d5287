//! On-disk format for the vector index.
//!
//! Two companion files live in the index directory and are only ever read
//! or written together:
//!
//! | File | Content |
//! |------|---------|
//! | `index.bin` | search structure: vectors plus optional clusters |
//! | `documents.json` | build metadata and the parallel document list |
//!
//! `index.bin` layout (little-endian):
//!
//! ```text
//! "LBXI" | version u32 | stamp i64 | kind u8 | dim u32 | count u64 | count×dim f32
//! kind = 1 only:
//!   nlist u32 | nprobe u32 | nlist×dim f32 | nlist × (len u32 | len × u32)
//! ```
//!
//! `stamp` is the build time in unix milliseconds and must equal
//! `documents.json`'s `built_at`, as must the two dimensions. Both files are
//! written to temporary names and renamed into place; a crash between the
//! renames leaves a pair whose stamps disagree, which reads as corruption.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Ann, Clusters};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::Document;

pub const INDEX_FILE: &str = "index.bin";
pub const DOCUMENTS_FILE: &str = "documents.json";

const MAGIC: &[u8; 4] = b"LBXI";
const VERSION: u32 = 2;
const KIND_FLAT: u8 = 0;
const KIND_CLUSTERED: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DocumentsFile {
    pub version: u32,
    pub built_at: DateTime<Utc>,
    pub provider: Option<String>,
    pub dimension: usize,
    pub documents: Vec<Document>,
}

pub(crate) fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE)
}

pub(crate) fn documents_path(dir: &Path) -> PathBuf {
    dir.join(DOCUMENTS_FILE)
}

/// Write both artifacts.
pub(crate) fn write(dir: &Path, ann: &Ann, meta: &DocumentsFile) -> Result<()> {
    fs::create_dir_all(dir)?;

    let index_tmp = dir.join(format!("{}.tmp", INDEX_FILE));
    let docs_tmp = dir.join(format!("{}.tmp", DOCUMENTS_FILE));
    fs::write(&index_tmp, encode(ann, meta.built_at.timestamp_millis()))?;
    fs::write(&docs_tmp, serde_json::to_vec(meta)?)?;

    fs::rename(&index_tmp, index_path(dir))?;
    fs::rename(&docs_tmp, documents_path(dir))?;
    Ok(())
}

/// Read both artifacts.
///
/// `Ok(None)` when neither file exists. A lone file, a truncated or
/// malformed structure, unreadable JSON, or a pair that was not written
/// by the same build is an error.
pub(crate) fn read(dir: &Path) -> Result<Option<(Ann, DocumentsFile)>> {
    let index_file = index_path(dir);
    let docs_file = documents_path(dir);

    match (index_file.exists(), docs_file.exists()) {
        (false, false) => return Ok(None),
        (true, false) => {
            return Err(RagError::IndexCorruption(format!(
                "{} present without {}",
                INDEX_FILE, DOCUMENTS_FILE
            )))
        }
        (false, true) => {
            return Err(RagError::IndexCorruption(format!(
                "{} present without {}",
                DOCUMENTS_FILE, INDEX_FILE
            )))
        }
        (true, true) => {}
    }

    let (ann, stamp) = decode(&fs::read(&index_file)?)?;
    let meta: DocumentsFile = serde_json::from_slice(&fs::read(&docs_file)?)?;
    if stamp != meta.built_at.timestamp_millis() {
        return Err(RagError::IndexCorruption(format!(
            "{} and {} come from different builds",
            INDEX_FILE, DOCUMENTS_FILE
        )));
    }
    if meta.dimension != ann.dim {
        return Err(RagError::IndexCorruption(format!(
            "{} dimension {} does not match {} dimension {}",
            DOCUMENTS_FILE, meta.dimension, INDEX_FILE, ann.dim
        )));
    }
    Ok(Some((ann, meta)))
}

pub(crate) fn encode(ann: &Ann, stamp: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(29 + ann.vectors.len() * ann.dim * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&stamp.to_le_bytes());
    out.push(if ann.clusters.is_some() {
        KIND_CLUSTERED
    } else {
        KIND_FLAT
    });
    out.extend_from_slice(&(ann.dim as u32).to_le_bytes());
    out.extend_from_slice(&(ann.vectors.len() as u64).to_le_bytes());
    for v in &ann.vectors {
        out.extend_from_slice(&vec_to_blob(v));
    }

    if let Some(clusters) = &ann.clusters {
        out.extend_from_slice(&(clusters.centroids.len() as u32).to_le_bytes());
        out.extend_from_slice(&(clusters.nprobe as u32).to_le_bytes());
        for c in &clusters.centroids {
            out.extend_from_slice(&vec_to_blob(c));
        }
        for list in &clusters.lists {
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for id in list {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
    }
    out
}

/// Decode `index.bin`, returning the structure and its build stamp.
pub(crate) fn decode(bytes: &[u8]) -> Result<(Ann, i64)> {
    let mut r = Reader { bytes, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let stamp = r.u64()? as i64;
    let kind = r.u8()?;
    let dim = r.u32()? as usize;
    let count = r.u64()? as usize;
    if dim == 0 && count > 0 {
        return Err(corrupt("zero dimension"));
    }

    let mut vectors = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        vectors.push(blob_to_vec(r.take(dim * 4)?));
    }

    let clusters = match kind {
        KIND_FLAT => None,
        KIND_CLUSTERED => {
            let nlist = r.u32()? as usize;
            let nprobe = r.u32()? as usize;
            let mut centroids = Vec::with_capacity(nlist.min(4096));
            for _ in 0..nlist {
                centroids.push(blob_to_vec(r.take(dim * 4)?));
            }
            let mut lists = Vec::with_capacity(nlist.min(4096));
            for _ in 0..nlist {
                let len = r.u32()? as usize;
                let mut list = Vec::with_capacity(len.min(count));
                for _ in 0..len {
                    let id = r.u32()?;
                    if id as usize >= count {
                        return Err(corrupt("cluster member out of range"));
                    }
                    list.push(id);
                }
                lists.push(list);
            }
            Some(Clusters {
                centroids,
                lists,
                nprobe,
            })
        }
        other => return Err(corrupt(&format!("unknown index kind {}", other))),
    };

    if r.pos != bytes.len() {
        return Err(corrupt("trailing bytes"));
    }

    Ok((
        Ann {
            dim,
            vectors,
            clusters,
        },
        stamp,
    ))
}

fn corrupt(detail: &str) -> RagError {
    RagError::IndexCorruption(format!("{}: {}", INDEX_FILE, detail))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt("truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered() -> Ann {
        Ann {
            dim: 2,
            vectors: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]],
            clusters: Some(Clusters {
                centroids: vec![vec![0.95, 0.05], vec![0.0, 1.0]],
                lists: vec![vec![0, 2], vec![1]],
                nprobe: 1,
            }),
        }
    }

    #[test]
    fn test_encode_decode_clustered() {
        let ann = clustered();
        let (decoded, stamp) = decode(&encode(&ann, 1_700_000_000_123)).unwrap();
        assert_eq!(stamp, 1_700_000_000_123);
        assert_eq!(decoded.dim, 2);
        assert_eq!(decoded.vectors, ann.vectors);
        let clusters = decoded.clusters.unwrap();
        assert_eq!(clusters.lists, vec![vec![0, 2], vec![1]]);
        assert_eq!(clusters.nprobe, 1);
    }

    #[test]
    fn test_truncated_is_corruption() {
        let bytes = encode(&clustered(), 0);
        assert!(matches!(
            decode(&bytes[..bytes.len() - 3]),
            Err(RagError::IndexCorruption(_))
        ));
        assert!(matches!(decode(b"NOPE"), Err(RagError::IndexCorruption(_))));
    }

    #[test]
    fn test_out_of_range_member_rejected() {
        let mut ann = clustered();
        if let Some(c) = ann.clusters.as_mut() {
            c.lists[1] = vec![7];
        }
        assert!(decode(&encode(&ann, 0)).is_err());
    }

    #[test]
    fn test_lone_artifact_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read(dir.path()).unwrap().is_none());
        fs::write(index_path(dir.path()), encode(&clustered(), 0)).unwrap();
        assert!(matches!(
            read(dir.path()),
            Err(RagError::IndexCorruption(_))
        ));
    }

    fn meta(built_at: DateTime<Utc>, dimension: usize) -> DocumentsFile {
        DocumentsFile {
            version: 1,
            built_at,
            provider: Some("test".into()),
            dimension,
            documents: vec![Document::new("a"), Document::new("b"), Document::new("c")],
        }
    }

    #[test]
    fn test_pair_from_one_build_reads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), &clustered(), &meta(Utc::now(), 2)).unwrap();
        let (ann, docs) = read(dir.path()).unwrap().unwrap();
        assert_eq!(ann.vectors.len(), docs.documents.len());
        assert!(!dir.path().join(format!("{}.tmp", INDEX_FILE)).exists());
    }

    #[test]
    fn test_dimension_disagreement_is_corruption() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), &clustered(), &meta(Utc::now(), 3)).unwrap();
        assert!(matches!(
            read(dir.path()),
            Err(RagError::IndexCorruption(_))
        ));
    }

    #[test]
    fn test_documents_from_another_build_is_corruption() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = Utc::now();
        write(dir.path(), &clustered(), &meta(first, 2)).unwrap();

        // Only the index from a later build made it into place.
        let later = first + chrono::Duration::seconds(5);
        fs::write(
            index_path(dir.path()),
            encode(&clustered(), later.timestamp_millis()),
        )
        .unwrap();
        assert!(matches!(
            read(dir.path()),
            Err(RagError::IndexCorruption(_))
        ));
    }
}
