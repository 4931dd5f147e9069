//! File storage for documents and avatars, addressed by path
use super::error::StoreError;
use super::store::{DurableStore, Table, WriteOp, decode_row, encode_row};
use std::sync::Arc;

pub const URL_SCHEME: &str = "blob://";

pub trait BlobStore: Send + Sync {
    /// Stores the bytes at `path`, replacing what was there, and returns its url.
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError>;
    fn download(&self, url: &str) -> Result<Option<Blob>, StoreError>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    #[n(0)]
    pub content_type: String,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub bytes: Vec<u8>,
}

/// Keeps blobs in the same store as the rows that point at them.
pub struct TableBlobStore<S: DurableStore> {
    store: Arc<S>,
}

impl<S: DurableStore> TableBlobStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: DurableStore> BlobStore for TableBlobStore<S> {
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError> {
        let path = path.trim_start_matches('/');
        let blob = Blob {
            content_type: content_type.to_string(),
            bytes: bytes.to_vec(),
        };
        self.store.apply(vec![WriteOp::Put {
            table: Table::Blobs,
            key: path.to_string(),
            row: encode_row(&blob)?,
        }])?;
        Ok(format!("{URL_SCHEME}{path}"))
    }

    fn download(&self, url: &str) -> Result<Option<Blob>, StoreError> {
        let path = url.strip_prefix(URL_SCHEME).unwrap_or(url);
        self.store
            .get(Table::Blobs, path)?
            .map(|raw| decode_row(path, &raw))
            .transpose()
    }
}
