//! Bundled segment stores.
//!
//! [`MemoryStore`] keeps faithful clones of saved segments in a map and is
//! the natural choice for tests and bounded-memory in-process use.
//! [`FileStore`] persists one checksummed file per block, serialized with
//! CBOR, and survives process restarts together with an
//! [`crate::ArrayDescriptor`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{QuireError, Result};
use crate::persist::{BlockId, LoadRequest, SaveRequest, SegmentStore};

/// In-memory block store holding cloned segment content.
///
/// Cloning the store is cheap and shares the underlying blocks, so one
/// store instance can serve an array and, later, its restored successor.
pub struct MemoryStore<T, X = ()> {
    inner: Arc<Mutex<HashMap<u64, MemBlock<T, X>>>>,
}

struct MemBlock<T, X> {
    values: Vec<T>,
    tails: Vec<X>,
}

impl<T, X> MemoryStore<T, X> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of blocks currently held.
    pub fn block_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<T, X> Default for MemoryStore<T, X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, X> Clone for MemoryStore<T, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone, X: Clone> SegmentStore<T, X> for MemoryStore<T, X> {
    fn save(&mut self, req: &SaveRequest<'_, T, X>) -> Result<()> {
        self.inner.lock().insert(
            req.block.0,
            MemBlock {
                values: req.values.to_vec(),
                tails: req.tails.to_vec(),
            },
        );
        Ok(())
    }

    fn load(&mut self, req: &mut LoadRequest<'_, T, X>) -> Result<()> {
        if req.first_load {
            // Nothing was ever saved; the default-initialized slots stand.
            return Ok(());
        }
        let blocks = self.inner.lock();
        let block = blocks
            .get(&req.block.0)
            .ok_or_else(|| QuireError::Corruption(format!("missing block {}", req.block)))?;
        if block.values.len() != req.values.len() || block.tails.len() != req.tails.len() {
            return Err(QuireError::Corruption(format!(
                "block {} length mismatch",
                req.block
            )));
        }
        req.values.clone_from_slice(&block.values);
        req.tails.clone_from_slice(&block.tails);
        Ok(())
    }
}

const BLOCK_MAGIC: u32 = 0x5155_4952;
const BLOCK_HDR_LEN: usize = 12;

/// File-backed block store: one CBOR-encoded, CRC-checked file per block.
///
/// Writes go through a temporary file renamed into place, so a crash never
/// leaves a half-written block behind.
pub struct FileStore<T, X = ()> {
    inner: Arc<Mutex<PathBuf>>,
    _marker: PhantomData<fn() -> (T, X)>,
}

impl<T, X> Clone for FileStore<T, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, X> FileStore<T, X> {
    /// Opens (creating if needed) a block directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            inner: Arc::new(Mutex::new(dir.as_ref().to_path_buf())),
            _marker: PhantomData,
        })
    }

    fn block_path(dir: &Path, block: BlockId) -> PathBuf {
        dir.join(format!("block-{:08}.seg", block.0))
    }
}

impl<T, X> SegmentStore<T, X> for FileStore<T, X>
where
    T: Serialize + DeserializeOwned,
    X: Serialize + DeserializeOwned,
{
    fn save(&mut self, req: &SaveRequest<'_, T, X>) -> Result<()> {
        let dir = self.inner.lock();
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&(req.values, req.tails), &mut payload)
            .map_err(|err| QuireError::Serialization(err.to_string()))?;
        let mut frame = BytesMut::with_capacity(BLOCK_HDR_LEN + payload.len());
        frame.put_u32(BLOCK_MAGIC);
        frame.put_u32(crc32fast::hash(&payload));
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);

        let path = Self::block_path(&dir, req.block);
        let mut tmp = path.clone();
        tmp.set_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&frame)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(block = req.block.0, bytes = frame.len(), "quire.store.save");
        Ok(())
    }

    fn load(&mut self, req: &mut LoadRequest<'_, T, X>) -> Result<()> {
        if req.first_load {
            return Ok(());
        }
        let dir = self.inner.lock();
        let path = Self::block_path(&dir, req.block);
        let mut data = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(QuireError::Corruption(format!(
                    "missing block file for block {}",
                    req.block
                )));
            }
            Err(err) => return Err(QuireError::Io(err)),
        }
        if data.len() < BLOCK_HDR_LEN {
            return Err(QuireError::Corruption(format!(
                "block {} frame truncated",
                req.block
            )));
        }
        let mut header = &data[..BLOCK_HDR_LEN];
        let magic = header.get_u32();
        let crc = header.get_u32();
        let len = header.get_u32() as usize;
        let payload = &data[BLOCK_HDR_LEN..];
        if magic != BLOCK_MAGIC || payload.len() != len {
            return Err(QuireError::Corruption(format!(
                "block {} frame corrupted",
                req.block
            )));
        }
        if crc32fast::hash(payload) != crc {
            return Err(QuireError::Corruption(format!(
                "block {} checksum mismatch",
                req.block
            )));
        }
        let (values, tails): (Vec<T>, Vec<X>) = ciborium::de::from_reader(payload)
            .map_err(|err| QuireError::Serialization(err.to_string()))?;
        if values.len() != req.values.len() || tails.len() != req.tails.len() {
            return Err(QuireError::Corruption(format!(
                "block {} length mismatch",
                req.block
            )));
        }
        for (slot, value) in req.values.iter_mut().zip(values) {
            *slot = value;
        }
        for (slot, tail) in req.tails.iter_mut().zip(tails) {
            *slot = tail;
        }
        Ok(())
    }
}
