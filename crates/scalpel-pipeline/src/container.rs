//! Bounds-checked, nestable views over bytes

use crate::mmap::MmapSource;
use bytes::{Bytes, BytesMut};
use scalpel_core::{BoundsError, ByteReader, Fingerprint};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Fingerprints are streamed through the hasher in chunks of this size
const FINGERPRINT_CHUNK: u64 = 1024 * 1024;

/// In-memory byte source; windows over it never copy
#[derive(Debug, Clone, Default)]
pub struct MemorySource(Bytes);

impl MemorySource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl ByteReader for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        self.0.read_at(offset, length)
    }
}

/// One contiguous run of a non-contiguous container, relative to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone)]
enum Backing {
    Root(Arc<dyn ByteReader>),
    Window { parent: Container, offset: u64 },
    Extents { parent: Container, extents: Arc<[Extent]> },
}

#[derive(Clone)]
struct Inner {
    name: String,
    media_type: Option<String>,
    length: u64,
    backing: Backing,
    fingerprint: OnceLock<Fingerprint>,
}

/// A named view over a byte range
///
/// Containers are cheap to clone and immutable apart from the lazily cached
/// fingerprint. A child never copies its parent's bytes: reads are resolved
/// by walking up the parent chain to the root source.
///
/// # Example
///
/// ```rust
/// use scalpel_pipeline::Container;
///
/// let disk = Container::from_bytes("disk", vec![0u8; 10]);
/// assert!(disk.window(6, 4).is_ok());
/// assert!(disk.window(8, 4).is_err());
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl Container {
    fn build(name: String, length: u64, backing: Backing) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                media_type: None,
                length,
                backing,
                fingerprint: OnceLock::new(),
            }),
        }
    }

    /// Create a root container over an arbitrary byte source
    pub fn root(name: impl Into<String>, source: impl ByteReader + 'static) -> Self {
        Self::shared(name, Arc::new(source))
    }

    /// Create a root container over a shared byte source
    pub fn shared(name: impl Into<String>, source: Arc<dyn ByteReader>) -> Self {
        let length = source.len();
        Self::build(name.into(), length, Backing::Root(source))
    }

    /// Create a root container over in-memory bytes
    ///
    /// Also the way to surface reconstructed content (decompressed or
    /// reassembled bytes) that has no parent window.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::root(name, MemorySource::new(bytes))
    }

    /// Open a file as a memory-mapped root container
    pub fn open(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_file() && metadata.len() == 0 {
            return Ok(Self::from_bytes(name, Bytes::new()));
        }

        Ok(Self::root(name, MmapSource::from_file(&file)?))
    }

    /// Create a child view of `length` bytes at `offset`
    ///
    /// Fails without side effects when the range exceeds this container.
    pub fn window(&self, offset: u64, length: u64) -> Result<Container, BoundsError> {
        let name = format!("{}@{:#x}", self.inner.name, offset);
        self.window_named(name, offset, length)
    }

    /// Like [`window`](Self::window), with an explicit name
    pub fn window_named(
        &self,
        name: impl Into<String>,
        offset: u64,
        length: u64,
    ) -> Result<Container, BoundsError> {
        BoundsError::check(offset, length, self.inner.length)?;
        Ok(Self::build(
            name.into(),
            length,
            Backing::Window {
                parent: self.clone(),
                offset,
            },
        ))
    }

    /// Create a child from non-contiguous runs of this container, in order
    pub fn extents(
        &self,
        name: impl Into<String>,
        runs: &[(u64, u64)],
    ) -> Result<Container, BoundsError> {
        let mut total: u64 = 0;
        let mut extents = Vec::with_capacity(runs.len());
        for &(offset, length) in runs {
            BoundsError::check(offset, length, self.inner.length)?;
            total = total
                .checked_add(length)
                .ok_or_else(|| BoundsError::new(offset, length, self.inner.length))?;
            extents.push(Extent { offset, length });
        }

        Ok(Self::build(
            name.into(),
            total,
            Backing::Extents {
                parent: self.clone(),
                extents: extents.into(),
            },
        ))
    }

    /// Attach a media-type hint used to narrow dissector selection
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).media_type = Some(media_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn media_type(&self) -> Option<&str> {
        self.inner.media_type.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    /// The container this one was carved from, if any
    pub fn parent(&self) -> Option<&Container> {
        match &self.inner.backing {
            Backing::Root(_) => None,
            Backing::Window { parent, .. } | Backing::Extents { parent, .. } => Some(parent),
        }
    }

    /// Number of parent layers above this container
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Offset within the root source, when this container is one contiguous run
    pub fn absolute_offset(&self) -> Option<u64> {
        let mut offset = 0u64;
        let mut current = self;
        loop {
            match &current.inner.backing {
                Backing::Root(_) => return Some(offset),
                Backing::Window { parent, offset: base } => {
                    offset += base;
                    current = parent;
                }
                Backing::Extents { .. } => return None,
            }
        }
    }

    /// Read exactly `length` bytes at `offset`, relative to this container
    pub fn read(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        BoundsError::check(offset, length, self.inner.length)?;

        let mut offset = offset;
        let mut current = self;
        loop {
            match &current.inner.backing {
                Backing::Root(source) => return source.read_at(offset, length),
                Backing::Window { parent, offset: base } => {
                    // Cannot overflow: windows are bounds-checked at construction.
                    offset += base;
                    current = parent;
                }
                Backing::Extents { parent, extents } => {
                    return read_extents(parent, extents, offset, length)
                }
            }
        }
    }

    /// SHA-256 of the container's bytes, computed once and cached
    pub fn fingerprint(&self) -> Fingerprint {
        *self.inner.fingerprint.get_or_init(|| self.compute_fingerprint())
    }

    fn compute_fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let length = self.inner.length;
        let mut offset = 0u64;

        while offset < length {
            let chunk = FINGERPRINT_CHUNK.min(length - offset);
            match self.read(offset, chunk) {
                Ok(bytes) => hasher.update(&bytes),
                Err(e) => {
                    tracing::warn!(
                        container = %self.inner.name,
                        error = %e,
                        "Byte source shorter than declared, hashing zeros"
                    );
                    hasher.update(vec![0u8; chunk as usize]);
                }
            }
            offset += chunk;
        }

        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint::from_bytes(bytes)
    }
}

fn read_extents(
    parent: &Container,
    extents: &[Extent],
    offset: u64,
    length: u64,
) -> Result<Bytes, BoundsError> {
    let mut skip = offset;
    let mut remaining = length;
    let mut pieces = Vec::new();

    for extent in extents {
        if remaining == 0 {
            break;
        }
        if skip >= extent.length {
            skip -= extent.length;
            continue;
        }
        let take = (extent.length - skip).min(remaining);
        pieces.push(parent.read(extent.offset + skip, take)?);
        skip = 0;
        remaining -= take;
    }

    if pieces.len() == 1 {
        return Ok(pieces.remove(0));
    }

    let mut out = BytesMut::with_capacity(length as usize);
    for piece in pieces {
        out.extend_from_slice(&piece);
    }
    Ok(out.freeze())
}

impl ByteReader for Container {
    fn len(&self) -> u64 {
        self.inner.length
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        self.read(offset, length)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.name)
            .field("length", &self.inner.length)
            .field("media_type", &self.inner.media_type)
            .field("depth", &self.depth())
            .finish()
    }
}
