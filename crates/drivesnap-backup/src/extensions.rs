//! Item extensions
//!
//! An extension observes the bytes of an item's content as they are read
//! and, once the stream reaches its end, contributes key/value data to the
//! item's info. Extensions are created per item by an
//! [`ItemExtensionFactory`].
//!
//! ## Failure model
//!
//! [`ExtensionReader`] never alters the bytes it passes through. When an
//! extension fails while observing a chunk, that chunk is still delivered
//! and the failure is returned from the following read. A failure while
//! closing is returned in place of end-of-stream.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use drivesnap_core::domain::DriveItem;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

/// Data contributed by extensions, keyed by extension output name
pub type ExtensionData = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension {name} failed while reading: {message}")]
    Read { name: String, message: String },

    #[error("Extension {name} failed while closing: {message}")]
    Close { name: String, message: String },

    #[error("Unknown extension: {0}")]
    Unknown(String),
}

/// Per-item observer of content bytes
pub trait ItemExtension: Send {
    fn name(&self) -> &str;

    /// Observes one chunk of content.
    fn on_read(&mut self, chunk: &[u8]) -> Result<(), ExtensionError>;

    /// Called once at end of stream; returns the data to attach.
    fn on_close(&mut self) -> Result<ExtensionData, ExtensionError>;
}

/// Creates one [`ItemExtension`] per item
pub trait ItemExtensionFactory: Send + Sync {
    fn create(&self, item: &DriveItem) -> Box<dyn ItemExtension>;
}

// ============================================================================
// Built-in extensions
// ============================================================================

/// Counts content bytes, reported as `bytes`
#[derive(Debug, Default)]
pub struct ByteCounter {
    count: u64,
}

impl ItemExtension for ByteCounter {
    fn name(&self) -> &str {
        "bytes"
    }

    fn on_read(&mut self, chunk: &[u8]) -> Result<(), ExtensionError> {
        self.count += chunk.len() as u64;
        Ok(())
    }

    fn on_close(&mut self) -> Result<ExtensionData, ExtensionError> {
        Ok(BTreeMap::from([("bytes".to_string(), Value::from(self.count))]))
    }
}

/// Hex SHA-256 of the content, reported as `sha256`
#[derive(Default)]
pub struct Sha256Digest {
    hasher: Sha256,
}

impl ItemExtension for Sha256Digest {
    fn name(&self) -> &str {
        "sha256"
    }

    fn on_read(&mut self, chunk: &[u8]) -> Result<(), ExtensionError> {
        self.hasher.update(chunk);
        Ok(())
    }

    fn on_close(&mut self) -> Result<ExtensionData, ExtensionError> {
        let digest = std::mem::take(&mut self.hasher).finalize();
        Ok(BTreeMap::from([(
            "sha256".to_string(),
            Value::from(format!("{digest:x}")),
        )]))
    }
}

/// Factory for the built-in extensions, selected by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinExtension {
    Bytes,
    Sha256,
}

impl BuiltinExtension {
    /// Resolves a configured extension name.
    ///
    /// # Errors
    /// Returns [`ExtensionError::Unknown`] for unrecognized names
    pub fn from_name(name: &str) -> Result<Self, ExtensionError> {
        match name {
            "bytes" => Ok(Self::Bytes),
            "sha256" => Ok(Self::Sha256),
            other => Err(ExtensionError::Unknown(other.to_string())),
        }
    }
}

impl ItemExtensionFactory for BuiltinExtension {
    fn create(&self, _item: &DriveItem) -> Box<dyn ItemExtension> {
        match self {
            Self::Bytes => Box::new(ByteCounter::default()),
            Self::Sha256 => Box::new(Sha256Digest::default()),
        }
    }
}

/// Builds factories for every configured extension name.
///
/// # Errors
/// Returns [`ExtensionError::Unknown`] for the first unrecognized name
pub fn factories_from_names<S: AsRef<str>>(
    names: &[S],
) -> Result<Vec<Arc<dyn ItemExtensionFactory>>, ExtensionError> {
    names
        .iter()
        .map(|name| {
            BuiltinExtension::from_name(name.as_ref())
                .map(|ext| Arc::new(ext) as Arc<dyn ItemExtensionFactory>)
        })
        .collect()
}

// ============================================================================
// ExtensionReader
// ============================================================================

/// Shared handle to the data extensions attach once the stream is drained
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandle {
    data: Arc<Mutex<Option<ExtensionData>>>,
}

impl ExtensionHandle {
    /// The collected data, or `None` while the stream is still open.
    #[must_use]
    pub fn data(&self) -> Option<ExtensionData> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, data: ExtensionData) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
    }
}

/// Async reader that feeds every chunk through a set of extensions
pub struct ExtensionReader<R> {
    inner: R,
    extensions: Vec<Box<dyn ItemExtension>>,
    pending: Option<ExtensionError>,
    closed: bool,
    handle: ExtensionHandle,
}

impl<R> ExtensionReader<R> {
    /// Wraps `inner` with one extension per factory.
    pub fn new(inner: R, item: &DriveItem, factories: &[Arc<dyn ItemExtensionFactory>]) -> Self {
        Self {
            inner,
            extensions: factories.iter().map(|f| f.create(item)).collect(),
            pending: None,
            closed: false,
            handle: ExtensionHandle::default(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ExtensionHandle {
        self.handle.clone()
    }

    fn close(&mut self) -> Result<(), ExtensionError> {
        self.closed = true;

        let mut data = ExtensionData::new();
        for ext in &mut self.extensions {
            data.extend(ext.on_close()?);
        }
        self.handle.set(data);

        Ok(())
    }
}

fn to_io(err: ExtensionError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl<R: AsyncRead + Unpin> AsyncRead for ExtensionReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.pending.take() {
            return Poll::Ready(Err(to_io(err)));
        }
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];

                if chunk.is_empty() {
                    return Poll::Ready(this.close().map_err(to_io));
                }

                for ext in &mut this.extensions {
                    if let Err(e) = ext.on_read(chunk) {
                        this.pending = Some(e);
                        break;
                    }
                }

                Poll::Ready(Ok(()))
            }
        }
    }
}
