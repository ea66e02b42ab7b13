use std::path::Path;

use bytes::Bytes;

/// A relocatable object image together with a name used in logs and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectBuffer {
    name: String,
    data: Bytes,
}

impl ObjectBuffer {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Read an object file from disk, named after its path.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Ok(Self::new(path.display().to_string(), data))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
