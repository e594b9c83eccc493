use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use npu_ipc::wire::{NetworkBuffer, NetworkRef};

use crate::process::Model;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Unsupported network model type. type={0}")]
    UnsupportedType(u32),
    #[error("Network model index out of range. index={index}, max={max}")]
    IndexOutOfRange { index: u32, max: usize },
    #[error("Failed to load network model {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the network a request refers to.
pub trait Networks: Send + Sync {
    fn indexed_network(&self, index: u32) -> Result<Model, NetworkError>;

    fn get_network(&self, network: &NetworkBuffer) -> Result<Model, NetworkError> {
        match NetworkRef::try_from(*network).map_err(NetworkError::UnsupportedType)? {
            NetworkRef::Buffer(buf) => Ok(Model::Shared(buf.into())),
            NetworkRef::Index(index) => self.indexed_network(index),
        }
    }
}

/// Accepts only networks passed by buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndexedNetworks;

impl Networks for NoIndexedNetworks {
    fn indexed_network(&self, index: u32) -> Result<Model, NetworkError> {
        Err(NetworkError::IndexOutOfRange { index, max: 0 })
    }
}

/// A table of model images addressable by index.
#[derive(Debug, Default, Clone)]
pub struct IndexedNetworks {
    models: Vec<Arc<[u8]>>,
}

impl IndexedNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model image and returns its index.
    pub fn register<D: Into<Arc<[u8]>>>(&mut self, data: D) -> u32 {
        self.models.push(data.into());
        (self.models.len() - 1) as u32
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<u32, NetworkError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| NetworkError::Load {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.register(data))
    }

    pub fn from_paths<I, P>(paths: I) -> Result<Self, NetworkError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut networks = Self::new();
        for path in paths {
            networks.load(path)?;
        }
        Ok(networks)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Networks for IndexedNetworks {
    fn indexed_network(&self, index: u32) -> Result<Model, NetworkError> {
        let data = self
            .models
            .get(index as usize)
            .ok_or(NetworkError::IndexOutOfRange {
                index,
                max: self.models.len(),
            })?;
        Ok(Model::Registered {
            index,
            data: Arc::clone(data),
        })
    }
}
