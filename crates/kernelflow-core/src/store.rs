//! Persistent device tensors (weights, constants) shared by every run.
//!
//! The store is only written between runs. Each run works on a snapshot,
//! so kernel actors read it without locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{EngineError, Result};
use crate::types::{ActorId, DeviceContextKey, HostTensor};

/// Persistent tensors keyed by `(key, device)`.
#[derive(Debug, Default, Clone)]
pub struct DeviceTensorStore {
    tensors: HashMap<(String, DeviceContextKey), Arc<DeviceTensor>>,
}

impl DeviceTensorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a persistent tensor, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Arc<DeviceTensor>) -> Result<()> {
        if !tensor.is_persistent() {
            return Err(EngineError::invalid_input(
                "only persistent tensors can be stored",
            ));
        }
        let device = tensor.device().key().clone();
        self.tensors.insert((key.into(), device), tensor);
        Ok(())
    }

    /// Allocate a persistent tensor on `device` and upload `host` into it.
    pub fn insert_host(
        &mut self,
        key: impl Into<String>,
        device: Arc<dyn DeviceContext>,
        host: &HostTensor,
    ) -> Result<Arc<DeviceTensor>> {
        let key = key.into();
        let tensor = DeviceTensor::persistent(device, host.byte_size(), host.meta.clone());
        tensor.allocate(&ActorId::new(format!("store:{}", key)))?;
        tensor.copy_from_host(&host.data)?;
        self.insert(key, Arc::clone(&tensor))?;
        Ok(tensor)
    }

    /// Look up a tensor.
    pub fn fetch(&self, key: &str, device: &DeviceContextKey) -> Option<Arc<DeviceTensor>> {
        self.tensors
            .get(&(key.to_string(), device.clone()))
            .cloned()
    }

    /// Remove a tensor. Its memory is freed once no run holds it.
    pub fn remove(&mut self, key: &str, device: &DeviceContextKey) -> Option<Arc<DeviceTensor>> {
        self.tensors.remove(&(key.to_string(), device.clone()))
    }

    /// All `(key, device)` pairs.
    pub fn keys(&self) -> impl Iterator<Item = (&str, &DeviceContextKey)> + '_ {
        self.tensors.keys().map(|(k, d)| (k.as_str(), d))
    }

    /// Number of stored tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::TestDevice;
    use crate::types::TensorMeta;

    #[test]
    fn test_insert_host_and_fetch() {
        let device = TestDevice::new(0);
        let mut store = DeviceTensorStore::new();
        let weights = HostTensor::from_f32(&[0.5, 0.25]);

        store.insert_host("w", device.clone(), &weights).unwrap();
        let fetched = store.fetch("w", &DeviceContextKey::cpu(0)).unwrap();
        assert!(fetched.is_persistent());
        assert_eq!(fetched.to_host().unwrap(), weights);

        assert!(store.fetch("w", &DeviceContextKey::cpu(1)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_transient() {
        let device = TestDevice::new(0);
        let mut store = DeviceTensorStore::new();
        let t = DeviceTensor::transient(device, 4, TensorMeta::bytes(4), 1);
        assert!(store.insert("t", t).is_err());
    }

    #[test]
    fn test_remove_frees_when_unreferenced() {
        let device = TestDevice::new(0);
        let mut store = DeviceTensorStore::new();
        store
            .insert_host("w", device.clone(), &HostTensor::from_f32(&[1.0]))
            .unwrap();
        assert_eq!(device.live(), 1);

        let removed = store.remove("w", &DeviceContextKey::cpu(0));
        assert!(removed.is_some());
        drop(removed);
        assert_eq!(device.live(), 0);
        assert!(store.is_empty());
    }
}
