//! Read-only volume store shared by slice views.
//!
//! Volumes are owned by the surrounding application; slice views only hold
//! [`VolumeId`] references and resolve them here when they rebuild.

use crate::volume::Volume;

use slotmap::{SlotMap, new_key_type};
use std::sync::Arc;

new_key_type! {
    /// Stable identity of a volume in the registry.
    pub struct VolumeId;
}

/// A resolved volume reference. Equality is by identity, never by content.
#[derive(Debug, Clone)]
pub struct VolumeHandle {
    id: VolumeId,
    volume: Arc<Volume>,
}

impl VolumeHandle {
    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// True when both handles point at the same volume data.
    pub fn same_as(&self, other: &VolumeHandle) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.volume, &other.volume)
    }
}

#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: SlotMap<VolumeId, Arc<Volume>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, volume: Volume) -> VolumeId {
        self.volumes.insert(Arc::new(volume))
    }

    /// Swaps the data behind `id`. Returns false if the id is unknown.
    pub fn replace(&mut self, id: VolumeId, volume: Volume) -> bool {
        match self.volumes.get_mut(id) {
            Some(slot) => {
                *slot = Arc::new(volume);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.remove(id)
    }

    pub fn get(&self, id: VolumeId) -> Option<VolumeHandle> {
        self.volumes.get(id).map(|volume| VolumeHandle {
            id,
            volume: Arc::clone(volume),
        })
    }

    pub fn contains(&self, id: VolumeId) -> bool {
        self.volumes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn volume(value: u8) -> Volume {
        Volume::new(Array3::from_elem((1, 2, 2), value), (1.0, 1.0, 1.0)).unwrap()
    }

    #[test]
    fn handles_compare_by_identity() {
        let mut registry = VolumeRegistry::new();
        let id = registry.insert(volume(1));
        let first = registry.get(id).unwrap();
        let again = registry.get(id).unwrap();
        assert!(first.same_as(&again));

        assert!(registry.replace(id, volume(1)));
        let replaced = registry.get(id).unwrap();
        assert!(!first.same_as(&replaced));
    }

    #[test]
    fn removed_volumes_no_longer_resolve() {
        let mut registry = VolumeRegistry::new();
        let id = registry.insert(volume(0));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(!registry.replace(id, volume(0)));
        assert!(registry.is_empty());
    }
}
