//! The instance registry: object identity with asymmetric lifetime.
//!
//! Locally-owned originals are held hard so the peer's proxies always
//! resolve; proxies of remote originals are held weak so user code
//! dropping the last handle makes the entry reclaimable. Reclamation is
//! reported by [`InstanceRegistry::collect_released`] and travels to the
//! owning peer as a cleanup notice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::id::{InstanceIdentifier, ObjectId};
use crate::remotable::{same_object, Remotable};

pub enum InstanceEntry {
    /// Locally-owned original.
    Hard(Arc<dyn Remotable>),
    /// Proxy standing in for a remote original.
    Weak(Weak<dyn Remotable>),
}

impl InstanceEntry {
    pub fn get(&self) -> Option<Arc<dyn Remotable>> {
        match self {
            InstanceEntry::Hard(obj) => Some(obj.clone()),
            InstanceEntry::Weak(weak) => weak.upgrade(),
        }
    }

    pub fn released(&self) -> bool {
        match self {
            InstanceEntry::Hard(_) => false,
            InstanceEntry::Weak(weak) => weak.upgrade().is_none(),
        }
    }
}

pub struct InstanceRegistry {
    own: InstanceIdentifier,
    entries: DashMap<ObjectId, InstanceEntry>,
    next_hash: AtomicU64,
    // serializes id allocation so one object never receives two ids
    alloc: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(own: InstanceIdentifier) -> Self {
        Self {
            own,
            entries: DashMap::new(),
            next_hash: AtomicU64::new(0),
            alloc: Mutex::new(()),
        }
    }

    pub fn own_identifier(&self) -> &InstanceIdentifier {
        &self.own
    }

    /// Mints a fresh id owned by this runtime, without recording an entry.
    pub fn allocate_id(&self, type_name: &str) -> ObjectId {
        let hash = self.next_hash.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectId::new(&self.own, type_name, hash)
    }

    /// Returns the id under which `obj` is known, allocating one and
    /// recording a hard reference when the object is seen for the first
    /// time. Proxies keep their originating-side id.
    pub fn id_for(&self, obj: &Arc<dyn Remotable>) -> ObjectId {
        if let Some(handle) = obj.proxy_target() {
            return handle.id.clone();
        }
        let _guard = self.alloc.lock().unwrap();
        if let Some(id) = self.try_get_id(obj) {
            return id;
        }
        let id = self.allocate_id(obj.type_name());
        trace!("registering local instance {}", id);
        self.entries
            .insert(id.clone(), InstanceEntry::Hard(obj.clone()));
        id
    }

    pub fn try_get(&self, id: &ObjectId) -> Option<Arc<dyn Remotable>> {
        self.entries.get(id).and_then(|entry| entry.get())
    }

    /// Reverse lookup by reference equality. Scans; acceptable at
    /// marshalling time.
    pub fn try_get_id(&self, obj: &Arc<dyn Remotable>) -> Option<ObjectId> {
        for entry in self.entries.iter() {
            if let Some(existing) = entry.value().get() {
                if same_object(&existing, obj) {
                    return Some(entry.key().clone());
                }
            }
        }
        None
    }

    /// Idempotent insert. Hard when the id is owned locally, weak
    /// otherwise.
    pub fn add_or_replace(&self, obj: Arc<dyn Remotable>, id: ObjectId) {
        let entry = if id.is_owned_by(&self.own) {
            InstanceEntry::Hard(obj)
        } else {
            InstanceEntry::Weak(Arc::downgrade(&obj))
        };
        self.entries.insert(id, entry);
    }

    /// Drops the entry for `id`. Inbound cleanup-notice path.
    pub fn remove(&self, id: &ObjectId) {
        if self.entries.remove(id).is_some() {
            trace!("dropped instance {}", id);
        }
    }

    /// Drops and reports entries owned by `owner` whose weak target died.
    /// Iteration is weakly consistent; entries added concurrently may or
    /// may not be visited, which is safe.
    pub fn collect_released(&self, owner: &InstanceIdentifier) -> Vec<ObjectId> {
        let mut released = Vec::new();
        self.entries.retain(|id, entry| {
            if id.is_owned_by(owner) && entry.released() {
                released.push(id.clone());
                false
            } else {
                true
            }
        });
        if !released.is_empty() {
            debug!("collected {} released instance(s)", released.len());
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
