use keel_common::error::{KeelError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reports the physical sector size of the volume holding `path`.
pub trait StorageGeometry: Send + Sync {
    fn sector_size_of(&self, path: &Path) -> Result<usize>;
}

/// Geometry with a single known sector size for every volume.
#[derive(Debug, Clone, Copy)]
pub struct FixedGeometry {
    sector_size: usize,
}

impl FixedGeometry {
    pub fn new(sector_size: usize) -> Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(KeelError::Validation(format!(
                "sector size {} is not a power of two",
                sector_size
            )));
        }
        Ok(Self { sector_size })
    }
}

impl Default for FixedGeometry {
    fn default() -> Self {
        Self { sector_size: 4096 }
    }
}

impl StorageGeometry for FixedGeometry {
    fn sector_size_of(&self, _path: &Path) -> Result<usize> {
        Ok(self.sector_size)
    }
}

struct GeometryCache {
    sizes: HashMap<PathBuf, usize>,
    order: VecDeque<PathBuf>,
}

/// Wraps another geometry source and remembers answers per volume directory.
/// Holds at most `capacity` volumes, evicting the oldest first.
pub struct CachedGeometry<G> {
    inner: G,
    capacity: usize,
    cache: Mutex<GeometryCache>,
}

impl<G: StorageGeometry> CachedGeometry<G> {
    pub fn new(inner: G, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(GeometryCache {
                sizes: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn cached_volumes(&self) -> usize {
        self.cache.lock().sizes.len()
    }

    fn volume_key(path: &Path) -> PathBuf {
        let dir = if path.is_dir() {
            path
        } else {
            path.parent().unwrap_or(path)
        };
        dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
    }
}

impl<G: StorageGeometry> StorageGeometry for CachedGeometry<G> {
    fn sector_size_of(&self, path: &Path) -> Result<usize> {
        let key = Self::volume_key(path);
        if let Some(size) = self.cache.lock().sizes.get(&key) {
            return Ok(*size);
        }

        let size = self.inner.sector_size_of(path)?;
        debug!(volume = %key.display(), sector_size = size, "queried storage geometry");

        let mut cache = self.cache.lock();
        if !cache.sizes.contains_key(&key) {
            if cache.order.len() >= self.capacity {
                if let Some(oldest) = cache.order.pop_front() {
                    cache.sizes.remove(&oldest);
                }
            }
            cache.order.push_back(key.clone());
            cache.sizes.insert(key, size);
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingGeometry {
        calls: Arc<AtomicUsize>,
    }

    impl StorageGeometry for CountingGeometry {
        fn sector_size_of(&self, _path: &Path) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(512)
        }
    }

    #[test]
    fn test_fixed_geometry_requires_power_of_two() {
        assert!(FixedGeometry::new(512).is_ok());
        assert!(FixedGeometry::new(0).is_err());
        assert!(FixedGeometry::new(1000).is_err());
    }

    #[test]
    fn test_cached_geometry_queries_once_per_volume() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let geometry = CachedGeometry::new(
            CountingGeometry {
                calls: calls.clone(),
            },
            4,
        );

        for _ in 0..3 {
            assert_eq!(geometry.sector_size_of(dir.path()).unwrap(), 512);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cached_geometry_is_bounded() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let geometry = CachedGeometry::new(
            CountingGeometry {
                calls: calls.clone(),
            },
            2,
        );

        for dir in &dirs {
            geometry.sector_size_of(dir.path()).unwrap();
        }
        assert_eq!(geometry.cached_volumes(), 2);

        // the first volume was evicted and must be queried again
        geometry.sector_size_of(dirs[0].path()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
