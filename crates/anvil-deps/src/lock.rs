use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const STRIPE_COUNT: usize = 1024;

/// A fixed pool of mutexes keyed by path hash.
///
/// Guarantees at most one in-flight download or extraction per target path
/// within this process. Unrelated paths that hash to the same stripe contend
/// with each other; that only costs extra serialization, never correctness.
/// Cross-process coordination is deliberately not provided here: concurrent
/// processes are isolated by atomic renames and re-derivable flag files
/// instead.
pub(crate) struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedLocks {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Block until the stripe for `path` is available and hold it until the
    /// returned guard is dropped.
    pub(crate) fn guard(&self, path: &Path) -> MutexGuard<'_, ()> {
        self.stripes[stripe_index(path)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn stripe_index(path: &Path) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % STRIPE_COUNT as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn same_path_maps_to_same_stripe() {
        let a = stripe_index(Path::new("/cache/a1b2c3d4e5-jdk.tar.gz"));
        let b = stripe_index(Path::new("/cache/a1b2c3d4e5-jdk.tar.gz"));
        assert_eq!(a, b);
    }

    #[test]
    fn guard_serializes_same_path_across_threads() {
        let locks = Arc::new(StripedLocks::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let path = PathBuf::from("/cache/contended");

        let mut handles = Vec::new();
        for id in 0..8 {
            let locks = Arc::clone(&locks);
            let log = Arc::clone(&log);
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = locks.guard(&path);
                // Both entries are appended under the stripe lock, so the
                // begin/end pairs of different threads must never interleave.
                log.lock().unwrap().push((id, "begin"));
                log.lock().unwrap().push((id, "end"));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 16);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "begin");
            assert_eq!(pair[1].1, "end");
        }
    }
}
