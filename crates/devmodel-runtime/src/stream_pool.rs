//! Process-wide pool of command streams
//!
//! Streams are expensive device objects, so groups of them are leased to
//! model instances and returned on drop instead of destroyed. An idle group
//! created for the same program is reset and handed out again; when the cap
//! is reached, idle groups of other programs are destroyed first.
//!
//! ```text
//! StreamPool (Arc, one per process or per Runtime)
//!   └── Mutex<PoolState>
//!         ├── group 1  "resnet"  [stream1, stream2]  leased
//!         ├── group 2  "resnet"  [stream3, stream4]  idle   <- reused next
//!         └── group 3  "bert"    [stream5]           leased
//! ```

use crate::error::{Result, RuntimeError};
use crate::options::StreamPoolConfig;
use devmodel_driver::{Driver, StreamHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

struct StreamGroup {
    id: u64,
    key: String,
    streams: Vec<StreamHandle>,
    leased: bool,
}

#[derive(Default)]
struct PoolState {
    groups: Vec<StreamGroup>,
    next_group: u64,
}

impl PoolState {
    fn count(&self, leased: bool) -> usize {
        self.groups
            .iter()
            .filter(|g| g.leased == leased)
            .map(|g| g.streams.len())
            .sum()
    }
}

/// Reference-counted, mutex-protected stream pool
pub struct StreamPool {
    driver: Arc<dyn Driver>,
    config: StreamPoolConfig,
    state: Mutex<PoolState>,
}

impl StreamPool {
    pub fn new(driver: Arc<dyn Driver>, config: StreamPoolConfig) -> Self {
        Self {
            driver,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Lease `count` streams for the program named `key`
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when leased streams leave no room under
    /// `max_streams`; driver failures otherwise.
    pub fn acquire(self: &Arc<Self>, key: &str, count: usize) -> Result<StreamLease> {
        if count == 0 {
            return Err(RuntimeError::param_invalid("cannot lease zero streams"));
        }
        let mut state = self.state.lock();

        if let Some(lease) = self.reuse_idle(&mut state, key, count) {
            return Ok(lease);
        }

        let max = self.config.max_streams;
        while state.count(true) + state.count(false) + count > max {
            let Some(victim) = state.groups.iter().position(|g| !g.leased) else {
                return Err(RuntimeError::ResourceExhausted {
                    requested: count,
                    in_use: state.count(true),
                    max,
                });
            };
            let group = state.groups.remove(victim);
            debug!(group = group.id, key = group.key.as_str(), "evicting idle stream group");
            self.destroy_streams(&group.streams);
        }

        let mut streams = Vec::with_capacity(count);
        for _ in 0..count {
            match self.driver.create_stream() {
                Ok(stream) => streams.push(stream),
                Err(err) => {
                    self.destroy_streams(&streams);
                    return Err(err.into());
                }
            }
        }

        state.next_group += 1;
        let id = state.next_group;
        state.groups.push(StreamGroup {
            id,
            key: key.to_string(),
            streams: streams.clone(),
            leased: true,
        });
        debug!(group = id, key, count, "stream group created");
        Ok(StreamLease {
            pool: Arc::clone(self),
            group_id: id,
            streams,
        })
    }

    /// Streams currently leased
    pub fn in_use(&self) -> usize {
        self.state.lock().count(true)
    }

    /// Streams kept for reuse
    pub fn idle(&self) -> usize {
        self.state.lock().count(false)
    }

    pub fn config(&self) -> StreamPoolConfig {
        self.config
    }

    fn reuse_idle(self: &Arc<Self>, state: &mut PoolState, key: &str, count: usize) -> Option<StreamLease> {
        while let Some(index) = state
            .groups
            .iter()
            .position(|g| !g.leased && g.key == key && g.streams.len() == count)
        {
            let group = &mut state.groups[index];
            let reset = group.streams.iter().try_for_each(|s| self.driver.reset_stream(*s));
            match reset {
                Ok(()) => {
                    group.leased = true;
                    debug!(group = group.id, key, "stream group reused");
                    return Some(StreamLease {
                        pool: Arc::clone(self),
                        group_id: group.id,
                        streams: group.streams.clone(),
                    });
                }
                Err(err) => {
                    warn!(group = group.id, error = %err, "dropping stream group that failed to reset");
                    let group = state.groups.remove(index);
                    self.destroy_streams(&group.streams);
                }
            }
        }
        None
    }

    fn release(&self, group_id: u64) {
        let mut state = self.state.lock();
        if let Some(group) = state.groups.iter_mut().find(|g| g.id == group_id) {
            group.leased = false;
            debug!(group = group_id, "stream group returned");
        }
    }

    fn destroy_streams(&self, streams: &[StreamHandle]) {
        for stream in streams {
            if let Err(err) = self.driver.destroy_stream(*stream) {
                warn!(%stream, error = %err, "failed to destroy stream");
            }
        }
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        let groups = std::mem::take(&mut self.state.get_mut().groups);
        for group in groups {
            self.destroy_streams(&group.streams);
        }
    }
}

/// Exclusive use of a stream group; returns it to the pool on drop
pub struct StreamLease {
    pool: Arc<StreamPool>,
    group_id: u64,
    streams: Vec<StreamHandle>,
}

impl StreamLease {
    pub fn streams(&self) -> &[StreamHandle] {
        &self.streams
    }

    /// Stream used for copies, argument writes and synchronization
    pub fn exec_stream(&self) -> StreamHandle {
        self.streams[0]
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.pool.release(self.group_id);
    }
}

impl std::fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("group_id", &self.group_id)
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use devmodel_driver::SimDevice;

    fn pool(max_streams: usize) -> (Arc<SimDevice>, Arc<StreamPool>) {
        let device = Arc::new(SimDevice::new());
        let pool = Arc::new(StreamPool::new(device.clone(), StreamPoolConfig { max_streams }));
        (device, pool)
    }

    #[test]
    fn released_group_is_reused_for_same_key() {
        let (device, pool) = pool(8);
        let first = pool.acquire("m", 2).unwrap();
        let streams = first.streams().to_vec();
        drop(first);
        assert_eq!(pool.idle(), 2);

        let second = pool.acquire("m", 2).unwrap();
        assert_eq!(second.streams(), streams.as_slice());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(device.stream_count(), 2);
    }

    #[test]
    fn cap_is_enforced_for_leased_streams() {
        let (_device, pool) = pool(3);
        let _a = pool.acquire("a", 2).unwrap();
        let err = pool.acquire("b", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        let _c = pool.acquire("c", 1).unwrap();
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn idle_groups_of_other_programs_are_evicted() {
        let (device, pool) = pool(2);
        drop(pool.acquire("a", 2).unwrap());
        let _b = pool.acquire("b", 2).unwrap();
        assert_eq!(pool.idle(), 0);
        assert_eq!(device.stream_count(), 2);
    }

    #[test]
    fn reused_streams_are_reset() {
        let (device, pool) = pool(4);
        let lease = pool.acquire("m", 1).unwrap();
        let stream = lease.exec_stream();
        device.abort(stream).unwrap();
        drop(lease);

        let again = pool.acquire("m", 1).unwrap();
        assert_eq!(again.exec_stream(), stream);
        assert!(!device.is_aborted(stream));
    }

    #[test]
    fn dropping_the_pool_destroys_streams() {
        let (device, pool) = pool(4);
        drop(pool.acquire("m", 3).unwrap());
        drop(pool);
        assert_eq!(device.stream_count(), 0);
    }
}
