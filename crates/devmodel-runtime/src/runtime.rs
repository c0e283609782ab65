//! Model manager: handles, synchronous and asynchronous runs, unload
//!
//! ```text
//! Runtime
//!   ├── StreamPool (shared, injectable)
//!   ├── models:  ModelHandle → Arc<Mutex<ModelInstance>>
//!   └── workers: ModelHandle → AsyncWorker ── mpsc ──► worker thread ──► callback
//! ```
//!
//! Runs on one instance are serialized by its mutex; different instances run
//! in parallel. `run_async` jobs for a model execute in submission order on
//! that model's worker, which is started on first use and joined on unload.

use crate::error::{Result, RuntimeError};
use crate::model::{DataBuffer, ExecState, ModelInstance, ModelStats, RunOutcome};
use crate::options::{MemoryParams, ModelOptions, RunOptions, StreamPoolConfig};
use crate::program::CompiledProgram;
use crate::stream_pool::StreamPool;
use crate::zero_copy::CopyOnlyRegistry;
use devmodel_driver::Driver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Opaque handle to a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

type SharedModel = Arc<Mutex<ModelInstance>>;
type Completion = Box<dyn FnOnce(Result<RunOutcome>) + Send + 'static>;

/// One queued `run_async` call
struct Job {
    inputs: Vec<DataBuffer>,
    outputs: Vec<DataBuffer>,
    completion: Completion,
}

/// Single-consumer run queue for one model
///
/// Dropping the worker closes the queue, lets already-submitted jobs finish,
/// and joins the thread. Completions run after the model lock is released,
/// so they may query or run the same model.
pub struct AsyncWorker {
    sender: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncWorker {
    pub fn spawn(name: &str, model: SharedModel) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let model_name = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("devmodel-run-{name}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let result = model.lock().run(&job.inputs, &job.outputs, &RunOptions::default());
                    (job.completion)(result);
                }
                debug!(model = model_name.as_str(), "async worker drained");
            })
            .map_err(|err| RuntimeError::internal(format!("failed to start async worker for {name}: {err}")))?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| RuntimeError::internal("async worker is shut down"))?
            .send(job)
            .map_err(|_| RuntimeError::internal("async worker has stopped"))
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("async worker panicked");
            }
        }
    }
}

/// Entry point for loading and running models on one driver
pub struct Runtime {
    // Workers are joined before the models they hold are released.
    workers: Mutex<HashMap<ModelHandle, AsyncWorker>>,
    models: RwLock<HashMap<ModelHandle, SharedModel>>,
    driver: Arc<dyn Driver>,
    pool: Arc<StreamPool>,
    next_handle: AtomicU64,
}

impl Runtime {
    /// Runtime with its own stream pool of the default size
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let pool = Arc::new(StreamPool::new(Arc::clone(&driver), StreamPoolConfig::default()));
        Self::with_stream_pool(driver, pool)
    }

    /// Runtime sharing an existing stream pool
    pub fn with_stream_pool(driver: Arc<dyn Driver>, pool: Arc<StreamPool>) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            driver,
            pool,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn stream_pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    /// Load a program, reading options from its embedded option map and the
    /// environment
    pub fn load(&self, program: &CompiledProgram, memory: MemoryParams) -> Result<ModelHandle> {
        let options = ModelOptions::from_map(&program.options)?.with_env_overrides()?;
        self.load_with_options(program, memory, options)
    }

    #[tracing::instrument(skip_all, fields(model = %program.name))]
    pub fn load_with_options(
        &self,
        program: &CompiledProgram,
        memory: MemoryParams,
        options: ModelOptions,
    ) -> Result<ModelHandle> {
        let instance = ModelInstance::load(Arc::clone(&self.driver), &self.pool, program, memory, options)?;
        let handle = ModelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.models.write().insert(handle, Arc::new(Mutex::new(instance)));
        info!(%handle, "model registered");
        Ok(handle)
    }

    pub fn run(&self, handle: ModelHandle, inputs: &[DataBuffer], outputs: &[DataBuffer]) -> Result<RunOutcome> {
        self.run_with_options(handle, inputs, outputs, &RunOptions::default())
    }

    pub fn run_with_options(
        &self,
        handle: ModelHandle,
        inputs: &[DataBuffer],
        outputs: &[DataBuffer],
        options: &RunOptions,
    ) -> Result<RunOutcome> {
        let model = self.model(handle)?;
        let mut instance = model.lock();
        instance.run(inputs, outputs, options)
    }

    /// Queue a run and deliver its result to `callback` on the model's
    /// worker thread
    ///
    /// Only submission errors are returned here; run errors go to the
    /// callback. The callback must not unload this model: unload joins the
    /// worker the callback runs on.
    pub fn run_async<F>(&self, handle: ModelHandle, inputs: Vec<DataBuffer>, outputs: Vec<DataBuffer>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<RunOutcome>) + Send + 'static,
    {
        let model = self.model(handle)?;
        let mut workers = self.workers.lock();
        let worker = match workers.entry(handle) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let name = model.lock().name().to_string();
                entry.insert(AsyncWorker::spawn(&name, model)?)
            }
        };
        worker.submit(Job {
            inputs,
            outputs,
            completion: Box::new(callback),
        })
    }

    pub fn recover(&self, handle: ModelHandle) -> Result<()> {
        self.model(handle)?.lock().recover()
    }

    /// Release a model after its queued async runs complete
    pub fn unload(&self, handle: ModelHandle) -> Result<()> {
        let model = self
            .models
            .write()
            .remove(&handle)
            .ok_or(RuntimeError::UnknownModel(handle.id()))?;
        let worker = self.workers.lock().remove(&handle);
        drop(worker);
        let name = model.lock().name().to_string();
        drop(model);
        info!(%handle, model = name.as_str(), "model unloaded");
        Ok(())
    }

    pub fn state(&self, handle: ModelHandle) -> Result<ExecState> {
        Ok(self.model(handle)?.lock().state())
    }

    pub fn stats(&self, handle: ModelHandle) -> Result<ModelStats> {
        Ok(self.model(handle)?.lock().stats().clone())
    }

    pub fn copy_only_registry(&self, handle: ModelHandle) -> Result<Arc<CopyOnlyRegistry>> {
        Ok(self.model(handle)?.lock().copy_only_registry())
    }

    pub fn update_feature_map(&self, handle: ModelHandle, base: u64, size: usize) -> Result<()> {
        self.model(handle)?.lock().update_feature_map(base, size)
    }

    /// Run `f` with exclusive access to the instance
    pub fn with_model<T>(&self, handle: ModelHandle, f: impl FnOnce(&mut ModelInstance) -> T) -> Result<T> {
        let model = self.model(handle)?;
        let mut instance = model.lock();
        Ok(f(&mut instance))
    }

    pub fn model_count(&self) -> usize {
        self.models.read().len()
    }

    fn model(&self, handle: ModelHandle) -> Result<SharedModel> {
        self.models
            .read()
            .get(&handle)
            .cloned()
            .ok_or(RuntimeError::UnknownModel(handle.id()))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("models", &self.model_count())
            .field("streams_in_use", &self.pool.in_use())
            .field("streams_idle", &self.pool.idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use devmodel_driver::SimDevice;

    #[test]
    fn unknown_handle_is_not_found() {
        let runtime = Runtime::new(Arc::new(SimDevice::new()));
        let err = runtime.run(ModelHandle(42), &[], &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(runtime.unload(ModelHandle(42)).is_err());
    }

    #[test]
    fn handles_display_their_id() {
        assert_eq!(ModelHandle(7).to_string(), "model#7");
        assert_eq!(ModelHandle(7).id(), 7);
    }
}
