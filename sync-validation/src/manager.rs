//! The validation manager: public API of the pipeline.

use crate::config::ValidationConfig;
use crate::error::Result;
use crate::executor::ValidationPool;
use crate::pipeline::{lock, DbTask, Pipeline};
use crate::validator::{IncomingMessageHook, MessageValidator};
use std::sync::{Arc, Mutex};
use sync_core::ServiceState;
use sync_store::{EventBus, ListenerId, MessageStore};
use sync_types::{ClientId, ClientMajorVersion};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Validates incoming messages, resolves their dependencies and delivers
/// them to their clients.
///
/// The manager listens for [`sync_store::Event::MessageAdded`] on the bus it
/// was created with. Messages received from peers are validated; locally
/// authored messages are not.
///
/// # Example
///
/// ```ignore
/// let manager = ValidationManager::new(store, &bus, &config.validation);
/// manager.register_message_validator(client.clone(), 1, Arc::new(ForumValidator));
/// manager.register_incoming_message_hook(client, 1, Arc::new(ForumHook));
/// manager.start()?;
/// ```
pub struct ValidationManager<S: MessageStore> {
    pipeline: Arc<Pipeline<S>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DbTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    bus: EventBus,
    listener: ListenerId,
}

impl<S: MessageStore> ValidationManager<S> {
    /// Create a manager and subscribe it to `bus`.
    ///
    /// Events are ignored until [`start`](Self::start) is called.
    pub fn new(store: Arc<S>, bus: &EventBus, config: &ValidationConfig) -> Self {
        let pool = ValidationPool::new(config.effective_threads());
        let (pipeline, receiver) = Pipeline::new(store, pool);
        let listener = bus.add_listener(pipeline.clone());

        tracing::info!(
            "Validation manager created ({} validator threads)",
            pipeline.pool().size()
        );

        Self {
            pipeline,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            bus: bus.clone(),
            listener,
        }
    }

    /// Register the validator for a client's major version.
    ///
    /// The last registration for a given client and version wins.
    pub fn register_message_validator(
        &self,
        client_id: ClientId,
        major_version: u32,
        validator: Arc<dyn MessageValidator>,
    ) {
        self.pipeline
            .registry()
            .register_validator(ClientMajorVersion::new(client_id, major_version), validator);
    }

    /// Register the delivery hook for a client's major version.
    ///
    /// Without a hook, ready messages are delivered and not shared.
    pub fn register_incoming_message_hook(
        &self,
        client_id: ClientId,
        major_version: u32,
        hook: Arc<dyn IncomingMessageHook<S>>,
    ) {
        self.pipeline
            .registry()
            .register_hook(ClientMajorVersion::new(client_id, major_version), hook);
    }

    /// Start the storage worker and the recovery sweeps.
    ///
    /// Re-queues every message that did not finish the pipeline before the
    /// last shutdown: unvalidated, pending and not-yet-shared messages.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AlreadyStarted`](crate::ValidationError::AlreadyStarted)
    /// if the manager has been started before, and
    /// [`ValidationError::Runtime`](crate::ValidationError::Runtime) if called
    /// outside a tokio runtime. A failed start leaves the state unchanged.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()?;
        self.pipeline.transition(ServiceState::start)?;

        let receiver = lock(&self.receiver).take();
        let Some(receiver) = receiver else {
            return Err(crate::ValidationError::AlreadyStarted);
        };

        let worker = runtime.spawn(Arc::clone(&self.pipeline).run(receiver).in_current_span());
        *lock(&self.worker) = Some(worker);

        self.pipeline.submit(DbTask::ValidateOutstanding);
        self.pipeline.submit(DbTask::DeliverOutstanding);
        self.pipeline.submit(DbTask::ShareOutstanding);

        tracing::info!("Validation manager started");
        Ok(())
    }

    /// Stop accepting new messages.
    ///
    /// Work already queued keeps draining. A stopped manager cannot be
    /// started again.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NotRunning`](crate::ValidationError::NotRunning)
    /// if the manager is not running.
    pub fn stop(&self) -> Result<()> {
        self.pipeline.transition(ServiceState::stop)?;
        tracing::info!("Validation manager stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.pipeline.state()
    }

    /// Wait until no pipeline work is queued or running.
    pub async fn wait_idle(&self) {
        self.pipeline.in_flight().wait_idle().await;
    }
}

impl<S: MessageStore> Drop for ValidationManager<S> {
    fn drop(&mut self) {
        self.bus.remove_listener(self.listener);
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

impl<S: MessageStore> std::fmt::Debug for ValidationManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationManager")
            .field("state", &self.pipeline.state())
            .field("registry", self.pipeline.registry())
            .field("in_flight", &self.pipeline.in_flight().current())
            .finish_non_exhaustive()
    }
}
