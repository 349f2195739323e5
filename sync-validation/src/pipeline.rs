//! Pipeline stages and the storage worker.
//!
//! ```text
//!  MessageAdded (from a peer) ─┐
//!  startup sweep ──────────────┴─► load ──► validator ──► store context
//!                                            (pool)          │
//!                       ┌──────────────────┬─────────────────┤
//!                       ▼                  ▼                 ▼
//!                  invalidate       deliver pending        share
//!                 (dependents)       (dependents)      (dependencies)
//! ```
//!
//! Every box except the validator is a [`DbTask`] run by a single worker
//! task, one transaction per task. Cascades are work queues: a task handles
//! one id and re-submits the rest of its queue as a new task, so no stage
//! recurses and a long cascade never monopolises the worker.

use crate::executor::{InFlight, ValidationPool};
use crate::registry::Registry;
use crate::validator::{HookError, MessageValidator};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::{DependencySummary, LifecycleError, Readiness, ServiceState, Verdict, WorkQueue};
use sync_store::{DbError, DbResult, Event, EventListener, MessageStore};
use sync_types::{
    ClientMajorVersion, DeliveryAction, Group, GroupId, InvalidMessage, Message, MessageContext,
    MessageId, MessageState, Metadata,
};
use tokio::sync::mpsc;
use tracing::Instrument;

/// A unit of work for the storage worker.
pub(crate) enum DbTask {
    ValidateOutstanding,
    ValidateNext(WorkQueue),
    LoadGroupAndValidate(Message),
    StoreContext {
        message: Message,
        client: ClientMajorVersion,
        context: MessageContext,
    },
    DeliverOutstanding,
    DeliverNext(WorkQueue),
    ShareOutstanding,
    ShareNext(WorkQueue),
    InvalidateNext(WorkQueue),
}

/// Why a stage could not finish for one message.
#[derive(Debug)]
enum StageError {
    /// The message or its group was removed concurrently.
    NotFound(DbError),
    /// The validator judged the message invalid.
    Rejected(InvalidMessage),
    /// Any other storage failure.
    Backend(DbError),
}

impl From<DbError> for StageError {
    fn from(e: DbError) -> Self {
        if e.is_not_found() {
            StageError::NotFound(e)
        } else {
            StageError::Backend(e)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Validate,
    Deliver,
    Share,
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sweep::Validate => write!(f, "validate"),
            Sweep::Deliver => write!(f, "deliver"),
            Sweep::Share => write!(f, "share"),
        }
    }
}

/// Cascades to start once a transaction has committed.
#[derive(Debug, Default)]
struct FollowUp {
    invalidate: Vec<MessageId>,
    deliver: Vec<MessageId>,
    share: Vec<MessageId>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_id(queue: &mut WorkQueue) -> MessageId {
    match queue.pop() {
        Some(id) => id,
        None => unreachable!("stage queues are never submitted empty"),
    }
}

/// State shared by the manager, the event listener, the storage worker and
/// in-flight validations.
pub(crate) struct Pipeline<S: MessageStore> {
    store: Arc<S>,
    registry: Registry<S>,
    pool: ValidationPool,
    tasks: mpsc::UnboundedSender<DbTask>,
    in_flight: InFlight,
    state: Mutex<ServiceState>,
}

impl<S: MessageStore> Pipeline<S> {
    pub(crate) fn new(
        store: Arc<S>,
        pool: ValidationPool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DbTask>) {
        let (tasks, receiver) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            store,
            registry: Registry::new(),
            pool,
            tasks,
            in_flight: InFlight::new(),
            state: Mutex::new(ServiceState::default()),
        });
        (pipeline, receiver)
    }

    pub(crate) fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    pub(crate) fn pool(&self) -> &ValidationPool {
        &self.pool
    }

    pub(crate) fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub(crate) fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    pub(crate) fn transition(
        &self,
        change: impl FnOnce(ServiceState) -> Result<ServiceState, LifecycleError>,
    ) -> Result<ServiceState, LifecycleError> {
        let mut state = lock(&self.state);
        *state = change(*state)?;
        Ok(*state)
    }

    /// Queue a task for the storage worker.
    pub(crate) fn submit(&self, task: DbTask) {
        self.in_flight.begin();
        if self.tasks.send(task).is_err() {
            // Recovered by the next startup sweep
            self.in_flight.finish();
            tracing::warn!("Storage worker is not running; dropping task");
        }
    }

    /// Drain tasks until the channel closes or the worker is aborted.
    pub(crate) async fn run(self: Arc<Self>, mut tasks: mpsc::UnboundedReceiver<DbTask>) {
        tracing::debug!("Storage worker started");
        while let Some(task) = tasks.recv().await {
            self.execute(task).await;
            self.in_flight.finish();
        }
        tracing::debug!("Storage worker stopped");
    }

    async fn execute(self: &Arc<Self>, task: DbTask) {
        match task {
            DbTask::ValidateOutstanding => {
                let ids = self.outstanding(Sweep::Validate).await;
                self.seed(Sweep::Validate, ids, DbTask::ValidateNext);
            }
            DbTask::ValidateNext(queue) => self.validate_next(queue).await,
            DbTask::LoadGroupAndValidate(message) => self.load_group_and_validate(message).await,
            DbTask::StoreContext {
                message,
                client,
                context,
            } => self.store_context(message, client, context).await,
            DbTask::DeliverOutstanding => {
                let ids = self.outstanding(Sweep::Deliver).await;
                self.seed(Sweep::Deliver, ids, DbTask::DeliverNext);
            }
            DbTask::DeliverNext(queue) => self.deliver_next(queue).await,
            DbTask::ShareOutstanding => {
                let ids = self.outstanding(Sweep::Share).await;
                self.seed(Sweep::Share, ids, DbTask::ShareNext);
            }
            DbTask::ShareNext(queue) => self.share_next(queue).await,
            DbTask::InvalidateNext(queue) => self.invalidate_next(queue).await,
        }
    }

    // --- Error routing ---

    /// Log a stage failure. Returns whether the surrounding queue may
    /// continue with its next item.
    fn report(&self, id: &MessageId, error: StageError) -> bool {
        match error {
            StageError::NotFound(e) => {
                tracing::info!("Skipping message {}: {}", id, e);
                true
            }
            StageError::Rejected(reason) => {
                tracing::info!("Message {} is invalid: {}", id, reason.reason());
                self.submit(DbTask::InvalidateNext(std::iter::once(*id).collect()));
                true
            }
            StageError::Backend(e) => {
                tracing::warn!("Storage error while processing message {}: {}", id, e);
                false
            }
        }
    }

    /// Report the outcome for `id` and hand the rest of the queue on.
    fn continue_with(
        &self,
        id: &MessageId,
        result: Result<(), StageError>,
        queue: WorkQueue,
        next: fn(WorkQueue) -> DbTask,
    ) {
        let proceed = match result {
            Ok(()) => true,
            Err(e) => self.report(id, e),
        };
        if proceed && !queue.is_empty() {
            self.submit(next(queue));
        }
    }

    fn submit_follow_up(&self, follow_up: FollowUp) {
        if !follow_up.invalidate.is_empty() {
            self.submit(DbTask::InvalidateNext(
                follow_up.invalidate.into_iter().collect(),
            ));
        }
        if !follow_up.deliver.is_empty() {
            self.submit(DbTask::DeliverNext(follow_up.deliver.into_iter().collect()));
        }
        if !follow_up.share.is_empty() {
            self.submit(DbTask::ShareNext(follow_up.share.into_iter().collect()));
        }
    }

    // --- Startup sweeps ---

    async fn outstanding(&self, sweep: Sweep) -> DbResult<Vec<MessageId>> {
        let mut txn = self.store.begin(true).await?;
        let ids = match sweep {
            Sweep::Validate => self.store.messages_to_validate(&mut txn).await?,
            Sweep::Deliver => self.store.pending_messages(&mut txn).await?,
            Sweep::Share => self.store.messages_to_share(&mut txn).await?,
        };
        self.store.commit(txn).await?;
        Ok(ids)
    }

    fn seed(&self, sweep: Sweep, ids: DbResult<Vec<MessageId>>, next: fn(WorkQueue) -> DbTask) {
        match ids {
            Ok(ids) if ids.is_empty() => tracing::debug!("No messages to {}", sweep),
            Ok(ids) => {
                tracing::info!("Found {} messages to {}", ids.len(), sweep);
                self.submit(next(ids.into_iter().collect()));
            }
            Err(e) => tracing::warn!("Failed to load messages to {}: {}", sweep, e),
        }
    }

    // --- Validation ---

    async fn validate_next(self: &Arc<Self>, mut queue: WorkQueue) {
        let id = next_id(&mut queue);
        let result = match self.load_message_and_group(&id).await {
            Ok((message, group)) => {
                self.validate_message(message, group);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.continue_with(&id, result, queue, DbTask::ValidateNext);
    }

    async fn load_message_and_group(&self, id: &MessageId) -> Result<(Message, Group), StageError> {
        let mut txn = self.store.begin(true).await?;
        let message = self.store.get_message(&mut txn, id).await?;
        let group = self.store.get_group(&mut txn, &message.group_id).await?;
        self.store.commit(txn).await?;
        Ok((message, group))
    }

    async fn load_group_and_validate(self: &Arc<Self>, message: Message) {
        match self.load_group(&message.group_id).await {
            Ok(group) => self.validate_message(message, group),
            Err(e) => {
                self.report(&message.id, e);
            }
        }
    }

    async fn load_group(&self, id: &GroupId) -> Result<Group, StageError> {
        let mut txn = self.store.begin(true).await?;
        let group = self.store.get_group(&mut txn, id).await?;
        self.store.commit(txn).await?;
        Ok(group)
    }

    /// Hand a message to its validator on the validation pool.
    fn validate_message(self: &Arc<Self>, message: Message, group: Group) {
        let client = group.client_major_version();
        let Some(validator) = self.registry.validator(&client) else {
            tracing::warn!("No validator for {}; message {} left unvalidated", client, message.id);
            return;
        };

        let pipeline = Arc::clone(self);
        self.in_flight.begin();
        tokio::spawn(
            async move {
                pipeline.run_validator(validator, message, group).await;
                pipeline.in_flight.finish();
            }
            .in_current_span(),
        );
    }

    async fn run_validator(&self, validator: Arc<dyn MessageValidator>, message: Message, group: Group) {
        let id = message.id;
        let client = group.client_major_version();
        let outcome = self
            .pool
            .run(move || {
                let result = validator.validate_message(&message, &group);
                (message, result)
            })
            .await;

        match outcome {
            Ok((message, Ok(context))) => self.submit(DbTask::StoreContext {
                message,
                client,
                context,
            }),
            Ok((_, Err(invalid))) => {
                self.report(&id, StageError::Rejected(invalid));
            }
            Err(e) => {
                tracing::warn!("Validator for {} failed on message {}: {}", client, id, e);
            }
        }
    }

    // --- Dependency resolution and delivery ---

    async fn store_context(&self, message: Message, client: ClientMajorVersion, context: MessageContext) {
        match self.store_message_context(&message, &client, &context).await {
            Ok(follow_up) => self.submit_follow_up(follow_up),
            Err(e) => {
                self.report(&message.id, e);
            }
        }
    }

    async fn store_message_context(
        &self,
        message: &Message,
        client: &ClientMajorVersion,
        context: &MessageContext,
    ) -> Result<FollowUp, StageError> {
        let id = &message.id;
        let mut txn = self.store.begin(false).await?;
        let mut follow_up = FollowUp::default();

        // A message validated twice is resolved only once
        let state = self.store.get_message_state(&mut txn, id).await?;
        if state != MessageState::Unknown {
            tracing::debug!("Message {} already resolved ({:?})", id, state);
            return Ok(follow_up);
        }

        let mut summary = DependencySummary::none();
        if !context.dependencies.is_empty() {
            self.store
                .add_message_dependencies(&mut txn, message, &context.dependencies)
                .await?;
            let states = self.store.get_message_dependencies(&mut txn, id).await?;
            summary = DependencySummary::from_states(states.into_values());
        }

        match summary.readiness() {
            Readiness::Invalid => {
                self.apply(&mut txn, id, Verdict::Invalidate, &mut follow_up)
                    .await?;
            }
            Readiness::Waiting => {
                self.store
                    .merge_message_metadata(&mut txn, id, &context.metadata)
                    .await?;
                self.store
                    .set_message_state(&mut txn, id, MessageState::Pending)
                    .await?;
            }
            Readiness::Ready => {
                self.store
                    .merge_message_metadata(&mut txn, id, &context.metadata)
                    .await?;
                let action = self
                    .deliver(&mut txn, message, client, &context.metadata)
                    .await;
                self.apply(&mut txn, id, Verdict::from(action), &mut follow_up)
                    .await?;
            }
        }

        self.store.commit(txn).await?;
        Ok(follow_up)
    }

    async fn deliver_next(&self, mut queue: WorkQueue) {
        let id = next_id(&mut queue);
        let result = self.deliver_pending(&id, &mut queue).await;
        self.continue_with(&id, result, queue, DbTask::DeliverNext);
    }

    /// Re-attempt delivery of a message that was left pending.
    async fn deliver_pending(&self, id: &MessageId, queue: &mut WorkQueue) -> Result<(), StageError> {
        let mut txn = self.store.begin(false).await?;
        let mut follow_up = FollowUp::default();

        if self.store.get_message_state(&mut txn, id).await? == MessageState::Pending {
            let states = self.store.get_message_dependencies(&mut txn, id).await?;
            match DependencySummary::from_states(states.into_values()).readiness() {
                Readiness::Invalid => {
                    self.apply(&mut txn, id, Verdict::Invalidate, &mut follow_up)
                        .await?;
                }
                Readiness::Waiting => {}
                Readiness::Ready => {
                    let message = self.store.get_message(&mut txn, id).await?;
                    let group = self.store.get_group(&mut txn, &message.group_id).await?;
                    let metadata = self
                        .store
                        .get_message_metadata_for_validator(&mut txn, id)
                        .await?;
                    let client = group.client_major_version();
                    let verdict =
                        Verdict::from(self.deliver(&mut txn, &message, &client, &metadata).await);
                    // Already pending
                    if verdict != Verdict::Defer {
                        self.apply(&mut txn, id, verdict, &mut follow_up).await?;
                    }
                }
            }
        }

        self.store.commit(txn).await?;
        queue.extend(std::mem::take(&mut follow_up.deliver));
        self.submit_follow_up(follow_up);
        Ok(())
    }

    /// Ask the client's hook what to do with a ready message.
    async fn deliver(
        &self,
        txn: &mut S::Txn,
        message: &Message,
        client: &ClientMajorVersion,
        metadata: &Metadata,
    ) -> DeliveryAction {
        let Some(hook) = self.registry.hook(client) else {
            return DeliveryAction::AcceptDoNotShare;
        };

        match hook.incoming_message(txn, message, metadata).await {
            Ok(action) => action,
            Err(HookError::Db(e)) => {
                tracing::info!(
                    "Delivery hook for {} failed on message {}, deferring: {}",
                    client,
                    message.id,
                    e
                );
                DeliveryAction::Defer
            }
            Err(HookError::InvalidMessage(e)) => {
                tracing::info!(
                    "Delivery hook for {} rejected message {}: {}",
                    client,
                    message.id,
                    e.reason()
                );
                DeliveryAction::Reject
            }
        }
    }

    /// Apply a verdict inside the current transaction.
    async fn apply(
        &self,
        txn: &mut S::Txn,
        id: &MessageId,
        verdict: Verdict,
        follow_up: &mut FollowUp,
    ) -> DbResult<()> {
        if let Some(state) = verdict.target_state() {
            self.store.set_message_state(txn, id, state).await?;
        }

        match verdict {
            Verdict::Invalidate => {
                self.invalidate(txn, id).await?;
                follow_up
                    .invalidate
                    .extend(self.dependents_to_invalidate(txn, id).await?);
            }
            Verdict::Defer => {}
            Verdict::Deliver { share } => {
                follow_up
                    .deliver
                    .extend(self.pending_dependents(txn, id).await?);
                if share {
                    self.store.set_message_shared(txn, id).await?;
                    let dependencies = self.store.get_message_dependencies(txn, id).await?;
                    follow_up.share.extend(dependencies.into_keys());
                }
            }
        }
        Ok(())
    }

    async fn pending_dependents(&self, txn: &mut S::Txn, id: &MessageId) -> DbResult<Vec<MessageId>> {
        let dependents = self.store.get_message_dependents(txn, id).await?;
        Ok(dependents
            .into_iter()
            .filter(|(_, state)| *state == MessageState::Pending)
            .map(|(id, _)| id)
            .collect())
    }

    // --- Invalidation cascade ---

    async fn invalidate_next(&self, mut queue: WorkQueue) {
        let id = next_id(&mut queue);
        let result = self.invalidate_one(&id, &mut queue).await;
        self.continue_with(&id, result, queue, DbTask::InvalidateNext);
    }

    async fn invalidate_one(&self, id: &MessageId, queue: &mut WorkQueue) -> Result<(), StageError> {
        let mut txn = self.store.begin(false).await?;
        let mut dependents = Vec::new();
        if self.store.get_message_state(&mut txn, id).await? != MessageState::Invalid {
            self.invalidate(&mut txn, id).await?;
            dependents = self.dependents_to_invalidate(&mut txn, id).await?;
        }
        self.store.commit(txn).await?;
        queue.extend(dependents);
        Ok(())
    }

    /// Mark a message invalid and erase its body and metadata.
    async fn invalidate(&self, txn: &mut S::Txn, id: &MessageId) -> DbResult<()> {
        self.store
            .set_message_state(txn, id, MessageState::Invalid)
            .await?;
        self.store.delete_message(txn, id).await?;
        self.store.delete_message_metadata(txn, id).await
    }

    async fn dependents_to_invalidate(
        &self,
        txn: &mut S::Txn,
        id: &MessageId,
    ) -> DbResult<Vec<MessageId>> {
        let dependents = self.store.get_message_dependents(txn, id).await?;
        Ok(dependents
            .into_iter()
            .filter(|(_, state)| *state != MessageState::Invalid)
            .map(|(id, _)| id)
            .collect())
    }

    // --- Sharing cascade ---

    async fn share_next(&self, mut queue: WorkQueue) {
        let id = next_id(&mut queue);
        let result = self.share_one(&id, &mut queue).await;
        self.continue_with(&id, result, queue, DbTask::ShareNext);
    }

    async fn share_one(&self, id: &MessageId, queue: &mut WorkQueue) -> Result<(), StageError> {
        let mut txn = self.store.begin(false).await?;
        self.store.set_message_shared(&mut txn, id).await?;
        let dependencies = self.store.get_message_dependencies(&mut txn, id).await?;
        self.store.commit(txn).await?;
        queue.extend(dependencies.into_keys());
        Ok(())
    }
}

impl<S: MessageStore> EventListener for Pipeline<S> {
    fn event_occurred(&self, event: &Event) {
        // Locally authored messages (no origin) are trusted as-is
        let Event::MessageAdded {
            message,
            origin: Some(contact),
        } = event
        else {
            return;
        };

        if !self.state().accepts_events() {
            tracing::debug!("Ignoring message {}: manager is not running", message.id);
            return;
        }

        tracing::debug!("Message {} received from contact {}", message.id, contact);
        self.submit(DbTask::LoadGroupAndValidate(message.clone()));
    }
}
