//! End-to-end tests of the validation pipeline against SQLite.

use async_trait::async_trait;
use peerlog_sync_validation::{
    Config, HookError, IncomingMessageHook, MessageValidator, ValidationConfig, ValidationManager,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_store::{
    DbError, Event, EventBus, EventListener, MessageStore, SqliteStore, SqliteTransaction,
    StorageConfig,
};
use sync_types::{
    ClientId, ContactId, DeliveryAction, Group, GroupId, InvalidMessage, Message, MessageContext,
    MessageId, MessageState, Metadata,
};
use tracing_subscriber::EnvFilter;

const CLIENT: &str = "org.peerlog.forum";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// --- Scripted clients ---

/// Validator whose answer is scripted per message. Unscripted messages are
/// accepted with no dependencies.
#[derive(Default)]
struct ScriptedValidator {
    script: Mutex<HashMap<MessageId, Result<MessageContext, InvalidMessage>>>,
    calls: Mutex<Vec<MessageId>>,
}

impl ScriptedValidator {
    fn depends_on(&self, message: &Message, dependencies: &[&Message]) {
        let context = MessageContext::with_dependencies(
            Metadata::new().with("validated", b"yes".to_vec()),
            dependencies.iter().map(|d| d.id),
        );
        self.script.lock().unwrap().insert(message.id, Ok(context));
    }

    fn reject(&self, message: &Message) {
        self.script
            .lock()
            .unwrap()
            .insert(message.id, Err(InvalidMessage::new("bad signature")));
    }

    fn calls(&self) -> Vec<MessageId> {
        self.calls.lock().unwrap().clone()
    }
}

impl MessageValidator for ScriptedValidator {
    fn validate_message(
        &self,
        message: &Message,
        _group: &Group,
    ) -> Result<MessageContext, InvalidMessage> {
        self.calls.lock().unwrap().push(message.id);
        self.script
            .lock()
            .unwrap()
            .get(&message.id)
            .cloned()
            .unwrap_or_else(|| {
                Ok(MessageContext::new(
                    Metadata::new().with("validated", b"yes".to_vec()),
                ))
            })
    }
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Action(DeliveryAction),
    StorageFailure,
    Invalid,
}

/// Delivery hook whose answer is scripted per message.
struct ScriptedHook {
    default: DeliveryAction,
    script: Mutex<HashMap<MessageId, Reply>>,
    calls: Mutex<Vec<(MessageId, Metadata)>>,
}

impl ScriptedHook {
    fn new(default: DeliveryAction) -> Self {
        Self {
            default,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn reply(&self, message: &Message, reply: Reply) {
        self.script.lock().unwrap().insert(message.id, reply);
    }

    fn calls_for(&self, message: &Message) -> Vec<Metadata> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == message.id)
            .map(|(_, metadata)| metadata.clone())
            .collect()
    }
}

#[async_trait]
impl IncomingMessageHook<SqliteStore> for ScriptedHook {
    async fn incoming_message(
        &self,
        _txn: &mut SqliteTransaction,
        message: &Message,
        metadata: &Metadata,
    ) -> Result<DeliveryAction, HookError> {
        self.calls
            .lock()
            .unwrap()
            .push((message.id, metadata.clone()));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get(&message.id)
            .copied()
            .unwrap_or(Reply::Action(self.default));

        match reply {
            Reply::Action(action) => Ok(action),
            Reply::StorageFailure => Err(DbError::Corrupt("simulated failure".into()).into()),
            Reply::Invalid => Err(InvalidMessage::new("unexpected author").into()),
        }
    }
}

/// Delivery hook that removes another group while delivering one message.
struct GroupRemovingHook {
    store: Arc<SqliteStore>,
    trigger: MessageId,
    victim: GroupId,
}

#[async_trait]
impl IncomingMessageHook<SqliteStore> for GroupRemovingHook {
    async fn incoming_message(
        &self,
        txn: &mut SqliteTransaction,
        message: &Message,
        _metadata: &Metadata,
    ) -> Result<DeliveryAction, HookError> {
        if message.id == self.trigger {
            self.store.remove_group(txn, &self.victim).await?;
        }
        Ok(DeliveryAction::AcceptDoNotShare)
    }
}

/// Records state transitions broadcast on the bus.
#[derive(Default)]
struct StateLog {
    changes: Mutex<Vec<(MessageId, MessageState)>>,
}

impl StateLog {
    fn count(&self, message: &Message, state: MessageState) -> usize {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, s)| *id == message.id && *s == state)
            .count()
    }
}

impl EventListener for StateLog {
    fn event_occurred(&self, event: &Event) {
        if let Event::MessageStateChanged { message_id, state } = event {
            self.changes.lock().unwrap().push((*message_id, *state));
        }
    }
}

// --- Harness ---

struct Harness {
    store: Arc<SqliteStore>,
    bus: EventBus,
    manager: ValidationManager<SqliteStore>,
    validator: Arc<ScriptedValidator>,
    hook: Arc<ScriptedHook>,
    group: Group,
}

impl Harness {
    /// A manager with a scripted validator and hook, not yet started.
    async fn new(default_action: DeliveryAction) -> Self {
        init_logging();
        let bus = EventBus::new();
        let store = Arc::new(SqliteStore::in_memory(bus.clone()).await.unwrap());
        let manager = ValidationManager::new(
            Arc::clone(&store),
            &bus,
            &ValidationConfig { threads: Some(2) },
        );

        let validator = Arc::new(ScriptedValidator::default());
        let hook = Arc::new(ScriptedHook::new(default_action));
        manager.register_message_validator(ClientId::new(CLIENT), 1, validator.clone());
        manager.register_incoming_message_hook(ClientId::new(CLIENT), 1, hook.clone());

        let group = Group::new(ClientId::new(CLIENT), 1, b"general".to_vec());
        let harness = Self {
            store,
            bus,
            manager,
            validator,
            hook,
            group,
        };
        harness.add_group(&harness.group).await;
        harness
    }

    async fn started(default_action: DeliveryAction) -> Self {
        let harness = Self::new(default_action).await;
        harness.manager.start().unwrap();
        harness.settle().await;
        harness
    }

    async fn settle(&self) {
        self.manager.wait_idle().await;
    }

    fn message(&self, n: u64) -> Message {
        self.message_in(&self.group, n)
    }

    fn message_in(&self, group: &Group, n: u64) -> Message {
        Message::new(group.id, n, format!("post #{}", n).into_bytes())
    }

    async fn add_group(&self, group: &Group) {
        let mut txn = self.store.begin(false).await.unwrap();
        self.store.add_group(&mut txn, group).await.unwrap();
        self.store.commit(txn).await.unwrap();
    }

    async fn receive(&self, message: &Message) {
        let mut txn = self.store.begin(false).await.unwrap();
        assert!(self
            .store
            .receive_message(&mut txn, message, ContactId::new(1))
            .await
            .unwrap());
        self.store.commit(txn).await.unwrap();
    }

    async fn add_local(&self, message: &Message, shared: bool) {
        let mut txn = self.store.begin(false).await.unwrap();
        self.store
            .add_local_message(&mut txn, message, &Metadata::new(), shared)
            .await
            .unwrap();
        self.store.commit(txn).await.unwrap();
    }

    /// Store a received message as validated and pending.
    async fn add_pending(&self, message: &Message, dependencies: &[&Message]) {
        let mut txn = self.store.begin(false).await.unwrap();
        self.store
            .receive_message(&mut txn, message, ContactId::new(1))
            .await
            .unwrap();
        self.store
            .add_message_dependencies(
                &mut txn,
                message,
                &dependencies.iter().map(|d| d.id).collect(),
            )
            .await
            .unwrap();
        self.store
            .set_message_state(&mut txn, &message.id, MessageState::Pending)
            .await
            .unwrap();
        self.store.commit(txn).await.unwrap();
    }

    async fn state(&self, message: &Message) -> MessageState {
        let mut txn = self.store.begin(true).await.unwrap();
        self.store
            .get_message_state(&mut txn, &message.id)
            .await
            .unwrap()
    }

    async fn shared(&self, message: &Message) -> bool {
        let mut txn = self.store.begin(true).await.unwrap();
        self.store
            .is_message_shared(&mut txn, &message.id)
            .await
            .unwrap()
    }
}

// --- Scenarios ---

#[tokio::test]
async fn accept_share_delivers_and_shares() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let x = h.message(1);

    h.receive(&x).await;
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Delivered);
    assert!(h.shared(&x).await);
    assert_eq!(
        h.hook.calls_for(&x),
        vec![Metadata::new().with("validated", b"yes".to_vec())]
    );
}

#[tokio::test]
async fn accept_do_not_share_delivers_without_sharing() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let x = h.message(1);

    h.receive(&x).await;
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Delivered);
    assert!(!h.shared(&x).await);
}

#[tokio::test]
async fn dependent_waits_for_dependency_delivery() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let x = h.message(1);
    let y = h.message(2);
    h.validator.depends_on(&y, &[&x]);

    h.receive(&y).await;
    h.settle().await;
    assert_eq!(h.state(&y).await, MessageState::Pending);
    assert!(h.hook.calls_for(&y).is_empty());

    h.receive(&x).await;
    h.settle().await;
    assert_eq!(h.state(&x).await, MessageState::Delivered);
    assert_eq!(h.state(&y).await, MessageState::Delivered);

    // The re-attempt reads the metadata stored at validation time
    assert_eq!(
        h.hook.calls_for(&y),
        vec![Metadata::new().with("validated", b"yes".to_vec())]
    );
}

#[tokio::test]
async fn invalid_dependency_cascades_to_pending_dependent() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let x = h.message(1);
    let z = h.message(2);
    h.validator.depends_on(&z, &[&x]);
    h.validator.reject(&x);

    h.receive(&z).await;
    h.settle().await;
    assert_eq!(h.state(&z).await, MessageState::Pending);

    h.receive(&x).await;
    h.settle().await;
    assert_eq!(h.state(&x).await, MessageState::Invalid);
    assert_eq!(h.state(&z).await, MessageState::Invalid);
    assert!(h.hook.calls_for(&z).is_empty());

    // Body and metadata are erased
    let mut txn = h.store.begin(true).await.unwrap();
    assert!(matches!(
        h.store.get_message(&mut txn, &z.id).await,
        Err(DbError::MessageDeleted(_))
    ));
    assert!(h
        .store
        .get_message_metadata_for_validator(&mut txn, &z.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn dependent_of_invalid_message_is_invalid_on_arrival() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let x = h.message(1);
    let z = h.message(2);
    h.validator.reject(&x);
    h.validator.depends_on(&z, &[&x]);

    h.receive(&x).await;
    h.settle().await;
    assert_eq!(h.state(&x).await, MessageState::Invalid);

    h.receive(&z).await;
    h.settle().await;
    assert_eq!(h.state(&z).await, MessageState::Invalid);
    assert!(h.hook.calls_for(&z).is_empty());
}

#[tokio::test]
async fn deferred_message_stays_pending() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let w = h.message(1);
    let dependent = h.message(2);
    h.hook.reply(&w, Reply::Action(DeliveryAction::Defer));
    h.validator.depends_on(&dependent, &[&w]);

    h.receive(&w).await;
    h.receive(&dependent).await;
    h.settle().await;

    assert_eq!(h.state(&w).await, MessageState::Pending);
    assert_eq!(h.state(&dependent).await, MessageState::Pending);
    assert_eq!(h.hook.calls_for(&w).len(), 1);

    // Nothing re-schedules a deferred message
    tokio::task::yield_now().await;
    h.settle().await;
    assert_eq!(h.state(&w).await, MessageState::Pending);
    assert_eq!(h.hook.calls_for(&w).len(), 1);
}

#[tokio::test]
async fn hook_rejection_invalidates_message() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let x = h.message(1);
    h.hook.reply(&x, Reply::Invalid);

    h.receive(&x).await;
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Invalid);
    assert!(!h.shared(&x).await);
}

#[tokio::test]
async fn hook_storage_error_defers_message() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let x = h.message(1);
    h.hook.reply(&x, Reply::StorageFailure);

    h.receive(&x).await;
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Pending);
}

#[tokio::test]
async fn missing_hook_delivers_without_sharing() {
    init_logging();
    let bus = EventBus::new();
    let store = Arc::new(SqliteStore::in_memory(bus.clone()).await.unwrap());
    let manager = ValidationManager::new(Arc::clone(&store), &bus, &ValidationConfig::default());
    manager.register_message_validator(
        ClientId::new(CLIENT),
        1,
        Arc::new(ScriptedValidator::default()),
    );
    manager.start().unwrap();

    let group = Group::new(ClientId::new(CLIENT), 1, b"no-hook".to_vec());
    let message = Message::new(group.id, 1, b"hello".to_vec());
    let mut txn = store.begin(false).await.unwrap();
    store.add_group(&mut txn, &group).await.unwrap();
    store
        .receive_message(&mut txn, &message, ContactId::new(3))
        .await
        .unwrap();
    store.commit(txn).await.unwrap();
    manager.wait_idle().await;

    let mut txn = store.begin(true).await.unwrap();
    assert_eq!(
        store.get_message_state(&mut txn, &message.id).await.unwrap(),
        MessageState::Delivered
    );
    assert!(!store.is_message_shared(&mut txn, &message.id).await.unwrap());
}

// --- Cascades ---

#[tokio::test]
async fn invalidation_reaches_exactly_the_transitive_dependents() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let x = h.message(1);
    let y = h.message(2);
    let z = h.message(3);
    let u = h.message(4);
    let w = h.message(5);
    h.validator.reject(&x);
    h.validator.depends_on(&y, &[&x]);
    h.validator.depends_on(&z, &[&y]);
    h.validator.depends_on(&w, &[&u]);

    for message in [&y, &z, &u, &w] {
        h.receive(message).await;
    }
    h.settle().await;
    assert_eq!(h.state(&y).await, MessageState::Pending);
    assert_eq!(h.state(&z).await, MessageState::Pending);
    assert_eq!(h.state(&w).await, MessageState::Delivered);

    h.receive(&x).await;
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Invalid);
    assert_eq!(h.state(&y).await, MessageState::Invalid);
    assert_eq!(h.state(&z).await, MessageState::Invalid);
    assert_eq!(h.state(&u).await, MessageState::Delivered);
    assert_eq!(h.state(&w).await, MessageState::Delivered);
}

#[tokio::test]
async fn invalidating_an_invalid_message_is_a_noop() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let log = Arc::new(StateLog::default());
    h.bus.add_listener(log.clone());

    let x = h.message(1);
    let y = h.message(2);
    let z = h.message(3);
    h.validator.reject(&x);
    h.validator.depends_on(&y, &[&x]);
    h.validator.depends_on(&z, &[&x]);

    h.receive(&x).await;
    h.settle().await;
    h.receive(&y).await;
    h.receive(&z).await;
    h.settle().await;

    assert_eq!(h.state(&y).await, MessageState::Invalid);
    assert_eq!(h.state(&z).await, MessageState::Invalid);
    assert_eq!(log.count(&x, MessageState::Invalid), 1);
    assert_eq!(log.count(&y, MessageState::Invalid), 1);
    assert_eq!(log.count(&z, MessageState::Invalid), 1);
}

#[tokio::test]
async fn diamond_dependent_is_delivered_once() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let a = h.message(1);
    let b = h.message(2);
    let c = h.message(3);
    let d = h.message(4);
    h.validator.depends_on(&b, &[&a]);
    h.validator.depends_on(&c, &[&a]);
    h.validator.depends_on(&d, &[&b, &c]);

    for message in [&d, &b, &c] {
        h.receive(message).await;
    }
    h.settle().await;
    for message in [&b, &c, &d] {
        assert_eq!(h.state(message).await, MessageState::Pending);
    }

    h.receive(&a).await;
    h.settle().await;

    for message in [&a, &b, &c, &d] {
        assert_eq!(h.state(message).await, MessageState::Delivered);
    }
    assert_eq!(h.hook.calls_for(&d).len(), 1);
}

#[tokio::test]
async fn only_ready_dependents_are_delivered() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let b = h.message(1);
    let missing = h.message(2);
    let d = h.message(3);
    h.validator.depends_on(&d, &[&b, &missing]);

    h.receive(&d).await;
    h.receive(&b).await;
    h.settle().await;

    assert_eq!(h.state(&b).await, MessageState::Delivered);
    assert_eq!(h.state(&d).await, MessageState::Pending);
    assert!(h.hook.calls_for(&d).is_empty());
}

#[tokio::test]
async fn dependency_in_another_group_never_resolves() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let other = Group::new(ClientId::new(CLIENT), 1, b"other".to_vec());
    h.add_group(&other).await;

    let foreign = h.message_in(&other, 1);
    let dependent = h.message(2);
    h.validator.depends_on(&dependent, &[&foreign]);

    h.receive(&foreign).await;
    h.receive(&dependent).await;
    h.settle().await;

    assert_eq!(h.state(&foreign).await, MessageState::Delivered);
    assert_eq!(h.state(&dependent).await, MessageState::Pending);
}

#[tokio::test]
async fn sharing_cascades_to_transitive_dependencies() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let a = h.message(1);
    let b = h.message(2);
    let c = h.message(3);
    let unrelated = h.message(4);
    h.validator.depends_on(&b, &[&a]);
    h.validator.depends_on(&c, &[&b]);
    h.hook.reply(&c, Reply::Action(DeliveryAction::AcceptShare));

    for message in [&a, &b, &unrelated] {
        h.receive(message).await;
        h.settle().await;
    }
    assert!(!h.shared(&a).await);
    assert!(!h.shared(&b).await);

    h.receive(&c).await;
    h.settle().await;

    assert!(h.shared(&c).await);
    assert!(h.shared(&b).await);
    assert!(h.shared(&a).await);
    assert!(!h.shared(&unrelated).await);
}

#[tokio::test]
async fn invalid_dependency_invalidates_delivered_dependents() {
    let h = Harness::new(DeliveryAction::AcceptDoNotShare).await;
    let w = h.message(1);
    let x = h.message(2);
    let z = h.message(3);

    h.receive(&w).await;
    let mut txn = h.store.begin(false).await.unwrap();
    h.store
        .set_message_state(&mut txn, &w.id, MessageState::Invalid)
        .await
        .unwrap();
    h.store.commit(txn).await.unwrap();
    h.add_pending(&x, &[&w]).await;

    // Delivered before its dependency was resolved
    h.add_local(&z, false).await;
    let mut txn = h.store.begin(false).await.unwrap();
    h.store
        .add_message_dependencies(&mut txn, &z, &[x.id].into_iter().collect())
        .await
        .unwrap();
    h.store.commit(txn).await.unwrap();

    h.manager.start().unwrap();
    h.settle().await;

    assert_eq!(h.state(&x).await, MessageState::Invalid);
    assert_eq!(h.state(&z).await, MessageState::Invalid);
    assert!(h.hook.calls_for(&x).is_empty());
    let mut txn = h.store.begin(true).await.unwrap();
    assert!(matches!(
        h.store.get_message(&mut txn, &z.id).await,
        Err(DbError::MessageDeleted(_))
    ));
}

// --- Event path ---

#[tokio::test]
async fn local_messages_are_not_validated() {
    let h = Harness::started(DeliveryAction::AcceptShare).await;
    let local = h.message(1);

    h.add_local(&local, false).await;
    h.settle().await;

    assert!(h.validator.calls().is_empty());
    assert!(h.hook.calls_for(&local).is_empty());
    assert_eq!(h.state(&local).await, MessageState::Delivered);
}

#[tokio::test]
async fn message_validated_twice_is_delivered_once() {
    let h = Harness::new(DeliveryAction::AcceptShare).await;
    let x = h.message(1);
    h.receive(&x).await;

    // Both the startup sweep and the event pick the message up
    h.manager.start().unwrap();
    h.bus.broadcast(&Event::MessageAdded {
        message: x.clone(),
        origin: Some(ContactId::new(2)),
    });
    h.settle().await;

    assert_eq!(h.validator.calls(), vec![x.id, x.id]);
    assert_eq!(h.hook.calls_for(&x).len(), 1);
    assert_eq!(h.state(&x).await, MessageState::Delivered);
    assert!(h.shared(&x).await);
}

#[tokio::test]
async fn message_in_removed_group_is_skipped() {
    let h = Harness::started(DeliveryAction::AcceptDoNotShare).await;
    let doomed = Group::new(ClientId::new(CLIENT), 1, b"doomed".to_vec());
    let orphan = h.message_in(&doomed, 1);

    // The group disappears before the manager gets to the message
    let mut txn = h.store.begin(false).await.unwrap();
    h.store.add_group(&mut txn, &doomed).await.unwrap();
    h.store
        .receive_message(&mut txn, &orphan, ContactId::new(1))
        .await
        .unwrap();
    h.store.remove_group(&mut txn, &doomed.id).await.unwrap();
    h.store.commit(txn).await.unwrap();
    h.settle().await;
    assert!(h.validator.calls().is_empty());

    let next = h.message(2);
    h.receive(&next).await;
    h.settle().await;
    assert_eq!(h.validator.calls(), vec![next.id]);
    assert_eq!(h.state(&next).await, MessageState::Delivered);
}

// --- Startup recovery ---

#[tokio::test]
async fn startup_sweeps_resume_unfinished_work() {
    let h = Harness::new(DeliveryAction::AcceptDoNotShare).await;

    // Received while the manager was not running
    let unvalidated = h.message(1);
    h.receive(&unvalidated).await;

    // Validated, waiting on a dependency that has since been delivered
    let dependency = h.message(2);
    let pending = h.message(3);
    h.add_local(&dependency, false).await;
    h.add_pending(&pending, &[&dependency]).await;

    // Shared, but its dependency was never marked shared
    let unshared = h.message(4);
    let shared = h.message(5);
    h.add_local(&unshared, false).await;
    h.add_local(&shared, true).await;
    let mut txn = h.store.begin(false).await.unwrap();
    h.store
        .add_message_dependencies(&mut txn, &shared, &[unshared.id].into_iter().collect())
        .await
        .unwrap();
    h.store.commit(txn).await.unwrap();

    h.settle().await;
    assert!(h.validator.calls().is_empty());

    h.manager.start().unwrap();
    h.settle().await;

    assert_eq!(h.validator.calls(), vec![unvalidated.id]);
    assert_eq!(h.state(&unvalidated).await, MessageState::Delivered);
    assert_eq!(h.state(&pending).await, MessageState::Delivered);
    assert!(h.shared(&unshared).await);
}

#[tokio::test]
async fn delivery_sweep_continues_past_removed_group() {
    let h = Harness::new(DeliveryAction::AcceptDoNotShare).await;
    let doomed = Group::new(ClientId::new(CLIENT), 1, b"doomed".to_vec());
    h.add_group(&doomed).await;

    let first = h.message(1);
    let orphan = h.message_in(&doomed, 2);
    let last = h.message(3);
    h.add_pending(&first, &[]).await;
    h.add_pending(&orphan, &[]).await;
    h.add_pending(&last, &[]).await;

    // Delivering the first message removes the orphan's group
    h.manager.register_incoming_message_hook(
        ClientId::new(CLIENT),
        1,
        Arc::new(GroupRemovingHook {
            store: Arc::clone(&h.store),
            trigger: first.id,
            victim: doomed.id,
        }),
    );

    h.manager.start().unwrap();
    h.settle().await;

    assert_eq!(h.state(&first).await, MessageState::Delivered);
    assert_eq!(h.state(&last).await, MessageState::Delivered);
    let mut txn = h.store.begin(true).await.unwrap();
    assert!(!h.store.contains_message(&mut txn, &orphan.id).await.unwrap());
}

#[tokio::test]
async fn restart_completes_work_left_in_database_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        storage: StorageConfig {
            database: dir.path().join("peerlog.db"),
            ..StorageConfig::default()
        },
        validation: ValidationConfig { threads: Some(1) },
    };
    let group = Group::new(ClientId::new(CLIENT), 1, b"general".to_vec());
    let x = Message::new(group.id, 1, b"first".to_vec());
    let y = Message::new(group.id, 2, b"second".to_vec());

    // First run: messages arrive, the process stops before validating them
    {
        let (store, manager) = peerlog_sync_validation::open(&config).await.unwrap();
        let mut txn = store.begin(false).await.unwrap();
        store.add_group(&mut txn, &group).await.unwrap();
        store
            .receive_message(&mut txn, &y, ContactId::new(1))
            .await
            .unwrap();
        store
            .receive_message(&mut txn, &x, ContactId::new(1))
            .await
            .unwrap();
        store.commit(txn).await.unwrap();
        drop(manager);
    }

    // Second run
    let (store, manager) = peerlog_sync_validation::open(&config).await.unwrap();
    let validator = Arc::new(ScriptedValidator::default());
    validator.depends_on(&y, &[&x]);
    manager.register_message_validator(ClientId::new(CLIENT), 1, validator.clone());
    manager.register_incoming_message_hook(
        ClientId::new(CLIENT),
        1,
        Arc::new(ScriptedHook::new(DeliveryAction::AcceptShare)),
    );
    manager.start().unwrap();
    manager.wait_idle().await;

    let mut txn = store.begin(true).await.unwrap();
    for message in [&x, &y] {
        assert_eq!(
            store.get_message_state(&mut txn, &message.id).await.unwrap(),
            MessageState::Delivered
        );
        assert!(store.is_message_shared(&mut txn, &message.id).await.unwrap());
    }
    assert_eq!(validator.calls().len(), 2);
}

#[tokio::test]
async fn pending_message_is_delivered_while_application_writes() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        storage: StorageConfig {
            database: dir.path().join("peerlog.db"),
            ..StorageConfig::default()
        },
        validation: ValidationConfig { threads: Some(1) },
    };
    let (store, manager) = peerlog_sync_validation::open(&config).await.unwrap();
    manager.register_message_validator(
        ClientId::new(CLIENT),
        1,
        Arc::new(ScriptedValidator::default()),
    );

    let group = Group::new(ClientId::new(CLIENT), 1, b"general".to_vec());
    let dependency = Message::new(group.id, 1, b"first".to_vec());
    let pending = Message::new(group.id, 2, b"second".to_vec());
    let mut txn = store.begin(false).await.unwrap();
    store.add_group(&mut txn, &group).await.unwrap();
    store
        .add_local_message(&mut txn, &dependency, &Metadata::new(), false)
        .await
        .unwrap();
    store
        .receive_message(&mut txn, &pending, ContactId::new(1))
        .await
        .unwrap();
    store
        .add_message_dependencies(&mut txn, &pending, &[dependency.id].into_iter().collect())
        .await
        .unwrap();
    store
        .set_message_state(&mut txn, &pending.id, MessageState::Pending)
        .await
        .unwrap();
    store.commit(txn).await.unwrap();

    // The application holds the write lock while the delivery sweep runs
    let mut held = store.begin(false).await.unwrap();
    let other = Group::new(ClientId::new(CLIENT), 1, b"other".to_vec());
    store.add_group(&mut held, &other).await.unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.commit(held).await.unwrap();
    manager.wait_idle().await;

    let mut txn = store.begin(true).await.unwrap();
    assert_eq!(
        store.get_message_state(&mut txn, &pending.id).await.unwrap(),
        MessageState::Delivered
    );
}
