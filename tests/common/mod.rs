#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Mutex};

use msgstore::{
    DataSlice, Item, ItemKind, ItemRegistry, LinkId, ManualClock, MemoryStore, MessageStore,
    Result, StorageStrategy, StoreError, StoreOptions, Transaction, WatermarkBreach,
};

pub const START_MS: u64 = 1_000_000;

/// Shared log of item events, in the order they fired.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn strategy_code(strategy: StorageStrategy) -> u8 {
    strategy as u8
}

fn strategy_from(code: u8) -> StorageStrategy {
    match code {
        1 => StorageStrategy::Never,
        2 => StorageStrategy::Maybe,
        3 => StorageStrategy::Eventually,
        _ => StorageStrategy::Always,
    }
}

/// A message payload with knobs for every item hook the link uses.
pub struct Message {
    body: String,
    priority: u8,
    strategy: StorageStrategy,
    max_time: Option<u64>,
    delay: Option<u64>,
    silent: bool,
    fail_encode: bool,
    veto_expiry: bool,
    events: Events,
}

impl Message {
    pub fn new(events: &Events, body: &str) -> Self {
        Self {
            body: body.to_string(),
            priority: 5,
            strategy: StorageStrategy::Always,
            max_time: None,
            delay: None,
            silent: false,
            fail_encode: false,
            veto_expiry: false,
            events: events.clone(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn strategy(mut self, strategy: StorageStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn expires_after(mut self, ms: u64) -> Self {
        self.max_time = Some(ms);
        self
    }

    pub fn delayed(mut self, ms: u64) -> Self {
        self.delay = Some(ms);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn failing_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    pub fn vetoing_expiry(mut self) -> Self {
        self.veto_expiry = true;
        self
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_item(self) -> Arc<dyn Item> {
        Arc::new(self)
    }

    fn record(&self, event: &str) {
        self.events.push(format!("{event}:{}", self.body));
    }
}

/// Body of a message payload.
pub fn body_of(item: &Arc<dyn Item>) -> Option<String> {
    item.as_any()
        .downcast_ref::<Message>()
        .map(|m| m.body.clone())
}

impl Item for Message {
    fn type_name(&self) -> &str {
        "message"
    }

    fn storage_strategy(&self) -> StorageStrategy {
        self.strategy
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn maximum_time_in_store(&self) -> Option<u64> {
        self.max_time
    }

    fn delivery_delay(&self) -> Option<u64> {
        self.delay
    }

    fn can_expire_silently(&self) -> bool {
        self.silent
    }

    fn in_memory_size(&self) -> usize {
        64 + self.body.len()
    }

    fn persistent_data(&self) -> Result<Vec<DataSlice>> {
        if self.fail_encode {
            return Err(StoreError::PersistentDataEncoding(format!(
                "cannot encode {}",
                self.body
            )));
        }
        Ok(vec![
            DataSlice::from(vec![self.priority, strategy_code(self.strategy)]),
            DataSlice::from(self.body.clone().into_bytes()),
        ])
    }

    fn restore(&mut self, data: &[DataSlice]) -> Result<()> {
        let [header, body] = data else {
            return Err(StoreError::PersistentDataEncoding("expected two slices".into()));
        };
        if header.len() != 2 {
            return Err(StoreError::PersistentDataEncoding("bad header".into()));
        }
        self.priority = header[0];
        self.strategy = strategy_from(header[1]);
        self.body = String::from_utf8(body.to_vec())
            .map_err(|e| StoreError::PersistentDataEncoding(e.to_string()))?;
        Ok(())
    }

    fn event_precommit_add(&self, _tran: &Transaction) -> Result<()> {
        self.record("precommit-add");
        Ok(())
    }

    fn event_post_commit_add(&self) {
        self.record("post-commit-add");
    }

    fn event_post_commit_remove(&self) {
        self.record("post-commit-remove");
    }

    fn event_post_rollback_add(&self) {
        self.record("post-rollback-add");
    }

    fn event_post_rollback_remove(&self) {
        self.record("post-rollback-remove");
    }

    fn event_unlocked(&self) {
        self.record("unlocked");
    }

    fn event_expiry_notification(&self, _tran: &Transaction) -> Result<()> {
        self.record("expiry");
        if self.veto_expiry {
            return Err(StoreError::InvalidArgument("expiry vetoed".into()));
        }
        Ok(())
    }

    fn event_restored(&self) {
        self.record("restored");
    }

    fn event_references_dropped_to_zero(&self) {
        self.record("refs-zero");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Payload of item and reference streams.
pub struct Stream {
    name: String,
    kind: ItemKind,
    strategy: StorageStrategy,
    events: Events,
}

impl Stream {
    pub fn items(events: &Events, name: &str) -> Arc<dyn Item> {
        Arc::new(Self {
            name: name.to_string(),
            kind: ItemKind::ItemStream,
            strategy: StorageStrategy::Always,
            events: events.clone(),
        })
    }

    pub fn references(events: &Events, name: &str) -> Arc<dyn Item> {
        Arc::new(Self {
            name: name.to_string(),
            kind: ItemKind::ReferenceStream,
            strategy: StorageStrategy::Always,
            events: events.clone(),
        })
    }

    pub fn with_strategy(events: &Events, name: &str, strategy: StorageStrategy) -> Arc<dyn Item> {
        Arc::new(Self {
            name: name.to_string(),
            kind: ItemKind::ItemStream,
            strategy,
            events: events.clone(),
        })
    }
}

impl Item for Stream {
    fn type_name(&self) -> &str {
        match self.kind {
            ItemKind::ReferenceStream => "reference-stream",
            _ => "stream",
        }
    }

    fn kind(&self) -> ItemKind {
        self.kind
    }

    fn storage_strategy(&self) -> StorageStrategy {
        self.strategy
    }

    fn in_memory_size(&self) -> usize {
        32 + self.name.len()
    }

    fn persistent_data(&self) -> Result<Vec<DataSlice>> {
        Ok(vec![DataSlice::from(self.name.clone().into_bytes())])
    }

    fn restore(&mut self, data: &[DataSlice]) -> Result<()> {
        let bytes: Vec<u8> = data.iter().flat_map(|s| s.iter().copied()).collect();
        self.name =
            String::from_utf8(bytes).map_err(|e| StoreError::PersistentDataEncoding(e.to_string()))?;
        Ok(())
    }

    fn event_watermark_breached(&self, breach: WatermarkBreach) {
        self.events.push(format!("watermark:{}:{breach:?}", self.name));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An item reference pointing at a message.
pub struct Reference {
    target: Option<LinkId>,
}

impl Reference {
    pub fn to(target: LinkId) -> Arc<dyn Item> {
        Arc::new(Self {
            target: Some(target),
        })
    }
}

impl Item for Reference {
    fn type_name(&self) -> &str {
        "reference"
    }

    fn kind(&self) -> ItemKind {
        ItemKind::ItemReference
    }

    fn in_memory_size(&self) -> usize {
        16
    }

    fn persistent_data(&self) -> Result<Vec<DataSlice>> {
        let target = self.target.map(|id| id.0).unwrap_or_default();
        Ok(vec![DataSlice::from(target.to_be_bytes().to_vec())])
    }

    fn restore(&mut self, data: &[DataSlice]) -> Result<()> {
        let bytes: Vec<u8> = data.iter().flat_map(|s| s.iter().copied()).collect();
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::PersistentDataEncoding("bad reference".into()))?;
        self.target = Some(LinkId(u64::from_be_bytes(raw)));
        Ok(())
    }

    fn referred_id(&self) -> Option<LinkId> {
        self.target
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry that rebuilds every test payload, recording into `events`.
pub fn registry(events: &Events) -> ItemRegistry {
    let mut registry = ItemRegistry::new();
    let message_events = events.clone();
    registry.register("message", move || Box::new(Message::new(&message_events, "")));
    let stream_events = events.clone();
    registry.register("stream", move || {
        Box::new(Stream {
            name: String::new(),
            kind: ItemKind::ItemStream,
            strategy: StorageStrategy::Always,
            events: stream_events.clone(),
        })
    });
    let reference_stream_events = events.clone();
    registry.register("reference-stream", move || {
        Box::new(Stream {
            name: String::new(),
            kind: ItemKind::ReferenceStream,
            strategy: StorageStrategy::Always,
            events: reference_stream_events.clone(),
        })
    });
    registry.register("reference", || Box::new(Reference { target: None }));
    registry
}

/// A store over fresh memory persistence with a manual clock.
pub struct Harness {
    pub store: MessageStore,
    pub persistence: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub events: Events,
}

impl Harness {
    pub fn new() -> Result<Self> {
        let (options, clock) = StoreOptions::for_tests(START_MS);
        Self::with_options(options, clock)
    }

    pub fn with_options(options: StoreOptions, clock: Arc<ManualClock>) -> Result<Self> {
        let events = Events::default();
        let persistence = Arc::new(MemoryStore::new());
        let store = MessageStore::open(options, persistence.clone(), registry(&events))?;
        Ok(Self {
            store,
            persistence,
            clock,
            events,
        })
    }

    /// Reopens over a copy of the durable contents, as after a restart.
    pub fn restart(&self) -> Result<Self> {
        let (options, clock) = StoreOptions::for_tests(self.clock_now());
        let events = Events::default();
        let persistence = Arc::new(self.persistence.reopen());
        let store = MessageStore::open(options, persistence.clone(), registry(&events))?;
        Ok(Self {
            store,
            persistence,
            clock,
            events,
        })
    }

    pub fn clock_now(&self) -> u64 {
        use msgstore::Clock;
        self.clock.now_millis()
    }

    /// Adds and commits an item stream under the root.
    pub fn stream(&self, name: &str) -> Result<Arc<msgstore::Link>> {
        let tran = self.store.begin();
        let stream = self
            .store
            .root()
            .add(Stream::items(&self.events, name), msgstore::LockId::NONE, &tran)?;
        tran.commit()?;
        Ok(stream)
    }

    /// Adds and commits one message.
    pub fn put(&self, stream: &Arc<msgstore::Link>, message: Message) -> Result<Arc<msgstore::Link>> {
        let tran = self.store.begin();
        let link = stream.add(message.into_item(), msgstore::LockId::NONE, &tran)?;
        tran.commit()?;
        Ok(link)
    }
}
