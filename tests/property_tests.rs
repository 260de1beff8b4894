mod common;

use std::sync::Arc;

use common::{registry, Events, Harness, Message, Stream, START_MS};
use msgstore::{
    Item, ItemKind, ItemLinkState, Link, LinkId, LockId, MemoryStore, MessageStore, PersistOp,
    PersistentStore, StoreOptions, TranId, Tuple,
};
use proptest::prelude::*;

const LOCK: LockId = LockId(7);

#[derive(Debug, Clone)]
enum Operation {
    Add { priority: u8, locked: bool, commit: bool },
    Lock { index: usize },
    Unlock { index: usize },
    Remove { index: usize, commit: bool },
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (0u8..=9, any::<bool>(), any::<bool>())
            .prop_map(|(priority, locked, commit)| Operation::Add { priority, locked, commit }),
        2 => any::<usize>().prop_map(|index| Operation::Lock { index }),
        2 => any::<usize>().prop_map(|index| Operation::Unlock { index }),
        2 => (any::<usize>(), any::<bool>())
            .prop_map(|(index, commit)| Operation::Remove { index, commit }),
    ]
}

struct Model {
    links: Vec<(Arc<Link>, bool)>,
}

impl Model {
    fn pick(&self, index: usize) -> Option<usize> {
        (!self.links.is_empty()).then(|| index % self.links.len())
    }

    fn locked(&self) -> u64 {
        self.links.iter().filter(|(_, locked)| *locked).count() as u64
    }
}

fn apply(h: &Harness, queue: &Arc<Link>, model: &mut Model, op: Operation, n: usize) {
    match op {
        Operation::Add { priority, locked, commit } => {
            let tran = h.store.begin();
            let lock = if locked { LOCK } else { LockId::NONE };
            let message = Message::new(&h.events, &format!("m{n}")).priority(priority);
            let link = queue.add(message.into_item(), lock, &tran).unwrap();
            if commit {
                tran.commit().unwrap();
                model.links.push((link, locked));
            } else {
                tran.rollback().unwrap();
                assert_eq!(link.state(), ItemLinkState::NotStored);
            }
        }
        Operation::Lock { index } => {
            let Some(i) = model.pick(index) else { return };
            let (link, locked) = &mut model.links[i];
            let won = link.lock_item_if_available(LOCK).unwrap();
            assert_eq!(won, !*locked);
            *locked = true;
        }
        Operation::Unlock { index } => {
            let Some(i) = model.pick(index) else { return };
            let (link, locked) = &mut model.links[i];
            let result = link.unlock(LOCK, None, true);
            assert_eq!(result.is_ok(), *locked);
            *locked = false;
        }
        Operation::Remove { index, commit } => {
            let Some(i) = model.pick(index) else { return };
            let (link, locked) = &model.links[i];
            let lock = if *locked { LOCK } else { LockId::NONE };
            let tran = h.store.begin();
            link.cmd_remove(lock, &tran).unwrap();
            if commit {
                tran.commit().unwrap();
                assert_eq!(link.state(), ItemLinkState::NotStored);
                model.links.remove(i);
            } else {
                tran.rollback().unwrap();
                let expected = if *locked {
                    ItemLinkState::Locked
                } else {
                    ItemLinkState::Available
                };
                assert_eq!(link.state(), expected);
            }
        }
    }
}

fn check(queue: &Arc<Link>, model: &Model) {
    let stats = queue.statistics().unwrap();
    assert!(stats.is_consistent(), "{stats:?}");
    assert_eq!(stats.total_count, model.links.len() as u64);
    assert_eq!(stats.locked_count, model.locked());
    assert_eq!(stats.adding_count + stats.removing_count, 0);

    for (link, locked) in &model.links {
        // The test caches are large enough that nothing is evicted.
        assert_eq!(link.is_releasable(), !*locked, "link {:?}", link.id());
        assert_eq!(link.is_cache_managed(), link.is_releasable(), "link {:?}", link.id());
        assert_eq!(link.is_pinned(), *locked, "link {:?}", link.id());
    }

    let listed = queue.item_links().unwrap();
    assert_eq!(listed.len(), model.links.len());
    let order: Vec<_> = listed.iter().map(|l| (l.priority(), l.sequence())).collect();
    assert!(
        order.windows(2).all(|w| w[0].0 > w[1].0 || (w[0].0 == w[1].0 && w[0].1 < w[1].1)),
        "list out of order: {order:?}"
    );
}

#[derive(Debug, Clone, Copy)]
enum Delay {
    None,
    Elapsed,
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct Persisted {
    in_doubt: bool,
    deleted: bool,
    locked: bool,
    delay: Delay,
}

fn arb_persisted() -> impl Strategy<Value = Persisted> {
    let delay = prop_oneof![Just(Delay::None), Just(Delay::Elapsed), Just(Delay::Pending)];
    (any::<bool>(), any::<bool>(), any::<bool>(), delay).prop_map(
        |(in_doubt, deleted, locked, delay)| Persisted {
            in_doubt,
            // A completed delete leaves no tuple behind, so only in-doubt tuples are deleted.
            deleted: in_doubt && deleted,
            locked,
            delay,
        },
    )
}

const STREAM: LinkId = LinkId(1);
const ITEM: LinkId = LinkId(2);

fn persist(case: Persisted) -> MemoryStore {
    let events = Events::default();
    let store = MemoryStore::new();
    let stream = Stream::items(&events, "queue");
    store
        .commit(
            TranId(1),
            vec![PersistOp::Insert {
                tuple: Tuple::new(STREAM, LinkId::ROOT, ItemKind::ItemStream, "stream"),
                data: stream.persistent_data().unwrap(),
            }],
        )
        .unwrap();

    let mut tuple = Tuple::new(ITEM, STREAM, ItemKind::Item, "message");
    tuple.sequence = 1;
    if case.locked {
        tuple.lock_id = LOCK;
    }
    tuple.delivery_delay_time = match case.delay {
        Delay::None => None,
        Delay::Elapsed => Some(START_MS - 500),
        Delay::Pending => Some(START_MS + 500),
    };
    let insert = PersistOp::Insert {
        tuple,
        data: Message::new(&events, "m").into_item().persistent_data().unwrap(),
    };
    match (case.in_doubt, case.deleted) {
        (false, _) => store.commit(TranId(2), vec![insert]).unwrap(),
        (true, false) => store.prepare(TranId(2), vec![insert]).unwrap(),
        (true, true) => {
            store.commit(TranId(2), vec![insert]).unwrap();
            store.prepare(TranId(3), vec![PersistOp::Delete { id: ITEM }]).unwrap();
        }
    }
    store
}

fn expected_state(case: Persisted) -> (ItemLinkState, LockId) {
    let pending = matches!(case.delay, Delay::Pending);
    match (case.in_doubt, case.deleted) {
        (false, _) if case.locked => (ItemLinkState::PersistentlyLocked, LOCK),
        (false, _) if pending => (ItemLinkState::Locked, LockId::DELIVERY_DELAY),
        (false, _) => (ItemLinkState::Available, LockId::NONE),
        (true, true) if case.locked => (ItemLinkState::RemovingPersistentlyLocked, LOCK),
        (true, true) => (ItemLinkState::RemovingWithoutLock, LockId::NONE),
        (true, false) if pending => (ItemLinkState::AddingLocked, LockId::DELIVERY_DELAY),
        (true, false) => (ItemLinkState::AddingUnlocked, LockId::NONE),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_restored_state_follows_the_persisted_tuple(case in arb_persisted()) {
        let (state, lock) = expected_state(case);
        for _ in 0..2 {
            let (options, _clock) = StoreOptions::for_tests(START_MS);
            let events = Events::default();
            let persistence = Arc::new(persist(case));
            let store = MessageStore::open(options, persistence, registry(&events)).unwrap();
            let link = store.find_link(ITEM).unwrap().unwrap();
            prop_assert_eq!(link.state(), state);
            prop_assert_eq!(link.lock_id(), lock);
            prop_assert_eq!(store.indoubt_transactions().len(), usize::from(case.in_doubt));

            let queue = store.find_link(STREAM).unwrap().unwrap();
            let stats = queue.statistics().unwrap();
            prop_assert!(stats.is_consistent());
            prop_assert_eq!(stats.total_count, 1);
        }
    }

    #[test]
    fn prop_statistics_track_every_sequence(ops in prop::collection::vec(arb_operation(), 1..60)) {
        let h = Harness::new().unwrap();
        let queue = h.stream("queue").unwrap();
        let mut model = Model { links: Vec::new() };

        for (n, op) in ops.into_iter().enumerate() {
            apply(&h, &queue, &mut model, op, n);
            check(&queue, &model);
        }
    }

    #[test]
    fn prop_committed_items_survive_restart(ops in prop::collection::vec(arb_operation(), 1..40)) {
        let h = Harness::new().unwrap();
        let queue = h.stream("queue").unwrap();
        let mut model = Model { links: Vec::new() };
        for (n, op) in ops.into_iter().enumerate() {
            apply(&h, &queue, &mut model, op, n);
        }
        let expected: Vec<_> = model.links.iter().map(|(l, _)| l.id()).collect();

        let restarted = h.restart().unwrap();
        let queue = restarted.store.find_link(queue.id()).unwrap().unwrap();
        let mut restored: Vec<_> = queue.item_links().unwrap().iter().map(|l| l.id()).collect();
        restored.sort();
        let mut expected = expected;
        expected.sort();
        prop_assert_eq!(restored, expected);

        let stats = queue.statistics().unwrap();
        prop_assert!(stats.is_consistent());
        prop_assert_eq!(stats.total_count, model.links.len() as u64);
    }
}
