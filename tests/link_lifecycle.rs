mod common;

use common::{body_of, Harness, Message, Stream};
use msgstore::{
    Item, ItemLinkState, LockId, PersistentStore, Result, StorageStrategy, StoreError, Watermarks,
};

fn body_is(expected: &'static str) -> impl Fn(&dyn Item) -> Result<bool> + Send + Sync {
    move |item: &dyn Item| {
        Ok(item
            .as_any()
            .downcast_ref::<Message>()
            .is_some_and(|m| m.body() == expected))
    }
}

#[test]
fn committed_add_is_available_and_counted() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m1"))?;

    assert_eq!(link.state(), ItemLinkState::Available);
    assert!(h.persistence.contains(link.id()));
    let stats = queue.statistics().unwrap();
    assert_eq!(stats.available_count, 1);
    assert_eq!(stats.total_count, 1);
    assert!(stats.is_consistent());
    assert!(h.events.contains("precommit-add:m1"));
    assert!(h.events.contains("post-commit-add:m1"));

    // Stored, stable and available: the payload now belongs to the discard cache.
    assert!(link.is_releasable());
    assert!(link.is_cache_managed());
    assert!(!link.is_pinned());
    Ok(())
}

#[test]
fn rolled_back_add_leaves_no_trace() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let tran = h.store.begin();
    let link = queue.add(Message::new(&h.events, "gone").into_item(), LockId::NONE, &tran)?;
    assert_eq!(link.state(), ItemLinkState::AddingUnlocked);
    assert_eq!(queue.statistics().unwrap().adding_count, 1);

    tran.rollback()?;

    assert_eq!(link.state(), ItemLinkState::NotStored);
    assert_eq!(queue.statistics().unwrap().total_count, 0);
    assert!(queue.item_links()?.is_empty());
    assert!(!h.persistence.contains(link.id()));
    assert!(h.events.contains("post-rollback-add:gone"));
    assert!(h.store.find_link(link.id())?.is_none());
    Ok(())
}

#[test]
fn locked_add_commits_locked() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let tran = h.store.begin();
    let link = queue.add(Message::new(&h.events, "held").into_item(), LockId(11), &tran)?;
    assert_eq!(link.state(), ItemLinkState::AddingLocked);
    tran.commit()?;

    assert_eq!(link.state(), ItemLinkState::Locked);
    assert_eq!(link.lock_id(), LockId(11));
    assert!(link.is_pinned());
    assert_eq!(queue.statistics().unwrap().locked_count, 1);
    Ok(())
}

#[test]
fn lock_and_unlock_round_trip() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;

    assert!(matches!(
        link.cmd_lock(LockId::NONE),
        Err(StoreError::InvalidArgument(_))
    ));
    link.cmd_lock(LockId(7))?;
    assert_eq!(link.state(), ItemLinkState::Locked);
    assert!(link.is_pinned());
    assert!(!link.is_cache_managed());
    assert_eq!(queue.statistics().unwrap().locked_count, 1);
    assert!(matches!(link.cmd_lock(LockId(8)), Err(StoreError::State { .. })));

    let err = link.unlock(LockId(8), None, true).unwrap_err();
    assert!(matches!(
        err,
        StoreError::LockIdMismatch {
            expected: LockId(7),
            supplied: LockId(8)
        }
    ));

    link.unlock(LockId(7), None, true)?;
    assert_eq!(link.state(), ItemLinkState::Available);
    assert_eq!(link.unlock_count(), 1);
    assert_eq!(link.lock_id(), LockId::NONE);
    assert!(h.events.contains("unlocked:m"));
    assert!(link.is_cache_managed());
    assert_eq!(queue.statistics().unwrap().available_count, 1);
    Ok(())
}

#[test]
fn remove_under_lock_commits() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    link.cmd_lock(LockId(7))?;

    let before = queue.statistics().unwrap();
    let tran = h.store.begin();
    assert!(matches!(
        link.cmd_remove(LockId(9), &tran),
        Err(StoreError::LockIdMismatch { .. })
    ));
    assert_eq!(link.state(), ItemLinkState::Locked);
    assert_eq!(link.lock_id(), LockId(7));
    assert_eq!(queue.statistics().unwrap(), before);
    assert_eq!(tran.task_count(), 0);
    link.cmd_remove(LockId(7), &tran)?;
    assert_eq!(link.state(), ItemLinkState::RemovingLocked);
    assert_eq!(queue.statistics().unwrap().removing_count, 1);
    tran.commit()?;

    assert_eq!(link.state(), ItemLinkState::NotStored);
    assert!(!h.persistence.contains(link.id()));
    assert!(queue.item_links()?.is_empty());
    assert_eq!(queue.statistics().unwrap().total_count, 0);
    assert!(h.events.contains("post-commit-remove:m"));
    assert!(!link.is_pinned());
    Ok(())
}

#[test]
fn second_commit_of_an_add_is_rejected() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let tran = h.store.begin();
    let link = queue.add(Message::new(&h.events, "m").into_item(), LockId::NONE, &tran)?;
    tran.commit()?;
    let before = queue.statistics().unwrap();

    let err = link.commit_add(&tran).unwrap_err();
    assert!(matches!(
        err,
        StoreError::State { state: ItemLinkState::Available, .. }
    ));
    assert_eq!(link.state(), ItemLinkState::Available);
    assert_eq!(queue.statistics().unwrap(), before);
    Ok(())
}

#[test]
fn available_link_must_be_removed_without_lock() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    let tran = h.store.begin();
    assert!(matches!(
        link.cmd_remove(LockId(1), &tran),
        Err(StoreError::LockIdMismatch { .. })
    ));
    link.cmd_remove(LockId::NONE, &tran)?;
    assert_eq!(link.state(), ItemLinkState::RemovingWithoutLock);
    tran.commit()?;
    assert_eq!(link.state(), ItemLinkState::NotStored);
    Ok(())
}

#[test]
fn rolled_back_remove_counts_a_backout() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;

    let tran = h.store.begin();
    link.cmd_remove(LockId::NONE, &tran)?;
    tran.rollback()?;
    assert_eq!(link.state(), ItemLinkState::Available);
    assert_eq!(link.backout_count(), 1);
    assert!(h.events.contains("post-rollback-remove:m"));

    link.cmd_lock(LockId(4))?;
    let tran = h.store.begin();
    link.cmd_remove(LockId(4), &tran)?;
    tran.rollback()?;
    assert_eq!(link.state(), ItemLinkState::Locked);
    assert_eq!(link.lock_id(), LockId(4));
    assert_eq!(link.backout_count(), 2);
    assert_eq!(queue.statistics().unwrap().locked_count, 1);
    Ok(())
}

#[test]
fn verbs_reject_the_wrong_transaction() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let tran = h.store.begin();
    let link = queue.add(Message::new(&h.events, "m").into_item(), LockId::NONE, &tran)?;
    let other = h.store.begin();
    assert!(matches!(
        link.commit_add(&other),
        Err(StoreError::WrongTransaction { .. })
    ));
    tran.commit()?;
    assert!(matches!(tran.commit(), Err(StoreError::TransactionState { .. })));
    Ok(())
}

#[test]
fn persistent_lock_survives_until_unlocked_under_a_transaction() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    link.cmd_lock(LockId(3))?;

    let tran = h.store.begin();
    link.cmd_persist_lock(&tran)?;
    assert_eq!(link.state(), ItemLinkState::PersistingLock);
    tran.commit()?;
    assert_eq!(link.state(), ItemLinkState::PersistentlyLocked);
    assert_eq!(h.persistence.read_tuple(link.id())?.unwrap().lock_id, LockId(3));
    // STORE_ALWAYS payloads may be released while persistently locked.
    assert!(link.is_releasable());

    assert!(matches!(
        link.unlock(LockId(3), None, false),
        Err(StoreError::State { .. })
    ));
    let tran = h.store.begin();
    link.unlock(LockId(3), Some(&tran), false)?;
    assert_eq!(link.state(), ItemLinkState::UnlockingPersistentlyLocked);
    tran.commit()?;

    assert_eq!(link.state(), ItemLinkState::Available);
    assert_eq!(link.unlock_count(), 1);
    assert_eq!(h.persistence.read_tuple(link.id())?.unwrap().lock_id, LockId::NONE);
    Ok(())
}

#[test]
fn rolled_back_persist_lock_keeps_the_memory_lock() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    link.cmd_lock(LockId(3))?;
    let tran = h.store.begin();
    link.cmd_persist_lock(&tran)?;
    tran.rollback()?;
    assert_eq!(link.state(), ItemLinkState::Locked);
    assert_eq!(h.persistence.read_tuple(link.id())?.unwrap().lock_id, LockId::NONE);
    Ok(())
}

#[test]
fn update_pins_until_the_new_data_is_written() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    let tran = h.store.begin();
    link.cmd_request_update(&tran)?;
    assert_eq!(link.state(), ItemLinkState::UpdatingData);
    assert!(!link.is_persistent_representation_stable());
    assert!(link.is_pinned());
    assert_eq!(queue.statistics().unwrap().updating_count, 1);
    tran.commit()?;

    assert_eq!(link.state(), ItemLinkState::Available);
    assert!(link.is_persistent_representation_stable());
    assert!(link.is_cache_managed());
    Ok(())
}

#[test]
fn children_are_listed_by_priority_then_arrival() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    h.put(&queue, Message::new(&h.events, "low").priority(1))?;
    h.put(&queue, Message::new(&h.events, "high").priority(9))?;
    h.put(&queue, Message::new(&h.events, "mid-1"))?;
    h.put(&queue, Message::new(&h.events, "mid-2"))?;

    let mut bodies = Vec::new();
    for link in queue.item_links()? {
        let item = link.get_item()?.unwrap();
        bodies.push(body_of(&item).unwrap());
    }
    assert_eq!(bodies, ["high", "mid-1", "mid-2", "low"]);
    Ok(())
}

#[test]
fn out_of_range_priority_fails_the_commit() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let tran = h.store.begin();
    let link = queue.add(Message::new(&h.events, "bad").priority(12).into_item(), LockId::NONE, &tran)?;
    assert!(tran.commit().unwrap_err().is_severe());
    assert_eq!(link.state(), ItemLinkState::NotStored);
    assert_eq!(queue.statistics().unwrap().total_count, 0);
    Ok(())
}

#[test]
fn matching_verbs_select_by_filter() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    h.put(&queue, Message::new(&h.events, "a"))?;
    let b = h.put(&queue, Message::new(&h.events, "b"))?;
    let c = h.put(&queue, Message::new(&h.events, "c"))?;

    let found = queue.find_first_matching(&body_is("b"))?.unwrap();
    assert_eq!(found.id(), b.id());
    assert!(queue.find_first_matching(&body_is("zzz"))?.is_none());

    let locked = queue.lock_first_matching(&body_is("b"), LockId(2))?.unwrap();
    assert_eq!(locked.id(), b.id());
    assert_eq!(b.state(), ItemLinkState::Locked);
    // Locked links no longer match.
    assert!(!b.matches(&body_is("b"))?);
    assert!(b.matches_allow_unavailable(&body_is("b"), true)?);

    let tran = h.store.begin();
    let removed = queue.remove_first_matching(&body_is("c"), &tran)?.unwrap();
    assert_eq!(removed.id(), c.id());
    tran.commit()?;
    assert_eq!(c.state(), ItemLinkState::NotStored);
    assert_eq!(queue.item_links()?.len(), 2);
    Ok(())
}

#[test]
fn failing_filter_counts_as_no_match() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "a"))?;
    let broken = |_: &dyn Item| -> Result<bool> { Err(StoreError::InvalidArgument("nope".into())) };
    assert!(!link.matches(&broken)?);
    assert!(!link.lock_if_matches(&broken, LockId(1))?);
    assert_eq!(link.state(), ItemLinkState::Available);
    Ok(())
}

#[test]
fn full_stream_refuses_adds() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    queue.set_max_depth(Some(2))?;
    h.put(&queue, Message::new(&h.events, "1"))?;
    h.put(&queue, Message::new(&h.events, "2"))?;
    let err = h.put(&queue, Message::new(&h.events, "3")).unwrap_err();
    assert!(matches!(err, StoreError::StreamIsFull { depth: 2, .. }));
    Ok(())
}

#[test]
fn child_kinds_are_checked() -> Result<()> {
    let h = Harness::new()?;
    let tran = h.store.begin();
    let err = h
        .store
        .root()
        .add(Message::new(&h.events, "m").into_item(), LockId::NONE, &tran)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidAddOperation(_)));

    let refs = h.store.root().add(Stream::references(&h.events, "refs"), LockId::NONE, &tran);
    assert!(matches!(refs, Err(StoreError::InvalidAddOperation(_))));
    tran.commit()?;
    Ok(())
}

#[test]
fn stronger_item_cannot_join_a_weaker_stream() -> Result<()> {
    let h = Harness::new()?;
    let tran = h.store.begin();
    let weak = h.store.root().add(
        Stream::with_strategy(&h.events, "weak", StorageStrategy::Maybe),
        LockId::NONE,
        &tran,
    )?;
    tran.commit()?;

    let tran = h.store.begin();
    weak.add(Message::new(&h.events, "strong").into_item(), LockId::NONE, &tran)?;
    assert!(matches!(tran.commit(), Err(StoreError::InvalidAddOperation(_))));
    assert_eq!(weak.statistics().unwrap().total_count, 0);
    Ok(())
}

#[test]
fn stream_delete_needs_its_children_removed_first() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let message = h.put(&queue, Message::new(&h.events, "m"))?;

    let tran = h.store.begin();
    queue.cmd_remove(LockId::NONE, &tran)?;
    assert!(matches!(tran.commit(), Err(StoreError::StreamNotEmpty { remaining: 1, .. })));
    assert_eq!(queue.state(), ItemLinkState::Available);

    let tran = h.store.begin();
    message.cmd_remove(LockId::NONE, &tran)?;
    queue.cmd_remove(LockId::NONE, &tran)?;
    tran.commit()?;
    assert_eq!(queue.state(), ItemLinkState::NotStored);
    assert!(h.store.root().stream_links().is_empty());
    assert!(h.persistence.is_empty());
    Ok(())
}

#[test]
fn watermarks_reach_the_stream_payload() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    queue.set_watermarks(Watermarks {
        count_high: Some(2),
        count_low: Some(1),
        ..Watermarks::default()
    })?;
    let first = h.put(&queue, Message::new(&h.events, "1"))?;
    h.put(&queue, Message::new(&h.events, "2"))?;
    assert_eq!(h.events.count("watermark:queue:CountHigh(2)"), 1);

    let tran = h.store.begin();
    first.cmd_remove(LockId::NONE, &tran)?;
    tran.commit()?;
    assert_eq!(h.events.count("watermark:queue:CountLow(1)"), 1);
    Ok(())
}

#[test]
fn availability_watch_advances_on_unlock() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    link.cmd_lock(LockId(1))?;
    let seen = queue.availability_generation();
    link.unlock(LockId(1), None, false)?;
    let now = queue.wait_for_available(seen, std::time::Duration::from_millis(10));
    assert!(now > seen);
    Ok(())
}

#[test]
fn dump_names_every_loaded_link() -> Result<()> {
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "m"))?;
    let dump = h.store.dump();
    assert!(dump.starts_with("<root id=\"0\""));
    assert!(dump.contains(&format!("<item-stream id=\"{}\"", queue.id())));
    assert!(dump.contains(&format!("<item id=\"{}\" state=\"Available\"", link.id())));
    assert!(dump.contains("</item-stream>"));
    assert!(dump.contains("<statistics total=\"1\""));
    Ok(())
}
