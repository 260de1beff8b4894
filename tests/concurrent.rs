mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{Harness, Message};
use msgstore::{ItemLinkState, LockId, MatchAll, Result};

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 4;
const MESSAGES_PER_PRODUCER: usize = 100;
const TOTAL: usize = PRODUCERS * MESSAGES_PER_PRODUCER;

#[test]
fn producers_and_consumers_share_a_stream() -> Result<()> {
    let h = Arc::new(Harness::new()?);
    let queue = h.stream("queue")?;
    let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for producer in 0..PRODUCERS {
        let h = Arc::clone(&h);
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for n in 0..MESSAGES_PER_PRODUCER {
                let message = Message::new(&h.events, &format!("p{producer}-{n}"));
                h.put(&queue, message)?;
            }
            Ok(())
        }));
    }

    for consumer in 0..CONSUMERS {
        let h = Arc::clone(&h);
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        let consumed = Arc::clone(&consumed);
        handles.push(thread::spawn(move || -> Result<()> {
            let lock = LockId(consumer as i64 + 1);
            let deadline = Instant::now() + Duration::from_secs(60);
            barrier.wait();
            while consumed.load(Ordering::SeqCst) < TOTAL {
                assert!(Instant::now() < deadline, "consumers stalled");
                let seen = queue.availability_generation();
                let Some(link) = queue.lock_first_matching(&MatchAll, lock)? else {
                    queue.wait_for_available(seen, Duration::from_millis(5));
                    continue;
                };
                let tran = h.store.begin();
                link.cmd_remove(lock, &tran)?;
                tran.commit()?;
                consumed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().unwrap()?;
    }

    assert_eq!(consumed.load(Ordering::SeqCst), TOTAL);
    assert!(queue.item_links()?.is_empty());
    let stats = queue.statistics().unwrap();
    assert_eq!(stats.total_count, 0);
    assert!(stats.is_consistent());
    assert!(h.persistence.contains(queue.id()));
    assert_eq!(h.persistence.len(), 1);
    Ok(())
}

#[test]
fn only_one_thread_wins_a_lock() -> Result<()> {
    const THREADS: usize = 8;
    let h = Harness::new()?;
    let queue = h.stream("queue")?;
    let link = h.put(&queue, Message::new(&h.events, "prize"))?;
    let barrier = Arc::new(Barrier::new(THREADS));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let link = Arc::clone(&link);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                if link.lock_item_if_available(LockId(n as i64 + 1))? {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(link.state(), ItemLinkState::Locked);
    assert_eq!(queue.statistics().unwrap().locked_count, 1);
    Ok(())
}

#[test]
fn readers_race_with_lock_and_unlock() -> Result<()> {
    let h = Arc::new(Harness::new()?);
    let queue = h.stream("queue")?;
    for n in 0..20 {
        h.put(&queue, Message::new(&h.events, &format!("m{n}")))?;
    }
    let links = queue.item_links()?;
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let links = links.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                let lock = LockId(n + 1);
                for _ in 0..50 {
                    for link in &links {
                        if n % 2 == 0 {
                            if link.lock_item_if_available(lock)? {
                                link.unlock(lock, None, true)?;
                            }
                        } else {
                            link.get_item()?;
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }

    assert!(links.iter().all(|l| l.state() == ItemLinkState::Available));
    let stats = queue.statistics().unwrap();
    assert_eq!(stats.available_count, 20);
    assert!(stats.is_consistent());
    Ok(())
}
