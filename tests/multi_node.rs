//! Multi-node end-to-end scenarios (spec.md §8) driven through several
//! `Context`s in one test process.
//!
//! `dsm::fault`'s SIGSEGV handler is process-wide (one `GLOBAL_CONTEXT`,
//! see `src/fault.rs`), so a single process can only ever host one
//! node's real fault-driven coherence. These tests instead bring up
//! each simulated node's `Context` via `test_support::bring_up` (no
//! signal handler installed) and drive page migration directly through
//! `fetch_for_read`/`fetch_for_write`, exactly as a real fault would,
//! without touching the raw pointer until the page is already mapped
//! with the right protection.

use dsm::config::Config;
use dsm::context::test_support::bring_up;
use dsm::page::PageState;
use std::thread;
use std::time::Duration;

fn settle() {
    thread::sleep(Duration::from_millis(150));
}

/// spec.md §8 scenario 2: two nodes share `int *v`. Node 0 writes 42,
/// both barrier, node 1 reads 42 and writes 43, both barrier, node 0
/// reads 43.
#[test]
fn ping_pong_two_nodes_exchange_values_through_a_shared_page() {
    let port = 19950;
    let n0 = bring_up(Config {
        node_id: 0,
        port,
        bind_host: "127.0.0.1".into(),
        manager_port: port,
        num_nodes: 2,
        is_manager: true,
        ..Config::default()
    });
    let n1 = bring_up(Config {
        node_id: 1,
        port: 0,
        bind_host: "127.0.0.2".into(),
        manager_port: port,
        num_nodes: 2,
        is_manager: false,
        ..Config::default()
    });
    settle();

    let addr = n0.malloc(dsm::PAGE_SIZE).unwrap();
    settle();

    let b10: u64 = 10;
    let b1000: u64 = 1000;
    let b1001: u64 = 1001;

    // Node 1 runs its half of the exchange on its own thread so both
    // sides can arrive at each barrier concurrently with node 0 below.
    let n1_thread = n1.clone();
    let node1 = thread::spawn(move || {
        n1_thread.barrier_wait(b10, 2, Duration::from_secs(2)).unwrap();
        n1_thread.barrier_wait(b1000, 2, Duration::from_secs(2)).unwrap();

        let table = n1_thread.table_for_addr(addr).unwrap();
        let entry = table.entry_for_addr(addr).unwrap();
        n1_thread.fetch_for_read(&table, entry).unwrap();
        let seen = unsafe { *(addr as *const i32) };

        n1_thread.fetch_for_write(&table, entry).unwrap();
        unsafe { *(addr as *mut i32) = 43 };
        n1_thread.barrier_wait(b1001, 2, Duration::from_secs(2)).unwrap();
        seen
    });

    // Node 0: rendezvous, write 42, rendezvous twice more, then read.
    n0.barrier_wait(b10, 2, Duration::from_secs(2)).unwrap();

    let table = n0.table_for_addr(addr).unwrap();
    let entry = table.entry_for_addr(addr).unwrap();
    n0.fetch_for_write(&table, entry).unwrap();
    unsafe { *(addr as *mut i32) = 42 };

    n0.barrier_wait(b1000, 2, Duration::from_secs(2)).unwrap();
    n0.barrier_wait(b1001, 2, Duration::from_secs(2)).unwrap();

    let seen_by_n1 = node1.join().unwrap();
    assert_eq!(seen_by_n1, 42, "node 1 must observe node 0's write after the first barrier round");

    n0.fetch_for_read(&table, entry).unwrap();
    assert_eq!(unsafe { *(addr as *const i32) }, 43, "node 0 must observe node 1's write after the second barrier round");

    assert!(n0.stats.snapshot().write_faults >= 1);
    assert!(n0.stats.snapshot().pages_fetched >= 1);
    assert!(n1.stats.snapshot().write_faults >= 1);
    assert!(n1.stats.snapshot().pages_fetched >= 1);

    n0.shutdown();
    n1.shutdown();
}

/// spec.md §8 scenario 6: 4 nodes each sum a slice of 1..=1000 into
/// their own element of a shared `partial_sums` array, barrier, then
/// node 0 reduces the array to the grand total 500500.
#[test]
fn four_node_partial_sum_reduces_to_the_expected_total() {
    let port = 19960;
    let num_nodes = 4;
    let nodes: Vec<_> = (0..num_nodes)
        .map(|id| {
            bring_up(Config {
                node_id: id,
                port: if id == 0 { port } else { 0 },
                bind_host: match id {
                    0 => "127.0.0.1".to_string(),
                    1 => "127.0.0.2".to_string(),
                    _ => "0.0.0.0".to_string(),
                },
                manager_port: port,
                num_nodes: num_nodes as usize,
                is_manager: id == 0,
                ..Config::default()
            })
        })
        .collect();
    settle();

    let addr = nodes[0].malloc(dsm::PAGE_SIZE).unwrap();
    settle();

    let barrier_id = 2000;
    let handles: Vec<_> = nodes
        .iter()
        .cloned()
        .enumerate()
        .map(|(id, ctx)| {
            thread::spawn(move || {
                let slice_len = 1000 / num_nodes;
                let start = id * slice_len + 1;
                let end = start + slice_len - 1;
                let sum: i64 = (start as i64..=end as i64).sum();

                let table = ctx.table_for_addr(addr).unwrap();
                let entry = table.entry_for_addr(addr).unwrap();
                ctx.fetch_for_write(&table, entry).unwrap();
                unsafe {
                    let slot = (addr as *mut i64).add(id);
                    *slot = sum;
                }

                ctx.barrier_wait(barrier_id, num_nodes as u32, Duration::from_secs(5)).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let table = nodes[0].table_for_addr(addr).unwrap();
    let entry = table.entry_for_addr(addr).unwrap();
    nodes[0].fetch_for_read(&table, entry).unwrap();
    assert_eq!(entry.state(), PageState::ReadOnly);

    let total: i64 = (0..num_nodes).map(|id| unsafe { *(addr as *const i64).add(id) }).sum();
    assert_eq!(total, 500_500);

    for ctx in &nodes {
        ctx.shutdown();
    }
}
