#![cfg(all(feature = "std", not(loom), not(feature = "shuttle")))]

mod common;

use common::{contention_test, AtomicUsize};
use mcas::Domain;
use std::thread::ScopedJoinHandle;
use test_log::test;
use tracing::debug;

#[test]
fn disjoint_operations_both_pass() {
    let first = AtomicUsize::new(4);
    let second = AtomicUsize::new(8);
    let domain = Domain::new(2);

    std::thread::scope(|scope| {
        let (domain, first, second) = (&domain, &first, &second);
        let one: ScopedJoinHandle<bool> = scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            let mut op = ctx.mcas(1);
            assert!(op.add_triple(first, 4, 40));
            op.execute(&mut ctx)
        });
        let two: ScopedJoinHandle<bool> = scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            let mut op = ctx.mcas(1);
            assert!(op.add_triple(second, 8, 80));
            op.execute(&mut ctx)
        });
        assert!(one.join().expect("first thread panicked"));
        assert!(two.join().expect("second thread panicked"));
    });

    let mut ctx = domain.attach().unwrap();
    assert_eq!(ctx.read(&first), 40);
    assert_eq!(ctx.read(&second), 80);
}

#[test]
fn overlapping_operations_are_exclusive() {
    let first = AtomicUsize::new(4);
    let second = AtomicUsize::new(8);
    let domain = Domain::new(2);

    std::thread::scope(|scope| {
        let (domain, first, second) = (&domain, &first, &second);
        let one: ScopedJoinHandle<bool> = scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            let mut op = ctx.mcas(2);
            assert!(op.add_triple(first, 4, 40));
            assert!(op.add_triple(second, 8, 80));
            op.execute(&mut ctx)
        });
        let two: ScopedJoinHandle<bool> = scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            let mut op = ctx.mcas(2);
            assert!(op.add_triple(first, 4, 44));
            assert!(op.add_triple(second, 8, 84));
            op.execute(&mut ctx)
        });

        let first_won = one.join().expect("first thread panicked");
        let second_won = two.join().expect("second thread panicked");
        debug!("first_won: {first_won}, second_won: {second_won}");
        assert!(first_won ^ second_won, "exactly one operation must pass");
    });

    let mut ctx = domain.attach().unwrap();
    let outcome = (ctx.read(&first), ctx.read(&second));
    assert!(outcome == (40, 80) || outcome == (44, 84), "torn outcome: {outcome:?}");
}

#[test]
fn many_threads_race_over_the_same_words() {
    contention_test(4, 3);
}

#[test]
fn transfers_preserve_the_total() {
    const THREADS: usize = 4;
    const TRANSFERS: usize = 200;
    const UNIT: usize = 4;

    let accounts: Vec<AtomicUsize> = (0..THREADS).map(|_| AtomicUsize::new(4000)).collect();
    let domain = Domain::new(THREADS);

    std::thread::scope(|scope| {
        let (domain, accounts) = (&domain, &accounts);
        for origin in 0..THREADS {
            scope.spawn(move || {
                let target = (origin + 1) % THREADS;
                let mut ctx = domain.attach().unwrap();
                for _ in 0..TRANSFERS {
                    // Retry until a consistent snapshot goes through.
                    loop {
                        let from = ctx.read(&accounts[origin]);
                        let to = ctx.read(&accounts[target]);
                        if from < UNIT {
                            break;
                        }
                        let mut op = ctx.mcas(2);
                        assert!(op.add_triple(&accounts[origin], from, from - UNIT));
                        assert!(op.add_triple(&accounts[target], to, to + UNIT));
                        if op.execute(&mut ctx) {
                            break;
                        }
                    }
                }
            });
        }
    });

    let mut ctx = domain.attach().unwrap();
    let total: usize = accounts.iter().map(|account| ctx.read(account)).sum();
    assert_eq!(total, THREADS * 4000, "transfers must conserve the total");
}

#[test]
fn reads_resolve_concurrent_operations() {
    const ROUNDS: usize = 400;

    let first = AtomicUsize::new(0);
    let second = AtomicUsize::new(0);
    let domain = Domain::new(2);

    std::thread::scope(|scope| {
        let (domain, first, second) = (&domain, &first, &second);
        scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            for round in 1..=ROUNDS {
                loop {
                    let a = ctx.read(first);
                    let b = ctx.read(second);
                    let mut op = ctx.mcas(2);
                    assert!(op.add_triple(first, a, round * 4));
                    assert!(op.add_triple(second, b, round * 4));
                    if op.execute(&mut ctx) {
                        break;
                    }
                }
            }
        });
        scope.spawn(move || {
            let mut ctx = domain.attach().unwrap();
            for _ in 0..ROUNDS {
                // Rounds only move forward and both words move together, so
                // the second read can never be behind the first.
                let a = ctx.read(first);
                let b = ctx.read(second);
                assert!(b >= a, "reads went backwards: {a} then {b}");
            }
        });
    });

    let mut ctx = domain.attach().unwrap();
    assert_eq!(ctx.read(&first), ROUNDS * 4);
    assert_eq!(ctx.read(&second), ROUNDS * 4);
}
