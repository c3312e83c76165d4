use mcas::Domain;

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::AtomicUsize;
        pub(crate) use loom::sync::Arc;
        pub(crate) use loom::thread;
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::AtomicUsize;
        pub(crate) use shuttle::sync::Arc;
        pub(crate) use shuttle::thread;
    } else {
        pub(crate) use std::sync::atomic::AtomicUsize;
        pub(crate) use std::sync::Arc;
        pub(crate) use std::thread;
    }
}

/// Every thread races one multi-word operation over the same set of words,
/// each expecting the initial zeros. Exactly one thread can win; afterwards
/// every word must carry the winner's value.
pub(crate) fn contention_test(num_threads: usize, num_words: usize) {
    let cells: Arc<Vec<AtomicUsize>> =
        Arc::new((0..num_words).map(|_| AtomicUsize::new(0)).collect());
    let domain: Arc<Domain> = Arc::new(Domain::new(num_threads + 1));

    let handles: Vec<thread::JoinHandle<bool>> = (0..num_threads)
        .map(|i| {
            let cells = cells.clone();
            let domain = domain.clone();
            thread::spawn(move || {
                let cells = &*cells;
                let mut ctx = domain.attach().unwrap();
                let mut op = ctx.mcas(cells.len());
                for cell in cells.iter() {
                    assert!(op.add_triple(cell, 0, (i + 1) * 4));
                }
                op.execute(&mut ctx)
            })
        })
        .collect();

    let outcomes: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().expect("a racing thread panicked"))
        .collect();
    assert_eq!(
        outcomes.iter().filter(|&&won| won).count(),
        1,
        "exactly one racing operation must pass"
    );

    let winner = outcomes.iter().position(|&won| won).unwrap();
    let cells = &*cells;
    let mut ctx = domain.attach().unwrap();
    for cell in cells.iter() {
        assert_eq!(ctx.read(cell), (winner + 1) * 4);
    }
}
