//! # Concurrency Tests using Loom
//!
//! Models the interrupt path of a run with loom. The signal listener cancels the
//! run's `CancellationToken` while the scheduler checks it before every launch;
//! after the run the command cancels the same token again to stop the listener.

#[cfg(test)]
mod tests {
    use loom::sync::Arc;
    use loom::sync::atomic::{AtomicUsize, Ordering};
    use loom::thread;
    use tokio_util::sync::CancellationToken;

    const STACK_SIZE: usize = 8 * 1024 * 1024; // 8 MB

    /// Runs `model` on a thread with a larger stack; loom explores deep interleavings.
    fn run_model<F>(model: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("loom-test-thread".into())
            .stack_size(STACK_SIZE)
            .spawn(move || loom::model(model))
            .unwrap();
        handle.join().unwrap();
    }

    /// The scheduler admits files only while the interrupt token is not cancelled.
    ///
    /// Once the scheduler has observed the cancellation, no later file is launched,
    /// and the token stays cancelled.
    #[test]
    fn test_interrupt_stops_later_launches() {
        run_model(|| {
            const FILES: usize = 3;
            let interrupt = CancellationToken::new();
            let launched = Arc::new(AtomicUsize::new(0));
            let launched_after_cancel = Arc::new(AtomicUsize::new(0));

            let scheduler = {
                let interrupt = interrupt.clone();
                let launched = launched.clone();
                let launched_after_cancel = launched_after_cancel.clone();
                thread::spawn(move || {
                    let mut seen_cancel = false;
                    for _ in 0..FILES {
                        if interrupt.is_cancelled() {
                            seen_cancel = true;
                            break;
                        }
                        launched.fetch_add(1, Ordering::AcqRel);
                    }
                    if seen_cancel && !interrupt.is_cancelled() {
                        launched_after_cancel.fetch_add(1, Ordering::AcqRel);
                    }
                })
            };

            let signal_listener = {
                let interrupt = interrupt.clone();
                thread::spawn(move || interrupt.cancel())
            };

            scheduler.join().unwrap();
            signal_listener.join().unwrap();

            assert!(interrupt.is_cancelled());
            assert_eq!(launched_after_cancel.load(Ordering::Acquire), 0);
            let count = launched.load(Ordering::Acquire);
            assert!(count <= FILES, "launched {count} of {FILES} files");
        });
    }

    /// The listener and the end of the run may both cancel the token; that is harmless
    /// and every clone observes it.
    #[test]
    fn test_cancelling_twice_is_observed_by_every_clone() {
        run_model(|| {
            let interrupt = CancellationToken::new();
            let observer = interrupt.clone();

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let interrupt = interrupt.clone();
                    thread::spawn(move || interrupt.cancel())
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert!(interrupt.is_cancelled());
            assert!(observer.is_cancelled());
        });
    }
}
