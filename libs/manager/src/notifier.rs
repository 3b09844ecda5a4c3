//! Fan-out of granular collection change events to attached observers.

use std::sync::Arc;

/// Incremental change events emitted by the manager.
///
/// Observers are invoked synchronously from the manager's eventloop in
/// registration order. Indices refer to the collection state *after* the
/// change was durably applied; an observer reacting to an event sees a
/// collection snapshot that already reflects it.
pub trait TunnelObserver: Send + Sync {
    /// Called once when the observer is attached, with the current number of
    /// tunnels, so initial state needs no special-casing.
    fn on_attach(&self, _count: usize) {}

    fn on_added(&self, _index: usize) {}

    fn on_modified(&self, _index: usize) {}

    fn on_moved(&self, _from: usize, _to: usize) {}

    fn on_removed(&self, _index: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObserverId(u64);

#[derive(Default)]
pub(crate) struct ChangeNotifier {
    observers: Vec<(ObserverId, Arc<dyn TunnelObserver>)>,
    next_id: u64,
}

impl ChangeNotifier {
    pub fn attach(&mut self, observer: Arc<dyn TunnelObserver>, count: usize) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;

        observer.on_attach(count);
        self.observers.push((id, observer));

        id
    }

    pub fn detach(&mut self, id: ObserverId) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    pub fn added(&self, index: usize) {
        for (_, observer) in &self.observers {
            observer.on_added(index);
        }
    }

    pub fn modified(&self, index: usize) {
        for (_, observer) in &self.observers {
            observer.on_modified(index);
        }
    }

    pub fn moved(&self, from: usize, to: usize) {
        for (_, observer) in &self.observers {
            observer.on_moved(from, to);
        }
    }

    pub fn removed(&self, index: usize) {
        for (_, observer) in &self.observers {
            observer.on_removed(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        tag: &'static str,
        log: Arc<Mutex<Vec<(&'static str, String)>>>,
    }

    impl TunnelObserver for Recording {
        fn on_attach(&self, count: usize) {
            self.log.lock().push((self.tag, format!("attach {count}")));
        }

        fn on_added(&self, index: usize) {
            self.log.lock().push((self.tag, format!("added {index}")));
        }

        fn on_removed(&self, index: usize) {
            self.log.lock().push((self.tag, format!("removed {index}")));
        }
    }

    #[test]
    fn observers_are_notified_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = ChangeNotifier::default();

        notifier.attach(
            Arc::new(Recording {
                tag: "list",
                log: Arc::clone(&log),
            }),
            0,
        );
        notifier.attach(
            Arc::new(Recording {
                tag: "detail",
                log: Arc::clone(&log),
            }),
            0,
        );

        notifier.added(0);

        assert_eq!(
            *log.lock(),
            vec![
                ("list", "attach 0".to_owned()),
                ("detail", "attach 0".to_owned()),
                ("list", "added 0".to_owned()),
                ("detail", "added 0".to_owned()),
            ]
        );
    }

    #[test]
    fn attach_delivers_the_current_count() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = ChangeNotifier::default();

        notifier.attach(
            Arc::new(Recording {
                tag: "list",
                log: Arc::clone(&log),
            }),
            3,
        );

        assert_eq!(*log.lock(), vec![("list", "attach 3".to_owned())]);
    }

    #[test]
    fn detached_observers_no_longer_receive_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = ChangeNotifier::default();

        let id = notifier.attach(
            Arc::new(Recording {
                tag: "list",
                log: Arc::clone(&log),
            }),
            0,
        );

        notifier.detach(id);
        notifier.removed(0);

        assert_eq!(*log.lock(), vec![("list", "attach 0".to_owned())]);
    }
}
