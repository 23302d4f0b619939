//! Async event notification plumbing. Mutators never touch host
//! sockets: they publish the set of affected host NQNs on a channel,
//! and a dedicated notifier thread forwards a wakeup to whichever
//! connections have an async event request parked. The owning worker
//! thread emits the synthetic completion itself.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// One batch of affected hosts, produced by a model mutation or an
/// aggregator diff.
#[derive(Debug)]
pub struct AenEvent {
    pub hosts: Vec<String>,
}

struct AerSubscriber {
    id: u64,
    hostnqn: String,
    notify: Sender<()>,
}

/// Registry of parked async event requests and the event channel that
/// feeds the notifier.
pub struct AenRegistry {
    tx: Sender<AenEvent>,
    rx: Receiver<AenEvent>,
    subs: Mutex<Vec<AerSubscriber>>,
    next_id: AtomicU64,
}

impl Default for AenRegistry {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        AenRegistry {
            tx,
            rx,
            subs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl AenRegistry {
    /// Queue a change notification for the given hosts. Duplicates
    /// collapse so each pending request fires at most once per event.
    pub fn publish(&self, mut hosts: Vec<String>) {
        hosts.sort();
        hosts.dedup();
        if hosts.is_empty() {
            return;
        }
        trace!("aen event for {} host(s)", hosts.len());
        let _ = self.tx.send(AenEvent {
            hosts,
        });
    }

    /// Park an async event request for `hostnqn`; the returned
    /// receiver fires when a relevant change happens.
    pub fn subscribe(&self, hostnqn: &str) -> (u64, Receiver<()>) {
        let (tx, rx) = unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().push(AerSubscriber {
            id,
            hostnqn: hostnqn.to_string(),
            notify: tx,
        });
        (id, rx)
    }

    /// Drop a parked request (fired, or connection went away).
    pub fn unsubscribe(&self, id: u64) {
        self.subs.lock().retain(|s| s.id != id);
    }

    fn dispatch(&self, event: &AenEvent) {
        let subs = self.subs.lock();
        for sub in subs.iter() {
            if event.hosts.iter().any(|h| h == &sub.hostnqn) {
                debug!("notifying pending aer of '{}'", sub.hostnqn);
                let _ = sub.notify.send(());
            }
        }
    }
}

/// Run the notifier until shutdown.
pub fn spawn_notifier(registry: Arc<AenRegistry>, stopped: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("aen-notifier".to_string())
        .spawn(move || {
            let rx = registry.rx.clone();
            while !stopped.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => registry.dispatch(&event),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("spawning aen notifier")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_request_fires_once_per_event() {
        let registry = AenRegistry::default();
        let (_id, rx) = registry.subscribe("nqn.h1");

        registry.publish(vec!["nqn.h1".to_string(), "nqn.h1".to_string()]);
        let event = registry.rx.recv().unwrap();
        assert_eq!(event.hosts.len(), 1);
        registry.dispatch(&event);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unrelated_hosts_are_not_woken() {
        let registry = AenRegistry::default();
        let (_id, rx) = registry.subscribe("nqn.h1");

        registry.publish(vec!["nqn.other".to_string()]);
        let event = registry.rx.recv().unwrap();
        registry.dispatch(&event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_parked_request() {
        let registry = AenRegistry::default();
        let (id, rx) = registry.subscribe("nqn.h1");
        registry.unsubscribe(id);

        registry.publish(vec!["nqn.h1".to_string()]);
        let event = registry.rx.recv().unwrap();
        registry.dispatch(&event);
        assert!(rx.try_recv().is_err());
    }
}
