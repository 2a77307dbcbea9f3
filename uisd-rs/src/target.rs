/* Remote event targets. A target is a ref-counted handle to one client message sink,
 * identified by (port, token); the team id is informational. The registry deduplicates
 * targets and owns their lifetime through the explicit ref count: a subscription's Arc
 * only guarantees memory safety, liveness is registry membership. */
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config;
use crate::error::{Result, UisError};
use crate::proto::EventMessage;
use crate::sync::lock;

/* One client message sink. `send` must distinguish a dead endpoint from a transient
 * transport failure; a dead endpoint triggers target eviction. */
pub trait EventPort: Send + Sync {
    fn send(&self, event: &EventMessage) -> Result<()>;
}

/* Builds the port sender for a newly seen (team, port, token). */
pub type PortFactory = Box<dyn Fn(i32, i32, i32) -> Box<dyn EventPort> + Send + Sync>;

pub struct UisTarget {
    pub team: i32,
    pub port: i32,
    pub token: i32,
    ref_count: AtomicU32,
    sender: Box<dyn EventPort>,
}

impl UisTarget {
    fn new(team: i32, port: i32, token: i32, sender: Box<dyn EventPort>) -> UisTarget {
        UisTarget {
            team,
            port,
            token,
            ref_count: AtomicU32::new(1),
            sender,
        }
    }

    pub fn has_target(&self, port: i32, token: i32) -> bool {
        port == self.port && token == self.token
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /* Returns the count after the decrement; saturates at zero. */
    fn dec_ref(&self) -> u32 {
        let before = self.ref_count.load(Ordering::Relaxed);
        if before == 0 {
            return 0;
        }
        self.ref_count.store(before - 1, Ordering::Relaxed);
        before - 1
    }
}

/* The set of live targets, deduplicated by (port, token). */
pub struct TargetRegistry {
    targets: Mutex<Vec<Arc<UisTarget>>>,
    factory: PortFactory,
}

impl TargetRegistry {
    pub fn new(factory: PortFactory) -> TargetRegistry {
        TargetRegistry {
            targets: Mutex::new(Vec::new()),
            factory,
        }
    }

    /* Linear scan; a hit gains a reference, a miss appends a fresh entry. */
    pub fn find_or_add(&self, team: i32, port: i32, token: i32) -> Arc<UisTarget> {
        let mut targets = lock(&self.targets);

        for target in targets.iter() {
            if target.has_target(port, token) {
                target.inc_ref();
                return Arc::clone(target);
            }
        }

        let sender = (self.factory)(team, port, token);
        let target = Arc::new(UisTarget::new(team, port, token, sender));
        targets.push(Arc::clone(&target));
        debug!("New target port {} token {} (team {})", port, token, team);
        target
    }

    /* Drop one reference; the entry is erased when the count reaches zero. */
    pub fn remove(&self, target: &Arc<UisTarget>) {
        let mut targets = lock(&self.targets);
        if !targets.iter().any(|t| Arc::ptr_eq(t, target)) {
            return;
        }
        if target.dec_ref() == 0 {
            targets.retain(|t| !Arc::ptr_eq(t, target));
            debug!("Target port {} token {} evicted", target.port, target.token);
        }
    }

    /* Deliver one event. A target that is no longer registered fails with bad-value;
     * a dead endpoint drops the caller's reference and reports endpoint-gone so the
     * caller can drop its subscription too. */
    pub fn send_event(&self, target: &Arc<UisTarget>, cookie: u64, value: f32) -> Result<()> {
        {
            let targets = lock(&self.targets);
            if !targets.iter().any(|t| Arc::ptr_eq(t, target)) {
                return Err(UisError::BadValue);
            }
        }

        let event = EventMessage::ItemEvent {
            token: target.token,
            cookie,
            value,
        };
        match target.sender.send(&event) {
            Err(UisError::EndpointGone) => {
                warn!("Target port {} is gone, dropping it", target.port);
                self.remove(target);
                Err(UisError::EndpointGone)
            }
            other => other,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.targets).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.targets).is_empty()
    }
}

/* Sends events as JSON datagrams to the socket a client bound under its port number.
 * A refused or unlinked socket means the client went away. */
pub struct DatagramPort {
    socket: Option<UnixDatagram>,
    path: PathBuf,
}

impl DatagramPort {
    pub fn new(runtime_dir: &std::path::Path, port: i32) -> DatagramPort {
        DatagramPort {
            socket: UnixDatagram::unbound().ok(),
            path: config::port_path(runtime_dir, port),
        }
    }
}

impl EventPort for DatagramPort {
    fn send(&self, event: &EventMessage) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(UisError::EndpointGone)?;
        let body = serde_json::to_vec(event)
            .map_err(|err| UisError::IoFailed(std::io::Error::other(err)))?;
        match socket.send_to(&body, &self.path) {
            Ok(_) => Ok(()),
            Err(err) => match err.raw_os_error() {
                Some(nix::libc::ECONNREFUSED) | Some(nix::libc::ENOENT)
                | Some(nix::libc::ENOTCONN) => Err(UisError::EndpointGone),
                _ => Err(UisError::IoFailed(err)),
            },
        }
    }
}

/* The production factory: one datagram sender per target. */
pub fn datagram_port_factory(runtime_dir: PathBuf) -> PortFactory {
    Box::new(move |_team, port, _token| Box::new(DatagramPort::new(&runtime_dir, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Factory that counts sends and can be switched to a dead endpoint. */
    fn counting_factory(
        sent: Arc<Mutex<Vec<(i32, EventMessage)>>>,
        dead: Arc<AtomicU32>,
    ) -> PortFactory {
        Box::new(move |_team, port, _token| {
            let sent = Arc::clone(&sent);
            let dead = Arc::clone(&dead);
            Box::new(TestPort { port, sent, dead })
        })
    }

    struct TestPort {
        port: i32,
        sent: Arc<Mutex<Vec<(i32, EventMessage)>>>,
        dead: Arc<AtomicU32>,
    }

    impl EventPort for TestPort {
        fn send(&self, event: &EventMessage) -> Result<()> {
            if self.dead.load(Ordering::Relaxed) != 0 {
                return Err(UisError::EndpointGone);
            }
            lock(&self.sent).push((self.port, event.clone()));
            Ok(())
        }
    }

    fn registry() -> (TargetRegistry, Arc<Mutex<Vec<(i32, EventMessage)>>>, Arc<AtomicU32>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let dead = Arc::new(AtomicU32::new(0));
        let registry = TargetRegistry::new(counting_factory(Arc::clone(&sent), Arc::clone(&dead)));
        (registry, sent, dead)
    }

    #[test]
    fn test_find_or_add_dedups_by_port_and_token() {
        let (registry, _, _) = registry();
        let first = registry.find_or_add(10, 7, 0);
        let second = registry.find_or_add(99, 7, 0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(registry.len(), 1);

        /* A different token on the same port is a different target. */
        let third = registry.find_or_add(10, 7, 1);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ref_count_balance() {
        let (registry, _, _) = registry();
        let target = registry.find_or_add(1, 5, 0);
        for _ in 0..4 {
            registry.find_or_add(1, 5, 0);
        }
        assert_eq!(target.ref_count(), 5);

        for _ in 0..4 {
            registry.remove(&target);
            assert_eq!(registry.len(), 1);
        }
        registry.remove(&target);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_remove_unknown_target_is_noop() {
        let (registry, _, _) = registry();
        let target = registry.find_or_add(1, 5, 0);
        registry.remove(&target);
        assert!(registry.is_empty());
        /* Second removal must not underflow or re-erase. */
        registry.remove(&target);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_event_delivers() {
        let (registry, sent, _) = registry();
        let target = registry.find_or_add(1, 5, 3);
        registry.send_event(&target, 42, 0.5).unwrap();

        let sent = lock(&sent);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (5, EventMessage::ItemEvent { token, cookie, value }) => {
                assert_eq!(*token, 3);
                assert_eq!(*cookie, 42);
                assert_eq!(*value, 0.5);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_dead_endpoint_drops_one_reference() {
        let (registry, _, dead) = registry();
        let target = registry.find_or_add(1, 5, 0);
        registry.find_or_add(1, 5, 0);
        assert_eq!(target.ref_count(), 2);

        dead.store(1, Ordering::Relaxed);
        assert!(matches!(
            registry.send_event(&target, 0, 1.0),
            Err(UisError::EndpointGone)
        ));
        /* One reference dropped, the target stays until the second holder fails too. */
        assert_eq!(target.ref_count(), 1);
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            registry.send_event(&target, 0, 1.0),
            Err(UisError::EndpointGone)
        ));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_send_to_unregistered_target_is_bad_value() {
        let (registry, _, _) = registry();
        let target = registry.find_or_add(1, 5, 0);
        registry.remove(&target);
        assert!(matches!(
            registry.send_event(&target, 0, 1.0),
            Err(UisError::BadValue)
        ));
    }
}
