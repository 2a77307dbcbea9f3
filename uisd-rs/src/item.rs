/* A single value field within a report. Owns its subscription list; delivery and
 * subscription changes serialize on the item's own lock, so a value fan-out can never
 * interleave with a set-target on the same item. */
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Result, UisError};
use crate::node::DeviceNode;
use crate::proto::NULL_TOKEN;
use crate::sync::lock;
use crate::target::{TargetRegistry, UisTarget};
use crate::wire::KernelHandle;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/* An (item, target, cookie) binding. The handle is the opaque value handed back to the
 * client so it can replace or release the binding later. */
pub struct Subscription {
    pub handle: u64,
    pub target: Arc<UisTarget>,
    pub cookie: u64,
}

pub struct ReportItem {
    kernel_item: KernelHandle,
    usage_page: u16,
    usage_id: u16,
    is_relative: bool,
    /* Last seen value, stored as f32 bits. */
    value: AtomicU32,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ReportItem {
    pub fn new(node: &dyn DeviceNode, report: KernelHandle, index: i32) -> Result<ReportItem> {
        let info = node.item_info(report, index)?;
        Ok(ReportItem {
            kernel_item: info.item,
            usage_page: info.usage_page,
            usage_id: info.usage_id,
            is_relative: info.is_relative,
            value: AtomicU32::new(0f32.to_bits()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn kernel_item(&self) -> KernelHandle {
        self.kernel_item
    }

    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    pub fn usage_id(&self) -> u16 {
        self.usage_id
    }

    pub fn is_relative(&self) -> bool {
        self.is_relative
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }

    /* Store the new value and fan it out to every subscriber. A subscription whose
     * endpoint is gone is dropped on the spot; the registry has already given up the
     * reference by the time send_event reports the failure. */
    pub fn set_value(&self, value: f32, targets: &TargetRegistry) {
        self.value.store(value.to_bits(), Ordering::Relaxed);

        let mut subscriptions = lock(&self.subscriptions);
        let mut n = 0;
        while n < subscriptions.len() {
            let subscription = &subscriptions[n];
            match targets.send_event(&subscription.target, subscription.cookie, value) {
                Err(UisError::EndpointGone) => {
                    debug!(
                        "Dropping subscription {} after endpoint loss",
                        subscription.handle
                    );
                    subscriptions.remove(n);
                }
                _ => n += 1,
            }
        }
    }

    /* Rebind or clear the subscription identified by `prior` (0 for none). The prior
     * target reference is always released first; a null team, port or token then means
     * "clear". Returns the subscription handle, 0 after a clear. */
    pub fn set_target(
        &self,
        prior: u64,
        team: i32,
        port: i32,
        token: i32,
        cookie: u64,
        targets: &TargetRegistry,
    ) -> Result<u64> {
        let mut subscriptions = lock(&self.subscriptions);

        let prior_pos = if prior != 0 {
            let pos = subscriptions.iter().position(|s| s.handle == prior);
            if pos.is_none() {
                return Err(UisError::BadValue);
            }
            pos
        } else {
            None
        };

        if let Some(pos) = prior_pos {
            targets.remove(&subscriptions[pos].target);
        }

        if team == -1 || port == -1 || token == NULL_TOKEN {
            if let Some(pos) = prior_pos {
                subscriptions.remove(pos);
            }
            return Ok(0);
        }

        let target = targets.find_or_add(team, port, token);
        match prior_pos {
            Some(pos) => {
                subscriptions[pos].target = target;
                subscriptions[pos].cookie = cookie;
                Ok(subscriptions[pos].handle)
            }
            None => {
                let handle = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
                subscriptions.push(Subscription {
                    handle,
                    target,
                    cookie,
                });
                Ok(handle)
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EventMessage;
    use crate::target::{EventPort, PortFactory};

    struct SinkPort {
        sent: Arc<Mutex<Vec<EventMessage>>>,
        dead: Arc<AtomicU32>,
    }

    impl EventPort for SinkPort {
        fn send(&self, event: &EventMessage) -> Result<()> {
            if self.dead.load(Ordering::Relaxed) != 0 {
                return Err(UisError::EndpointGone);
            }
            lock(&self.sent).push(event.clone());
            Ok(())
        }
    }

    fn sink_registry() -> (TargetRegistry, Arc<Mutex<Vec<EventMessage>>>, Arc<AtomicU32>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let dead = Arc::new(AtomicU32::new(0));
        let factory: PortFactory = {
            let sent = Arc::clone(&sent);
            let dead = Arc::clone(&dead);
            Box::new(move |_, _, _| {
                Box::new(SinkPort {
                    sent: Arc::clone(&sent),
                    dead: Arc::clone(&dead),
                })
            })
        };
        (TargetRegistry::new(factory), sent, dead)
    }

    fn bare_item() -> ReportItem {
        ReportItem {
            kernel_item: KernelHandle(1),
            usage_page: 0x01,
            usage_id: 0x30,
            is_relative: false,
            value: AtomicU32::new(0f32.to_bits()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_set_value_updates_and_delivers() {
        let (targets, sent, _) = sink_registry();
        let item = bare_item();
        let handle = item.set_target(0, 1, 5, 0, 7, &targets).unwrap();
        assert_ne!(handle, 0);

        item.set_value(0.5, &targets);
        assert_eq!(item.value(), 0.5);

        let sent = lock(&sent);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            EventMessage::ItemEvent { cookie, value, .. } => {
                assert_eq!(*cookie, 7);
                assert_eq!(*value, 0.5);
            }
        }
    }

    #[test]
    fn test_multiple_subscriptions_each_get_one_event() {
        let (targets, sent, _) = sink_registry();
        let item = bare_item();
        item.set_target(0, 1, 5, 0, 100, &targets).unwrap();
        item.set_target(0, 1, 6, 0, 200, &targets).unwrap();

        item.set_value(1.0, &targets);
        let cookies: Vec<u64> = lock(&sent)
            .iter()
            .map(|EventMessage::ItemEvent { cookie, .. }| *cookie)
            .collect();
        assert_eq!(cookies, vec![100, 200]);
    }

    #[test]
    fn test_clear_target_releases_reference() {
        let (targets, _, _) = sink_registry();
        let item = bare_item();
        let handle = item.set_target(0, 1, 5, 0, 0, &targets).unwrap();
        assert_eq!(targets.len(), 1);

        let cleared = item.set_target(handle, -1, -1, NULL_TOKEN, 0, &targets).unwrap();
        assert_eq!(cleared, 0);
        assert_eq!(item.subscription_count(), 0);
        assert_eq!(targets.len(), 0);
    }

    #[test]
    fn test_rebind_keeps_handle_and_swaps_target() {
        let (targets, sent, _) = sink_registry();
        let item = bare_item();
        let handle = item.set_target(0, 1, 5, 0, 7, &targets).unwrap();
        let rebound = item.set_target(handle, 1, 6, 0, 9, &targets).unwrap();
        assert_eq!(rebound, handle);
        assert_eq!(item.subscription_count(), 1);
        /* The port-5 target lost its only reference when the binding moved. */
        assert_eq!(targets.len(), 1);

        item.set_value(0.25, &targets);
        match &lock(&sent)[0] {
            EventMessage::ItemEvent { token: _, cookie, .. } => assert_eq!(*cookie, 9),
        }
    }

    #[test]
    fn test_unknown_prior_handle_is_bad_value() {
        let (targets, _, _) = sink_registry();
        let item = bare_item();
        assert!(matches!(
            item.set_target(999, 1, 5, 0, 0, &targets),
            Err(UisError::BadValue)
        ));
    }

    #[test]
    fn test_endpoint_death_drops_subscription() {
        let (targets, _, dead) = sink_registry();
        let item = bare_item();
        item.set_target(0, 1, 5, 0, 7, &targets).unwrap();

        dead.store(1, Ordering::Relaxed);
        item.set_value(1.0, &targets);
        assert_eq!(item.subscription_count(), 0);
        assert_eq!(targets.len(), 0);
        /* The value itself still updated. */
        assert_eq!(item.value(), 1.0);
    }
}
