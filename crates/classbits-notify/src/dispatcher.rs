use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use classbits_types::events::Notification;

/// Pushes committed notifications to live subscribers.
///
/// Persistence happens elsewhere; a notification published while nobody
/// listens is simply dropped here and still readable from the database.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// All notifications for all users; subscribers filter by recipient
    broadcast_tx: broadcast::Sender<Notification>,

    /// Live subscriber count per user
    listeners: Mutex<HashMap<Uuid, usize>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to notifications addressed to `user_id`.
    pub fn subscribe(&self, user_id: Uuid) -> Subscription {
        *self.listeners().entry(user_id).or_default() += 1;
        Subscription {
            user_id,
            rx: self.inner.broadcast_tx.subscribe(),
            dispatcher: self.clone(),
        }
    }

    /// Send each notification whose recipient has a live subscription. The
    /// rest stay in the database only.
    pub fn publish(&self, notifications: Vec<Notification>) {
        for n in notifications {
            if !self.is_listening(n.recipient) {
                continue;
            }
            debug!("Notify {} ({})", n.recipient, n.kind.as_str());
            // Err only means the last receiver went away meanwhile
            let _ = self.inner.broadcast_tx.send(n);
        }
    }

    fn is_listening(&self, user_id: Uuid) -> bool {
        self.listeners().get(&user_id).is_some_and(|n| *n > 0)
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<Uuid, usize>> {
        // The map holds plain counters; a panic mid-update cannot corrupt it
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, user_id: Uuid) {
        let mut listeners = self.listeners();
        if let Some(n) = listeners.get_mut(&user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                listeners.remove(&user_id);
            }
        }
    }
}

/// A user's view of the notification stream. Dropping it unregisters.
pub struct Subscription {
    user_id: Uuid,
    rx: broadcast::Receiver<Notification>,
    dispatcher: Dispatcher,
}

impl Subscription {
    /// Wait for the next notification addressed to this user. A lagging
    /// receiver skips what it missed; the database still has it.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) if n.recipient == self.user_id => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Subscriber {} lagged by {} notifications", self.user_id, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.release(self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use classbits_types::events::NotificationKind;

    fn notification(recipient: Uuid) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            recipient,
            kind: NotificationKind::SiphonShareReceived,
            message: "You received 25 bits".into(),
            siphon_id: Uuid::new_v4(),
            classroom_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_only_sees_own_notifications() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = dispatcher.subscribe(alice);
        assert!(dispatcher.is_listening(alice));
        assert!(!dispatcher.is_listening(bob));

        let for_alice = notification(alice);
        dispatcher.publish(vec![notification(bob), for_alice.clone()]);

        let got = sub.next().await.unwrap();
        assert_eq!(got.id, for_alice.id);

        drop(sub);
        assert!(!dispatcher.is_listening(alice));
    }

    #[tokio::test]
    async fn notifications_for_absent_users_are_not_queued() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = dispatcher.subscribe(alice);

        dispatcher.publish(vec![notification(bob)]);
        assert!(sub.rx.is_empty());

        let for_alice = notification(alice);
        dispatcher.publish(vec![for_alice.clone()]);
        assert_eq!(sub.rx.len(), 1);
        assert_eq!(sub.next().await.unwrap().id, for_alice.id);
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        Dispatcher::new().publish(vec![notification(Uuid::new_v4())]);
    }
}
