//! Keyed, cancellable timers that deliver into the coordinator inbox.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::coordinator::Inbound;
use crate::event::Event;
use crate::transition::TimerKey;

struct ActiveTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timers owned by one coordinator.
///
/// Every keyed timer is stamped with a generation. A fire is only accepted
/// when its generation is still the current one for the key, so a fire that
/// was already queued when the timer was cancelled or replaced is dropped.
pub struct Timers {
    inbox: mpsc::Sender<Inbound>,
    active: HashMap<TimerKey, ActiveTimer>,
    one_shots: Vec<JoinHandle<()>>,
    next_generation: u64,
}

impl Timers {
    pub fn new(inbox: mpsc::Sender<Inbound>) -> Self {
        Self {
            inbox,
            active: HashMap::new(),
            one_shots: Vec::new(),
            next_generation: 0,
        }
    }

    /// Start a keyed timer, replacing any pending timer with the same key.
    pub fn start(&mut self, key: TimerKey, event: Event, after: Duration) {
        self.cancel(key);
        self.next_generation += 1;
        let generation = self.next_generation;

        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox
                .send(Inbound::Timer {
                    key,
                    generation,
                    event,
                })
                .await;
        });

        self.active.insert(key, ActiveTimer { generation, handle });
    }

    /// Cancel a keyed timer. Unknown keys are ignored.
    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(timer) = self.active.remove(&key) {
            debug!(?key, generation = timer.generation, "Cancelled timer");
            timer.handle.abort();
        }
    }

    /// Check a fire against the current generation and retire the timer
    /// when it matches.
    pub fn accept(&mut self, key: TimerKey, generation: u64) -> bool {
        match self.active.get(&key) {
            Some(timer) if timer.generation == generation => {
                self.active.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Check if a keyed timer is pending.
    pub fn is_active(&self, key: TimerKey) -> bool {
        self.active.contains_key(&key)
    }

    /// Deliver `event` once after `after`; not cancellable by key.
    pub fn schedule_once(&mut self, event: Event, after: Duration) {
        self.one_shots.retain(|handle| !handle.is_finished());

        let inbox = self.inbox.clone();
        self.one_shots.push(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Inbound::Event(event)).await;
        }));
    }

    /// Cancel everything, one-shots included.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.handle.abort();
        }
        for handle in self.one_shots.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_common::Address;

    fn next_timer(inbound: Option<Inbound>) -> (TimerKey, u64, Event) {
        match inbound {
            Some(Inbound::Timer {
                key,
                generation,
                event,
            }) => (key, generation, event),
            other => panic!("expected timer fire, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(
            TimerKey::HandOverRetry,
            Event::HandOverRetry { count: 1 },
            Duration::from_secs(1),
        );
        assert!(timers.is_active(TimerKey::HandOverRetry));

        let (key, generation, event) = next_timer(rx.recv().await);
        assert_eq!(key, TimerKey::HandOverRetry);
        assert_eq!(event, Event::HandOverRetry { count: 1 });
        assert!(timers.accept(key, generation));
        assert!(!timers.is_active(TimerKey::HandOverRetry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(
            TimerKey::TakeOverRetry,
            Event::TakeOverRetry { count: 1 },
            Duration::from_secs(1),
        );
        timers.start(
            TimerKey::TakeOverRetry,
            Event::TakeOverRetry { count: 2 },
            Duration::from_secs(5),
        );

        let (_, generation, event) = next_timer(rx.recv().await);
        assert_eq!(event, Event::TakeOverRetry { count: 2 });
        assert!(timers.accept(TimerKey::TakeOverRetry, generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_fire_after_cancel_is_rejected() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(
            TimerKey::HandOverRetry,
            Event::HandOverRetry { count: 1 },
            Duration::from_millis(10),
        );

        let fired = rx.recv().await;
        timers.cancel(TimerKey::HandOverRetry);
        let (key, generation, _) = next_timer(fired);
        assert!(!timers.accept(key, generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_silences_one_shots() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.schedule_once(
            Event::DelayedMemberRemoved {
                address: Address::from_parts("sys", "a", 2552),
            },
            Duration::from_secs(1),
        );
        timers.start(TimerKey::Cleanup, Event::Cleanup, Duration::from_secs(1));
        timers.cancel_all();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_delivers_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        let address = Address::from_parts("sys", "a", 2552);
        timers.schedule_once(
            Event::DelayedMemberRemoved {
                address: address.clone(),
            },
            Duration::from_secs(20),
        );

        match rx.recv().await {
            Some(Inbound::Event(Event::DelayedMemberRemoved { address: got })) => {
                assert_eq!(got, address)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
