//! Delayed delivery of messages to the main queue
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::bus::{Publisher, QUEUE_POLL_INTERVAL};
use crate::message::{Message, TimerMessage};
use crate::task::AutoJoinHandle;

struct Scheduled {
    due: Instant,
    /// Keeps messages scheduled for the same instant in order
    seq: u64,
    message: Message,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

pub struct TimerService {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl TimerService {
    pub fn new(
        rx: flume::Receiver<Message>,
        main_queue: flume::Sender<Message>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            join_handle: AutoJoinHandle::spawn("timer", move || {
                let guard = crate::task::PanicGuard::new("timer", is_node_shutting_down.clone());
                Self::run(&rx, &main_queue, &is_node_shutting_down);
                guard.done();
            })?,
        })
    }

    fn run(
        rx: &flume::Receiver<Message>,
        main_queue: &flume::Sender<Message>,
        is_node_shutting_down: &AtomicBool,
    ) {
        let mut scheduled: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
        let mut seq = 0u64;

        while !is_node_shutting_down.load(Ordering::SeqCst) {
            let now = Instant::now();
            while let Some(Reverse(next)) = scheduled.peek() {
                if now < next.due {
                    break;
                }
                let Some(Reverse(due)) = scheduled.pop() else {
                    break;
                };
                main_queue.publish(due.message);
            }

            let timeout = scheduled
                .peek()
                .map(|Reverse(next)| next.due.saturating_duration_since(now))
                .unwrap_or(QUEUE_POLL_INTERVAL)
                .min(QUEUE_POLL_INTERVAL);

            match rx.recv_timeout(timeout) {
                Ok(Message::Timer(TimerMessage::Schedule { delay, message })) => {
                    trace!(?delay, "Scheduling");
                    seq += 1;
                    scheduled.push(Reverse(Scheduled {
                        due: Instant::now() + delay,
                        seq,
                        message: *message,
                    }));
                }
                Ok(other) => trace!(msg = ?other, "Unexpected message"),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::SystemMessage;

    #[test]
    fn messages_are_delivered_in_due_order() -> anyhow::Result<()> {
        let (timer_tx, timer_rx) = flume::unbounded();
        let (main_tx, main_rx) = flume::unbounded();
        let flag = Arc::new(AtomicBool::new(false));
        let _timer = TimerService::new(timer_rx, main_tx, flag.clone())?;

        timer_tx.publish(Message::schedule(
            Duration::from_millis(200),
            SystemMessage::ShutdownTimeout.into(),
        ));
        timer_tx.publish(Message::schedule(
            Duration::from_millis(50),
            SystemMessage::NoQuorum.into(),
        ));

        let first = main_rx.recv_timeout(Duration::from_secs(5))?;
        let second = main_rx.recv_timeout(Duration::from_secs(5))?;
        assert!(matches!(first, Message::System(SystemMessage::NoQuorum)));
        assert!(matches!(
            second,
            Message::System(SystemMessage::ShutdownTimeout)
        ));
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }
}
