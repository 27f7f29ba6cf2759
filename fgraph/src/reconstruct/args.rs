//! Per-context queues of captured argument values
//!
//! Payloads arrive on their own stream. A collector thread files them by
//! thread id; the event loop takes them in FIFO order when the matching event
//! is recorded, waiting if the payload stream lags behind.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::domain::{ArgPayload, ReconstructError, Tid};

#[derive(Debug, Default)]
pub struct ArgQueues {
    queues: Mutex<HashMap<Tid, VecDeque<ArgPayload>>>,
    arrived: Condvar,
}

impl ArgQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: ArgPayload) {
        trace!("arg #{} for {}", payload.index, payload.context);
        self.queues.lock().entry(payload.context).or_default().push_back(payload);
        self.arrived.notify_all();
    }

    /// Payloads waiting for `context`
    #[must_use]
    pub fn pending(&self, context: Tid) -> usize {
        self.queues.lock().get(&context).map_or(0, VecDeque::len)
    }

    /// Remove the oldest `count` payloads of `context`
    ///
    /// # Errors
    /// Returns `ArgTimeout` if fewer than `count` payloads have arrived when
    /// `timeout` runs out. Nothing is removed in that case.
    pub fn take(&self, context: Tid, count: usize, timeout: Duration) -> Result<Vec<ArgPayload>, ReconstructError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let mut queues = self.queues.lock();
        loop {
            let available = queues.get(&context).map_or(0, VecDeque::len);
            if available >= count {
                break;
            }
            if self.arrived.wait_until(&mut queues, deadline).timed_out() {
                let available = queues.get(&context).map_or(0, VecDeque::len);
                if available >= count {
                    break;
                }
                return Err(ReconstructError::ArgTimeout {
                    context,
                    wanted: count,
                    available,
                    waited_ms: start.elapsed().as_millis(),
                });
            }
        }

        let Some(queue) = queues.get_mut(&context) else {
            return Ok(Vec::new());
        };
        let taken = queue.drain(..count).collect();
        if queue.is_empty() {
            queues.remove(&context);
        }
        Ok(taken)
    }
}

/// File every payload from `payloads` into `queues` until the stream ends
///
/// # Errors
/// Returns an error if the thread cannot be spawned
pub fn spawn_collector(queues: Arc<ArgQueues>, payloads: Receiver<ArgPayload>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("fgraph-argq".to_string())
        .spawn(move || {
            for payload in payloads {
                queues.push(payload);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tid: u32, index: u32) -> ArgPayload {
        ArgPayload { context: Tid(tid), index, data: vec![0; 8] }
    }

    #[test]
    fn test_fifo_per_context() {
        let queues = ArgQueues::new();
        queues.push(payload(1, 0));
        queues.push(payload(2, 0));
        queues.push(payload(1, 1));

        let taken = queues.take(Tid(1), 2, Duration::from_millis(10)).unwrap();
        assert_eq!(taken.iter().map(|p| p.index).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(queues.pending(Tid(1)), 0);
        assert_eq!(queues.pending(Tid(2)), 1);
    }

    #[test]
    fn test_take_zero_never_waits() {
        let queues = ArgQueues::new();
        assert!(queues.take(Tid(1), 0, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_leaves_queue_intact() {
        let queues = ArgQueues::new();
        queues.push(payload(1, 0));
        let err = queues.take(Tid(1), 2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ReconstructError::ArgTimeout { wanted: 2, available: 1, .. }));
        assert_eq!(queues.pending(Tid(1)), 1);
    }

    #[test]
    fn test_waits_for_late_payloads() {
        let queues = Arc::new(ArgQueues::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let collector = spawn_collector(Arc::clone(&queues), rx).unwrap();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(payload(5, 0)).unwrap();
            tx.send(payload(5, 1)).unwrap();
        });

        let taken = queues.take(Tid(5), 2, Duration::from_secs(5)).unwrap();
        assert_eq!(taken.len(), 2);
        sender.join().unwrap();
        collector.join().unwrap();
    }
}
