// src/motion/planner.rs - Planner port and the queue-backed simulator

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::system::SystemState;
use crate::Position;

use super::MotionRequest;

/// Planner port: the dispatcher hands fully-validated segment targets to an
/// implementation of this trait and never looks at motion below it again.
#[async_trait]
pub trait Planner: Send {
    fn buffer_has_room(&self) -> bool;
    /// Queue one segment. Returns false if the planner cannot accept it.
    fn enqueue(&mut self, target: Position, request: &MotionRequest) -> bool;
    /// Advance the realtime side by one tick. Returns true once the queue
    /// is drained.
    fn step(&mut self) -> bool;
    /// Discard everything queued. The realtime position stays where it is.
    fn reset(&mut self);
    /// Position of the realtime side right now.
    fn position(&self) -> Position;
    /// Run the queue dry. Returns false if an abort interrupted the wait.
    async fn synchronize(&mut self, system: &SystemState) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMove {
    pub target: Position,
    pub feed_rate: f32,
    pub is_rapid: bool,
    pub line_number: i32,
}

#[derive(Debug)]
struct SimInner {
    queue: VecDeque<QueuedMove>,
    position: Position,
    capacity: usize,
    history: Vec<QueuedMove>,
}

/// In-memory planner: a bounded queue whose "realtime side" teleports to
/// each target on `step`. Clones share the same queue so tests can inspect
/// what the dispatcher produced.
#[derive(Debug, Clone)]
pub struct SimPlanner {
    inner: Arc<Mutex<SimInner>>,
}

impl SimPlanner {
    pub fn new(capacity: usize) -> Self {
        SimPlanner {
            inner: Arc::new(Mutex::new(SimInner {
                queue: VecDeque::with_capacity(capacity),
                position: [0.0; crate::N_AXIS],
                capacity,
                history: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every segment ever enqueued, in order.
    pub fn history(&self) -> Vec<QueuedMove> {
        self.lock().history.clone()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn set_position(&self, position: Position) {
        self.lock().position = position;
    }
}

#[async_trait]
impl Planner for SimPlanner {
    fn buffer_has_room(&self) -> bool {
        let inner = self.lock();
        inner.queue.len() < inner.capacity
    }

    fn enqueue(&mut self, target: Position, request: &MotionRequest) -> bool {
        let mut inner = self.lock();
        if inner.queue.len() >= inner.capacity {
            return false;
        }
        let queued = QueuedMove {
            target,
            feed_rate: request.feed_rate,
            is_rapid: request.is_rapid,
            line_number: request.line_number,
        };
        inner.queue.push_back(queued.clone());
        inner.history.push(queued);
        true
    }

    fn step(&mut self) -> bool {
        let mut inner = self.lock();
        if let Some(queued) = inner.queue.pop_front() {
            inner.position = queued.target;
        }
        inner.queue.is_empty()
    }

    fn reset(&mut self) {
        self.lock().queue.clear();
    }

    fn position(&self) -> Position {
        self.lock().position
    }

    async fn synchronize(&mut self, system: &SystemState) -> bool {
        loop {
            if self.step() {
                return true;
            }
            if system.is_abort() {
                return false;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_respects_capacity() {
        let mut planner = SimPlanner::new(2);
        let request = MotionRequest::default();
        assert!(planner.enqueue([1.0, 0.0, 0.0], &request));
        assert!(planner.enqueue([2.0, 0.0, 0.0], &request));
        assert!(!planner.buffer_has_room());
        assert!(!planner.enqueue([3.0, 0.0, 0.0], &request));
    }

    #[test]
    fn step_advances_position_to_each_target() {
        let mut planner = SimPlanner::new(8);
        let request = MotionRequest::default();
        planner.enqueue([1.0, 0.0, 0.0], &request);
        planner.enqueue([1.0, 2.0, 0.0], &request);
        assert!(!planner.step());
        assert_eq!(planner.position(), [1.0, 0.0, 0.0]);
        assert!(planner.step());
        assert_eq!(planner.position(), [1.0, 2.0, 0.0]);
    }

    #[tokio::test]
    async fn synchronize_drains_queue() {
        let mut planner = SimPlanner::new(8);
        let system = SystemState::new();
        let request = MotionRequest::default();
        planner.enqueue([0.0, 0.0, -5.0], &request);
        assert!(planner.synchronize(&system).await);
        assert_eq!(planner.queued(), 0);
        assert_eq!(planner.position(), [0.0, 0.0, -5.0]);
    }

    #[tokio::test]
    async fn synchronize_bails_on_abort() {
        let mut planner = SimPlanner::new(8);
        let system = SystemState::new();
        system.request_abort();
        let request = MotionRequest::default();
        planner.enqueue([1.0, 0.0, 0.0], &request);
        planner.enqueue([2.0, 0.0, 0.0], &request);
        // first step runs, then the abort is seen
        assert!(!planner.synchronize(&system).await);
    }
}
