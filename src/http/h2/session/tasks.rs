//! Per-session task runner.
//!
//! Loop continuations, deferred stream-request completions and timers are
//! posted here instead of on a global scheduler; the session's owner drains
//! them with [`Session::run_until_idle`](super::Session::run_until_idle).

use super::super::request::PendingStreamRequest;
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
pub(crate) enum Task {
    PumpRead,
    PumpWrite,
    CompleteStreamRequest(PendingStreamRequest),
    CheckPingStatus { last_check_time: Instant },
    SweepPushedStreams,
}

#[derive(Debug)]
struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: Task,
}

#[derive(Debug, Default)]
pub(crate) struct TaskRunner {
    immediate: VecDeque<Task>,
    delayed: Vec<DelayedTask>,
    next_seq: u64,
    read_posted: bool,
    write_posted: bool,
}

impl TaskRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `task` on the next turn. Loop pumps are posted at most once.
    pub(crate) fn post(&mut self, task: Task) {
        match task {
            Task::PumpRead if self.read_posted => return,
            Task::PumpWrite if self.write_posted => return,
            Task::PumpRead => self.read_posted = true,
            Task::PumpWrite => self.write_posted = true,
            _ => {}
        }
        self.immediate.push_back(task);
    }

    /// Run `task` once the clock reaches `deadline`
    pub(crate) fn post_delayed(&mut self, task: Task, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = self
            .delayed
            .partition_point(|t| (t.deadline, t.seq) <= (deadline, seq));
        self.delayed.insert(pos, DelayedTask { deadline, seq, task });
    }

    /// Next runnable task: immediate ones first, then expired timers in
    /// deadline order
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<Task> {
        let task = match self.immediate.pop_front() {
            Some(task) => task,
            None if self.delayed.first().is_some_and(|t| t.deadline <= now) => self.delayed.remove(0).task,
            None => return None,
        };
        match task {
            Task::PumpRead => self.read_posted = false,
            Task::PumpWrite => self.write_posted = false,
            _ => {}
        }
        Some(task)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.delayed.first().map(|t| t.deadline)
    }

    pub(crate) fn has_immediate(&self) -> bool {
        !self.immediate.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.immediate.len() + self.delayed.len()
    }

    /// Drop every task. Queued stream requests see their channel close.
    pub(crate) fn clear(&mut self) {
        self.immediate.clear();
        self.delayed.clear();
        self.read_posted = false;
        self.write_posted = false;
    }
}
