use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

/// 队列中的一项; 同优先级按入队序号先进先出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: String,
    pub priority: i32,
    seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 优先级任务队列, 另带一个等待退避结束的延迟区
#[derive(Debug, Default)]
pub struct TaskQueue {
    ready: BinaryHeap<QueueEntry>,
    delayed: Vec<(Instant, QueueEntry)>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, task_id: String, priority: i32) -> QueueEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        QueueEntry {
            task_id,
            priority,
            seq,
        }
    }

    pub fn push(&mut self, task_id: impl Into<String>, priority: i32) {
        let entry = self.entry(task_id.into(), priority);
        self.ready.push(entry);
    }

    /// 在 `ready_at` 之前不参与派发
    pub fn push_delayed(&mut self, task_id: impl Into<String>, priority: i32, ready_at: Instant) {
        let entry = self.entry(task_id.into(), priority);
        self.delayed.push((ready_at, entry));
    }

    /// 放回一个本轮没能派发的条目, 保留原来的先后次序
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.ready.push(entry);
    }

    /// 把退避结束的条目移入就绪堆
    pub fn promote_ready(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, entry) = self.delayed.swap_remove(index);
                self.ready.push(entry);
                promoted += 1;
            } else {
                index += 1;
            }
        }
        promoted
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.ready.pop()
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.len();
        self.ready.retain(|entry| entry.task_id != task_id);
        self.delayed.retain(|(_, entry)| entry.task_id != task_id);
        self.len() != before
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
