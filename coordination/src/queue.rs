//! Topic and task supply.
//!
//! Upstream ingestion ranks topics/tasks; engines only dequeue from a
//! [`WorkSource`] and never re-rank.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Ballot used when a topic declares no options of its own.
pub const DEFAULT_OPTIONS: [&str; 3] = ["Support", "Neutral", "Oppose"];

/// A debate subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Vote options; empty means [`DEFAULT_OPTIONS`].
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub rank: f64,
}

impl Topic {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            options: Vec::new(),
            rank: 0.0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rank(mut self, rank: f64) -> Self {
        self.rank = rank;
        self
    }

    /// Options offered on the ballot, deduplicated in declaration order.
    pub fn ballot_options(&self) -> Vec<String> {
        if self.options.is_empty() {
            return DEFAULT_OPTIONS.iter().map(|o| o.to_string()).collect();
        }
        let mut options: Vec<String> = Vec::with_capacity(self.options.len());
        for option in &self.options {
            if !options.contains(option) {
                options.push(option.clone());
            }
        }
        options
    }
}

/// A swarm task waiting for an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    /// Name of the assembly definition that runs this task.
    pub assembly: String,
    pub input: String,
    #[serde(default)]
    pub rank: f64,
}

/// Anything carrying an upstream rank.
pub trait Ranked {
    fn rank(&self) -> f64;
}

impl Ranked for Topic {
    fn rank(&self) -> f64 {
        self.rank
    }
}

impl Ranked for TaskSpec {
    fn rank(&self) -> f64 {
        self.rank
    }
}

/// Supplier of ready-to-run work.
#[async_trait]
pub trait WorkSource<T>: Send + Sync {
    /// Next item, or `None` when the source is drained.
    async fn next(&self) -> Option<T>;
}

struct Entry<T> {
    rank: f64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: higher rank first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .total_cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// In-memory priority queue: highest rank first, FIFO among equal ranks.
pub struct RankedQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

impl<T: Ranked + Send> RankedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub async fn push(&self, item: T) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            rank: item.rank(),
            seq,
            item,
        });
    }

    pub async fn pop(&self) -> Option<T> {
        self.inner.lock().await.heap.pop().map(|e| e.item)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<T: Ranked + Send> Default for RankedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Ranked + Send> WorkSource<T> for RankedQueue<T> {
    async fn next(&self) -> Option<T> {
        self.pop().await
    }
}
