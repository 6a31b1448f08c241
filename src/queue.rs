use crate::task::deadline_after;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned by [`TaskQueue::enqueue`] once the queue is closed; hands the item back.
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("QueueClosed(..)")
  }
}

impl<T> fmt::Display for QueueClosed<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("queue is closed")
  }
}

impl<T> StdError for QueueClosed<T> {}

/// Result of a bounded wait on a queue.
#[derive(Debug)]
pub enum Dequeue<T> {
  Item(T),
  TimedOut,
  Closed,
}

/// Hand-off point between submitters and workers.
///
/// Closing a queue stops new enqueues. Items already inside are still handed out; once the
/// queue is both closed and empty every blocked and future `dequeue` returns the closed signal
/// instead of blocking.
pub trait TaskQueue<T: Send>: Send + Sync {
  /// Adds `item`, blocking while the queue cannot accept it.
  fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>>;

  /// Adds `item` only if that is possible without blocking.
  fn offer(&self, item: T) -> Result<(), T>;

  /// Blocks until an item is available (`Some`) or the queue is closed and empty (`None`).
  fn dequeue(&self) -> Option<T>;

  fn dequeue_timeout(&self, timeout: Duration) -> Dequeue<T>;

  fn close(&self);

  fn is_closed(&self) -> bool;

  /// Removes and returns every buffered item.
  fn drain(&self) -> Vec<T>;

  /// Removes and returns the buffered items matching `predicate`.
  fn remove_if(&self, predicate: &mut dyn FnMut(&T) -> bool) -> Vec<T>;

  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn extract_matching<T>(items: impl IntoIterator<Item = T>, predicate: &mut dyn FnMut(&T) -> bool) -> (Vec<T>, Vec<T>) {
  let mut removed = Vec::new();
  let mut kept = Vec::new();
  for item in items {
    if predicate(&item) {
      removed.push(item);
    } else {
      kept.push(item);
    }
  }
  (removed, kept)
}

// --- FIFO ---

struct FifoState<T> {
  items: VecDeque<T>,
  closed: bool,
}

/// First-in first-out queue, unbounded or bounded with back-pressure on `enqueue`.
pub struct FifoQueue<T> {
  capacity: Option<usize>,
  state: Mutex<FifoState<T>>,
  not_empty: Condvar,
  not_full: Condvar,
}

impl<T> fmt::Debug for FifoQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("FifoQueue")
      .field("capacity", &self.capacity)
      .field("len", &state.items.len())
      .field("closed", &state.closed)
      .finish()
  }
}

impl<T> FifoQueue<T> {
  pub fn unbounded() -> Self {
    Self::with_capacity(None)
  }

  /// A queue holding at most `capacity` items (minimum 1).
  pub fn bounded(capacity: usize) -> Self {
    Self::with_capacity(Some(capacity.max(1)))
  }

  fn with_capacity(capacity: Option<usize>) -> Self {
    Self {
      capacity,
      state: Mutex::new(FifoState {
        items: VecDeque::new(),
        closed: false,
      }),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
    }
  }

  fn has_room(&self, state: &FifoState<T>) -> bool {
    self.capacity.map_or(true, |cap| state.items.len() < cap)
  }
}

impl<T: Send> TaskQueue<T> for FifoQueue<T> {
  fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>> {
    let mut state = self.state.lock();
    loop {
      if state.closed {
        return Err(QueueClosed(item));
      }
      if self.has_room(&state) {
        state.items.push_back(item);
        self.not_empty.notify_one();
        return Ok(());
      }
      self.not_full.wait(&mut state);
    }
  }

  fn offer(&self, item: T) -> Result<(), T> {
    let mut state = self.state.lock();
    if state.closed || !self.has_room(&state) {
      return Err(item);
    }
    state.items.push_back(item);
    self.not_empty.notify_one();
    Ok(())
  }

  fn dequeue(&self) -> Option<T> {
    let mut state = self.state.lock();
    loop {
      if let Some(item) = state.items.pop_front() {
        self.not_full.notify_one();
        return Some(item);
      }
      if state.closed {
        return None;
      }
      self.not_empty.wait(&mut state);
    }
  }

  fn dequeue_timeout(&self, timeout: Duration) -> Dequeue<T> {
    let Some(deadline) = deadline_after(timeout) else {
      return self.dequeue().map_or(Dequeue::Closed, Dequeue::Item);
    };
    let mut state = self.state.lock();
    loop {
      if let Some(item) = state.items.pop_front() {
        self.not_full.notify_one();
        return Dequeue::Item(item);
      }
      if state.closed {
        return Dequeue::Closed;
      }
      if self.not_empty.wait_until(&mut state, deadline).timed_out() && state.items.is_empty() {
        return if state.closed { Dequeue::Closed } else { Dequeue::TimedOut };
      }
    }
  }

  fn close(&self) {
    self.state.lock().closed = true;
    self.not_empty.notify_all();
    self.not_full.notify_all();
  }

  fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  fn drain(&self) -> Vec<T> {
    let drained: Vec<T> = self.state.lock().items.drain(..).collect();
    self.not_full.notify_all();
    drained
  }

  fn remove_if(&self, predicate: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
    let mut state = self.state.lock();
    let items = std::mem::take(&mut state.items);
    let (removed, kept) = extract_matching(items, predicate);
    state.items = kept.into();
    drop(state);
    if !removed.is_empty() {
      self.not_full.notify_all();
    }
    removed
  }

  fn len(&self) -> usize {
    self.state.lock().items.len()
  }
}

// --- Synchronous hand-off ---

struct HandoffState<T> {
  waiting_consumers: usize,
  handed: VecDeque<T>,
  closed: bool,
}

/// Direct hand-off with no buffering: an item is only accepted when a consumer is already
/// waiting for it.
pub struct HandoffQueue<T> {
  state: Mutex<HandoffState<T>>,
  item_ready: Condvar,
  consumer_arrived: Condvar,
}

impl<T> fmt::Debug for HandoffQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("HandoffQueue")
      .field("waiting_consumers", &state.waiting_consumers)
      .field("closed", &state.closed)
      .finish()
  }
}

impl<T> Default for HandoffQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> HandoffQueue<T> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(HandoffState {
        waiting_consumers: 0,
        handed: VecDeque::new(),
        closed: false,
      }),
      item_ready: Condvar::new(),
      consumer_arrived: Condvar::new(),
    }
  }

  /// Number of consumers currently blocked waiting for an item.
  pub fn waiting_consumers(&self) -> usize {
    let state = self.state.lock();
    state.waiting_consumers - state.handed.len()
  }
}

impl<T: Send> TaskQueue<T> for HandoffQueue<T> {
  fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>> {
    let mut state = self.state.lock();
    loop {
      if state.closed {
        return Err(QueueClosed(item));
      }
      if state.waiting_consumers > state.handed.len() {
        state.handed.push_back(item);
        self.item_ready.notify_one();
        return Ok(());
      }
      self.consumer_arrived.wait(&mut state);
    }
  }

  fn offer(&self, item: T) -> Result<(), T> {
    let mut state = self.state.lock();
    if state.closed || state.waiting_consumers <= state.handed.len() {
      return Err(item);
    }
    state.handed.push_back(item);
    self.item_ready.notify_one();
    Ok(())
  }

  fn dequeue(&self) -> Option<T> {
    let mut state = self.state.lock();
    state.waiting_consumers += 1;
    self.consumer_arrived.notify_one();
    let received = loop {
      if let Some(item) = state.handed.pop_front() {
        break Some(item);
      }
      if state.closed {
        break None;
      }
      self.item_ready.wait(&mut state);
    };
    state.waiting_consumers -= 1;
    received
  }

  fn dequeue_timeout(&self, timeout: Duration) -> Dequeue<T> {
    let Some(deadline) = deadline_after(timeout) else {
      return self.dequeue().map_or(Dequeue::Closed, Dequeue::Item);
    };
    let mut state = self.state.lock();
    state.waiting_consumers += 1;
    self.consumer_arrived.notify_one();
    let received = loop {
      // An item handed over just as the wait expired still belongs to this consumer.
      if let Some(item) = state.handed.pop_front() {
        break Dequeue::Item(item);
      }
      if state.closed {
        break Dequeue::Closed;
      }
      if self.item_ready.wait_until(&mut state, deadline).timed_out() && state.handed.is_empty() {
        break if state.closed { Dequeue::Closed } else { Dequeue::TimedOut };
      }
    };
    state.waiting_consumers -= 1;
    received
  }

  fn close(&self) {
    self.state.lock().closed = true;
    self.item_ready.notify_all();
    self.consumer_arrived.notify_all();
  }

  fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  fn drain(&self) -> Vec<T> {
    self.state.lock().handed.drain(..).collect()
  }

  fn remove_if(&self, predicate: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
    let mut state = self.state.lock();
    let items = std::mem::take(&mut state.handed);
    let (removed, kept) = extract_matching(items, predicate);
    state.handed = kept.into();
    removed
  }

  fn len(&self) -> usize {
    self.state.lock().handed.len()
  }
}

// --- Delay-ordered ---

/// Items ordered by a due-time.
pub trait Delayed {
  fn due(&self) -> Instant;
}

struct DelayEntry<T> {
  due: Instant,
  seq: u64,
  item: T,
}

impl<T> PartialEq for DelayEntry<T> {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.seq == other.seq
  }
}

impl<T> Eq for DelayEntry<T> {}

impl<T> PartialOrd for DelayEntry<T> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for DelayEntry<T> {
  // Reversed: BinaryHeap is a max-heap and the earliest (due, seq) must surface first.
  fn cmp(&self, other: &Self) -> Ordering {
    other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
  }
}

struct DelayState<T> {
  heap: BinaryHeap<DelayEntry<T>>,
  next_seq: u64,
  closed: bool,
}

/// Priority queue handing out items only once their due-time has arrived. Ties on due-time
/// come out in insertion order.
pub struct DelayQueue<T> {
  state: Mutex<DelayState<T>>,
  available: Condvar,
}

impl<T> fmt::Debug for DelayQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("DelayQueue")
      .field("len", &state.heap.len())
      .field("closed", &state.closed)
      .finish()
  }
}

impl<T> Default for DelayQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> DelayQueue<T> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(DelayState {
        heap: BinaryHeap::new(),
        next_seq: 0,
        closed: false,
      }),
      available: Condvar::new(),
    }
  }

  /// Due-time of the earliest entry.
  pub fn peek_due(&self) -> Option<Instant> {
    self.state.lock().heap.peek().map(|entry| entry.due)
  }

  fn take_due(&self, state: &mut DelayState<T>, now: Instant) -> Option<T> {
    match state.heap.peek() {
      Some(entry) if entry.due <= now => {
        let entry = state.heap.pop()?;
        if !state.heap.is_empty() {
          self.available.notify_one();
        }
        Some(entry.item)
      }
      _ => None,
    }
  }
}

impl<T: Delayed + Send> TaskQueue<T> for DelayQueue<T> {
  fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>> {
    self.offer(item).map_err(QueueClosed)
  }

  fn offer(&self, item: T) -> Result<(), T> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(item);
    }
    let seq = state.next_seq;
    state.next_seq += 1;
    state.heap.push(DelayEntry {
      due: item.due(),
      seq,
      item,
    });
    // Waiters may be sleeping towards a later head; let them recompute.
    self.available.notify_all();
    Ok(())
  }

  fn dequeue(&self) -> Option<T> {
    let mut state = self.state.lock();
    loop {
      if let Some(item) = self.take_due(&mut state, Instant::now()) {
        return Some(item);
      }
      match state.heap.peek().map(|entry| entry.due) {
        Some(due) => {
          self.available.wait_until(&mut state, due);
        }
        None if state.closed => return None,
        None => self.available.wait(&mut state),
      }
    }
  }

  fn dequeue_timeout(&self, timeout: Duration) -> Dequeue<T> {
    let Some(deadline) = deadline_after(timeout) else {
      return self.dequeue().map_or(Dequeue::Closed, Dequeue::Item);
    };
    let mut state = self.state.lock();
    loop {
      let now = Instant::now();
      if let Some(item) = self.take_due(&mut state, now) {
        return Dequeue::Item(item);
      }
      if state.heap.is_empty() && state.closed {
        return Dequeue::Closed;
      }
      if now >= deadline {
        return Dequeue::TimedOut;
      }
      let wake_at = state.heap.peek().map_or(deadline, |entry| entry.due.min(deadline));
      self.available.wait_until(&mut state, wake_at);
    }
  }

  fn close(&self) {
    self.state.lock().closed = true;
    self.available.notify_all();
  }

  fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  fn drain(&self) -> Vec<T> {
    let mut state = self.state.lock();
    let mut entries = std::mem::take(&mut state.heap).into_sorted_vec();
    // into_sorted_vec is ascending by the reversed ordering, i.e. latest first.
    entries.reverse();
    entries.into_iter().map(|entry| entry.item).collect()
  }

  fn remove_if(&self, predicate: &mut dyn FnMut(&T) -> bool) -> Vec<T> {
    let mut state = self.state.lock();
    let entries = std::mem::take(&mut state.heap).into_vec();
    let (removed, kept) = extract_matching(entries, &mut |entry: &DelayEntry<T>| predicate(&entry.item));
    state.heap = BinaryHeap::from(kept);
    drop(state);
    self.available.notify_all();
    removed.into_iter().map(|entry| entry.item).collect()
  }

  fn len(&self) -> usize {
    self.state.lock().heap.len()
  }
}
