//! Bounded single-producer/single-consumer byte buffer.
//!
//! This is the backpressure primitive between the media source feeder and the
//! decoder, and between the TTS writer and the TTS source. Blocking `read`/`write`
//! move at least one byte or fail with a terminal condition; `read_chunk`/
//! `write_chunk` are all-or-nothing. A `done_write` flag lets the producer signal
//! end of stream, `abort` wakes every blocked side during cancellation, and an
//! optional reader threshold delays the first reads until an initial prefetch has
//! accumulated (sticky once crossed).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Terminal conditions returned by ringbuf operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingbufError {
    /// Producer finished; no more data will arrive (reads drain, writes fail).
    Done,
    /// The buffer was aborted; the blocked call must unwind.
    Abort,
    /// The timeout expired (or the reader was force-unblocked) before progress.
    Timeout,
    /// The request can never be satisfied (chunk larger than capacity).
    TooLarge,
}

pub type RingbufResult = std::result::Result<usize, RingbufError>;

struct State {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    filled: usize,
    threshold: usize,
    reached_threshold: bool,
    done_write: bool,
    abort: bool,
    unblock_reader: bool,
}

impl State {
    fn available(&self) -> usize {
        self.buf.len() - self.filled
    }

    fn pop(&mut self, out: &mut [u8]) {
        let n = out.len();
        let cap = self.buf.len();
        let first = n.min(cap - self.read_pos);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        if first < n {
            out[first..].copy_from_slice(&self.buf[..n - first]);
        }
        self.read_pos = (self.read_pos + n) % cap;
        self.filled -= n;
    }

    fn push(&mut self, data: &[u8]) {
        let n = data.len();
        let cap = self.buf.len();
        let first = n.min(cap - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..]);
        }
        self.write_pos = (self.write_pos + n) % cap;
        self.filled += n;
        if !self.reached_threshold && self.filled >= self.threshold {
            self.reached_threshold = true;
        }
    }
}

pub struct Ringbuf {
    state: Mutex<State>,
    can_read: Condvar,
    can_write: Condvar,
    capacity: usize,
}

impl Ringbuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                filled: 0,
                threshold: 0,
                reached_threshold: false,
                done_write: false,
                abort: false,
                unblock_reader: false,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_filled(&self) -> usize {
        self.state.lock().unwrap().filled
    }

    pub fn bytes_available(&self) -> usize {
        self.state.lock().unwrap().available()
    }

    pub fn is_done_write(&self) -> bool {
        self.state.lock().unwrap().done_write
    }

    /// Reads do not unblock until this many bytes have been buffered once.
    pub fn set_threshold(&self, threshold: usize) {
        let mut st = self.state.lock().unwrap();
        st.threshold = threshold.min(self.capacity);
    }

    pub fn reached_threshold(&self) -> bool {
        self.state.lock().unwrap().reached_threshold
    }

    /// Clear contents and every flag, making the buffer reusable.
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.read_pos = 0;
        st.write_pos = 0;
        st.filled = 0;
        st.done_write = false;
        st.abort = false;
        st.unblock_reader = false;
        st.reached_threshold = false;
        self.can_write.notify_one();
    }

    /// Wake both sides with `Abort`.
    pub fn abort(&self) {
        let mut st = self.state.lock().unwrap();
        st.abort = true;
        self.can_read.notify_one();
        self.can_write.notify_one();
    }

    /// Producer signals end of stream; remaining bytes stay readable.
    pub fn done_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.done_write = true;
        // Buffered bytes must drain even if the prefetch threshold was never met.
        st.reached_threshold = true;
        self.can_read.notify_one();
        self.can_write.notify_one();
    }

    /// Force a blocked reader out with `Timeout` on its next wakeup.
    pub fn unblock_reader(&self) {
        let mut st = self.state.lock().unwrap();
        st.unblock_reader = true;
        self.can_read.notify_one();
    }

    /// Blocking read: returns once at least one byte moved, or a terminal condition.
    ///
    /// `timeout` of `None` waits forever. A zero-length buffer returns `Ok(0)`
    /// immediately.
    pub fn read(&self, out: &mut [u8], timeout: Option<Duration>) -> RingbufResult {
        if out.is_empty() {
            return Ok(0);
        }
        let mut st = self.state.lock().unwrap();
        let mut total = 0usize;
        let mut err = None;
        while total < out.len() {
            let want = out.len() - total;
            let take = want.min(st.filled);
            if take == 0 || !st.reached_threshold {
                if st.done_write {
                    err = Some(RingbufError::Done);
                    break;
                }
                if st.abort {
                    err = Some(RingbufError::Abort);
                    break;
                }
                if st.unblock_reader {
                    err = Some(RingbufError::Timeout);
                    break;
                }
                self.can_write.notify_one();
                match timeout {
                    Some(t) => {
                        let (guard, res) = self.can_read.wait_timeout(st, t).unwrap();
                        st = guard;
                        if res.timed_out() {
                            err = Some(RingbufError::Timeout);
                            break;
                        }
                    }
                    None => st = self.can_read.wait(st).unwrap(),
                }
                continue;
            }
            st.pop(&mut out[total..total + take]);
            total += take;
        }
        if total > 0 {
            self.can_write.notify_one();
            return Ok(total);
        }
        Err(err.unwrap_or(RingbufError::Timeout))
    }

    /// Blocking write, symmetric with [`read`](Self::read).
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> RingbufResult {
        if data.is_empty() {
            return Ok(0);
        }
        let mut st = self.state.lock().unwrap();
        let mut total = 0usize;
        let mut err = None;
        while total < data.len() {
            let want = data.len() - total;
            let put = want.min(st.available());
            if put == 0 {
                if st.done_write {
                    err = Some(RingbufError::Done);
                    st.reached_threshold = true;
                    break;
                }
                if st.abort {
                    err = Some(RingbufError::Abort);
                    st.reached_threshold = true;
                    break;
                }
                self.can_read.notify_one();
                match timeout {
                    Some(t) => {
                        let (guard, res) = self.can_write.wait_timeout(st, t).unwrap();
                        st = guard;
                        if res.timed_out() {
                            err = Some(RingbufError::Timeout);
                            break;
                        }
                    }
                    None => st = self.can_write.wait(st).unwrap(),
                }
                continue;
            }
            st.push(&data[total..total + put]);
            total += put;
        }
        if total > 0 && st.reached_threshold {
            self.can_read.notify_one();
        }
        drop(st);
        if total > 0 {
            return Ok(total);
        }
        Err(err.unwrap_or(RingbufError::Timeout))
    }

    /// All-or-nothing read: blocks until `out.len()` bytes are available.
    ///
    /// A short tail at end of stream (after `done_write`) is delivered partially.
    pub fn read_chunk(&self, out: &mut [u8], timeout: Option<Duration>) -> RingbufResult {
        if out.is_empty() {
            return Ok(0);
        }
        let mut st = self.state.lock().unwrap();
        loop {
            let take = if st.filled < out.len() {
                if st.done_write { st.filled } else { 0 }
            } else {
                out.len()
            };

            if take == 0 || !st.reached_threshold {
                if st.done_write {
                    return Err(RingbufError::Done);
                }
                if st.abort {
                    return Err(RingbufError::Abort);
                }
                if st.unblock_reader {
                    return Err(RingbufError::Timeout);
                }
                if out.len() > self.capacity {
                    return Err(RingbufError::TooLarge);
                }
                self.can_write.notify_one();
                match timeout {
                    Some(t) => {
                        let (guard, res) = self.can_read.wait_timeout(st, t).unwrap();
                        st = guard;
                        if res.timed_out() {
                            return Err(RingbufError::Timeout);
                        }
                    }
                    None => st = self.can_read.wait(st).unwrap(),
                }
                continue;
            }

            st.pop(&mut out[..take]);
            self.can_write.notify_one();
            return Ok(take);
        }
    }

    /// All-or-nothing write, symmetric with [`read_chunk`](Self::read_chunk).
    pub fn write_chunk(&self, data: &[u8], timeout: Option<Duration>) -> RingbufResult {
        if data.is_empty() {
            return Ok(0);
        }
        let mut st = self.state.lock().unwrap();
        loop {
            let put = if st.available() < data.len() {
                if st.done_write { st.available() } else { 0 }
            } else {
                data.len()
            };

            if put == 0 {
                if st.done_write {
                    st.reached_threshold = true;
                    return Err(RingbufError::Done);
                }
                if st.abort {
                    st.reached_threshold = true;
                    return Err(RingbufError::Abort);
                }
                if data.len() > self.capacity {
                    st.reached_threshold = true;
                    return Err(RingbufError::TooLarge);
                }
                self.can_read.notify_one();
                match timeout {
                    Some(t) => {
                        let (guard, res) = self.can_write.wait_timeout(st, t).unwrap();
                        st = guard;
                        if res.timed_out() {
                            return Err(RingbufError::Timeout);
                        }
                    }
                    None => st = self.can_write.wait(st).unwrap(),
                }
                continue;
            }

            st.push(&data[..put]);
            if st.reached_threshold {
                self.can_read.notify_one();
            }
            return Ok(put);
        }
    }
}
