//! Pipeline element: a worker thread around a processor with command-queue
//! control and observable state.
//!
//! Every decoder runs as one element. Control calls (`resume`, `pause`, `stop`,
//! `seek`, `terminate`) post a command to the worker and block on a state-event
//! bit with a default 3 s timeout; the worker serializes all transitions.
//! Status and info changes are delivered through a registered event callback in
//! FIFO order per element; no ordering holds across elements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::ringbuf::{Ringbuf, RingbufError};

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Init,
    Running,
    Paused,
    Finished,
    Stopped,
    Error,
}

/// Status values reported on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementStatus {
    Running,
    Paused,
    Finished,
    Stopped,
    ErrorOpen,
    ErrorInput,
    ErrorProcess,
    ErrorOutput,
    /// Input starved past its timeout; the element keeps running. Consumers use
    /// this for buffering UI, never as a fatal signal.
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
}

#[derive(Debug, Clone, Copy)]
pub enum ElementEvent {
    Status(ElementStatus),
    Info(StreamInfo),
    Position(u64),
}

pub type EventCallback = Arc<dyn Fn(&str, ElementEvent) + Send + Sync>;

/// I/O outcomes inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// End of stream.
    Done,
    /// The transfer was aborted by cancellation.
    Abort,
    /// No progress within the timeout.
    Timeout,
    /// Hard failure.
    Fail,
}

pub type IoResult = std::result::Result<usize, IoError>;

impl From<RingbufError> for IoError {
    fn from(err: RingbufError) -> Self {
        match err {
            RingbufError::Done => IoError::Done,
            RingbufError::Abort => IoError::Abort,
            RingbufError::Timeout => IoError::Timeout,
            RingbufError::TooLarge => IoError::Fail,
        }
    }
}

/// Byte supplier for an element: either a ringbuf filled by a producer thread
/// or a synchronous reader callback.
pub enum ElementInput {
    Ring(Arc<Ringbuf>),
    Reader(Box<dyn SourceReader>),
}

/// Synchronous input callback (sync-mode media source).
pub trait SourceReader: Send {
    fn open(&mut self) -> Result<(), IoError> {
        Ok(())
    }
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult;
    /// Reposition to an absolute stream offset.
    fn seek(&mut self, _offset: u64) -> Result<(), IoError> {
        Err(IoError::Fail)
    }
    fn close(&mut self, _paused: bool) {}
}

/// Output callback (PCM sink).
pub trait SinkWriter: Send {
    fn open(&mut self, _info: StreamInfo) -> Result<(), IoError> {
        Ok(())
    }
    fn write(&mut self, buf: &[u8]) -> IoResult;
    fn close(&mut self, _paused: bool) {}
}

impl ElementInput {
    fn open(&mut self) -> Result<(), IoError> {
        match self {
            ElementInput::Ring(_) => Ok(()),
            ElementInput::Reader(r) => r.open(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        match self {
            ElementInput::Ring(rb) => rb.read(buf, timeout).map_err(Into::into),
            ElementInput::Reader(r) => r.read(buf, timeout),
        }
    }

    pub fn read_chunk(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        match self {
            ElementInput::Ring(rb) => rb.read_chunk(buf, timeout).map_err(Into::into),
            ElementInput::Reader(r) => {
                // Callback inputs satisfy chunk reads by accumulation.
                let mut got = 0usize;
                while got < buf.len() {
                    match r.read(&mut buf[got..], timeout) {
                        Ok(0) => return if got > 0 { Ok(got) } else { Err(IoError::Done) },
                        Ok(n) => got += n,
                        Err(IoError::Done) => {
                            return if got > 0 { Ok(got) } else { Err(IoError::Done) };
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(got)
            }
        }
    }

    fn seek(&mut self, offset: u64) -> Result<(), IoError> {
        match self {
            // Ring-fed inputs are repositioned by restarting the producer.
            ElementInput::Ring(_) => Ok(()),
            ElementInput::Reader(r) => r.seek(offset),
        }
    }

    fn close(&mut self, paused: bool) {
        if let ElementInput::Reader(r) = self {
            r.close(paused);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailSite {
    Input,
    Output,
    Process,
}

/// The I/O context handed to the processor on every call.
pub struct ElementIo {
    pub input: ElementInput,
    output: Box<dyn SinkWriter>,
    output_open: bool,
    pub info: StreamInfo,
    pub input_timeout: Option<Duration>,
    byte_pos: u64,
    fail_site: FailSite,
    tag: Arc<str>,
    events: EventCallback,
}

impl ElementIo {
    pub fn read(&mut self, buf: &mut [u8]) -> IoResult {
        let timeout = self.input_timeout;
        let res = self.input.read(buf, timeout);
        if res == Err(IoError::Fail) {
            self.fail_site = FailSite::Input;
        }
        res
    }

    pub fn read_chunk(&mut self, buf: &mut [u8]) -> IoResult {
        let timeout = self.input_timeout;
        let res = self.input.read_chunk(buf, timeout);
        if res == Err(IoError::Fail) {
            self.fail_site = FailSite::Input;
        }
        res
    }

    /// Write decoded PCM to the sink, opening it lazily with the current info.
    pub fn write(&mut self, buf: &[u8]) -> IoResult {
        if !self.output_open {
            if let Err(e) = self.output.open(self.info) {
                self.fail_site = FailSite::Output;
                return Err(e);
            }
            self.output_open = true;
        }
        match self.output.write(buf) {
            Ok(n) => {
                self.byte_pos += n as u64;
                Ok(n)
            }
            Err(e) => {
                if e == IoError::Fail {
                    self.fail_site = FailSite::Output;
                }
                Err(e)
            }
        }
    }

    pub fn byte_pos(&self) -> u64 {
        self.byte_pos
    }

    /// Publish the discovered stream format.
    pub fn report_info(&self) {
        (self.events)(&self.tag, ElementEvent::Info(self.info));
    }

    pub fn report_position(&self) {
        (self.events)(&self.tag, ElementEvent::Position(self.byte_pos));
    }

    fn close(&mut self, paused: bool) {
        self.output.close(paused);
        self.output_open = false;
        self.input.close(paused);
        if !paused {
            self.byte_pos = 0;
        }
    }
}

/// The element's work: open/process/seek/close around the I/O context.
pub trait Processor: Send + 'static {
    fn open(&mut self, io: &mut ElementIo) -> Result<(), IoError>;
    /// One unit of work. `Ok(n)` is forward progress (n bytes written out),
    /// `Err(Done)` is natural end of stream.
    fn process(&mut self, io: &mut ElementIo) -> IoResult;
    fn seek(&mut self, io: &mut ElementIo, offset: u64) -> Result<(), IoError>;
    fn close(&mut self, io: &mut ElementIo, paused: bool);
}

/// Build a bare I/O context for driving processors directly in tests.
#[cfg(test)]
pub(crate) fn test_io(input: ElementInput, output: Box<dyn SinkWriter>) -> ElementIo {
    ElementIo {
        input,
        output,
        output_open: false,
        info: StreamInfo::default(),
        input_timeout: Some(Duration::from_millis(100)),
        byte_pos: 0,
        fail_site: FailSite::Process,
        tag: Arc::from("test"),
        events: Arc::new(|_, _| {}),
    }
}

enum Command {
    Resume,
    Pause,
    Stop,
    Seek(u64),
    Destroy,
}

const TASK_CREATED_BIT: u32 = 1 << 0;
const STARTED_BIT: u32 = 1 << 1;
const PAUSED_BIT: u32 = 1 << 3;
const RESUMED_BIT: u32 = 1 << 4;
const SEEKED_BIT: u32 = 1 << 5;
const STOPPED_BIT: u32 = 1 << 6;
const TASK_DESTROYED_BIT: u32 = 1 << 7;

struct Shared {
    tag: Arc<str>,
    state: Mutex<ElementState>,
    bits: Mutex<u32>,
    cond: Condvar,
    stopping: AtomicBool,
    is_running: AtomicBool,
    seek_ok: AtomicBool,
    task_run: AtomicBool,
    input_ring: Option<Arc<Ringbuf>>,
    events: EventCallback,
}

impl Shared {
    fn state(&self) -> ElementState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ElementState) {
        *self.state.lock().unwrap() = s;
    }

    fn set_bit(&self, bit: u32) {
        let mut bits = self.bits.lock().unwrap();
        *bits |= bit;
        self.cond.notify_all();
    }

    fn clear_bit(&self, bit: u32) {
        let mut bits = self.bits.lock().unwrap();
        *bits &= !bit;
    }

    fn wait_bit(&self, bit: u32, timeout: Duration) -> bool {
        let mut bits = self.bits.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *bits & bit == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, res) = self.cond.wait_timeout(bits, deadline - now).unwrap();
            bits = guard;
            if res.timed_out() && *bits & bit == 0 {
                return false;
            }
        }
        true
    }

    fn report(&self, status: ElementStatus) {
        (self.events)(&self.tag, ElementEvent::Status(status));
    }

    fn abort_input(&self) {
        if let Some(rb) = &self.input_ring {
            rb.abort();
        }
    }
}

pub struct ElementConfig {
    pub tag: String,
    pub input: ElementInput,
    pub output: Box<dyn SinkWriter>,
    pub processor: Box<dyn Processor>,
    pub events: EventCallback,
    pub input_timeout: Option<Duration>,
}

pub struct Element {
    shared: Arc<Shared>,
    tx: Sender<Command>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Element {
    /// Spawn the worker task; it idles in `Init` until resumed.
    pub fn spawn(cfg: ElementConfig) -> crate::Result<Self> {
        let tag: Arc<str> = Arc::from(cfg.tag.as_str());
        let input_ring = match &cfg.input {
            ElementInput::Ring(rb) => Some(rb.clone()),
            ElementInput::Reader(_) => None,
        };
        let shared = Arc::new(Shared {
            tag: tag.clone(),
            state: Mutex::new(ElementState::Init),
            bits: Mutex::new(0),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            seek_ok: AtomicBool::new(false),
            task_run: AtomicBool::new(false),
            input_ring,
            events: cfg.events.clone(),
        });

        let io = ElementIo {
            input: cfg.input,
            output: cfg.output,
            output_open: false,
            info: StreamInfo::default(),
            input_timeout: cfg.input_timeout,
            byte_pos: 0,
            fail_site: FailSite::Process,
            tag: tag.clone(),
            events: cfg.events,
        };

        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let processor = cfg.processor;
        let handle = thread::Builder::new()
            .name(format!("ael-{tag}"))
            .spawn(move || worker_main(worker_shared, rx, io, processor))
            .map_err(|e| crate::Error::msg(format!("failed to spawn element task: {e}")))?;

        let el = Self {
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
        };
        if !el.shared.wait_bit(TASK_CREATED_BIT, DEFAULT_CONTROL_TIMEOUT) {
            return Err(crate::Error::msg("element task did not start"));
        }
        Ok(el)
    }

    pub fn state(&self) -> ElementState {
        self.shared.state()
    }

    /// Transition to `Running`, opening the processor if needed.
    pub fn resume(&self) -> crate::Result<()> {
        match self.shared.state() {
            ElementState::Running => return Ok(()),
            ElementState::Error => return Err(crate::Error::InvalidState("element resume")),
            ElementState::Finished => {
                self.shared.report(ElementStatus::Finished);
                return Ok(());
            }
            _ => {}
        }
        self.shared.clear_bit(RESUMED_BIT);
        let _ = self.tx.send(Command::Resume);
        if !self.shared.wait_bit(RESUMED_BIT, DEFAULT_CONTROL_TIMEOUT) {
            return Err(crate::Error::msg("element resume timed out"));
        }
        if self.shared.is_running.load(Ordering::SeqCst)
            || self.shared.state() == ElementState::Finished
        {
            Ok(())
        } else {
            Err(crate::Error::msg("element failed to resume"))
        }
    }

    pub fn pause(&self) -> crate::Result<()> {
        match self.shared.state() {
            ElementState::Paused
            | ElementState::Finished
            | ElementState::Stopped
            | ElementState::Error => {
                self.shared.set_state(ElementState::Paused);
                return Ok(());
            }
            _ => {}
        }
        self.shared.clear_bit(PAUSED_BIT);
        let _ = self.tx.send(Command::Pause);
        if !self.shared.wait_bit(PAUSED_BIT, DEFAULT_CONTROL_TIMEOUT) {
            return Err(crate::Error::msg("element pause timed out"));
        }
        Ok(())
    }

    /// Request a stop: aborts blocked ringbuf I/O and posts the stop command.
    /// Pair with [`wait_for_stop`](Self::wait_for_stop).
    pub fn stop(&self) -> crate::Result<()> {
        let paused = self.shared.state() == ElementState::Paused;
        if !self.shared.is_running.load(Ordering::SeqCst) && !paused {
            self.shared.set_bit(STOPPED_BIT);
            self.shared.report(ElementStatus::Stopped);
            return Ok(());
        }
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.clear_bit(STOPPED_BIT);
        self.shared.abort_input();
        let _ = self.tx.send(Command::Stop);
        Ok(())
    }

    pub fn wait_for_stop(&self, timeout: Duration) -> crate::Result<()> {
        match self.shared.state() {
            ElementState::Stopped | ElementState::Init | ElementState::Finished => return Ok(()),
            _ => {}
        }
        if self.shared.wait_bit(STOPPED_BIT, timeout) {
            Ok(())
        } else {
            Err(crate::Error::msg("element stop timed out"))
        }
    }

    /// Seek to an absolute source byte offset. Legal while `Init`, `Running` or
    /// `Paused`.
    pub fn seek(&self, offset: u64) -> crate::Result<()> {
        match self.shared.state() {
            ElementState::Init | ElementState::Running | ElementState::Paused => {}
            _ => return Err(crate::Error::InvalidState("element seek")),
        }
        self.shared.clear_bit(SEEKED_BIT);
        self.shared.seek_ok.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Seek(offset));
        if !self.shared.wait_bit(SEEKED_BIT, DEFAULT_CONTROL_TIMEOUT) {
            return Err(crate::Error::msg("element seek timed out"));
        }
        if self.shared.seek_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::Error::msg("element seek failed"))
        }
    }

    /// Force the state back to `Init` so the element can be reopened after stop.
    pub fn reset_state(&self) {
        self.shared.set_state(ElementState::Init);
    }

    pub fn reset_input(&self) {
        if let Some(rb) = &self.shared.input_ring {
            rb.reset();
        }
    }

    /// Tear the worker down and join it.
    pub fn terminate(&self) {
        if !self.shared.task_run.load(Ordering::SeqCst) {
            return;
        }
        self.shared.clear_bit(TASK_DESTROYED_BIT);
        let _ = self.tx.send(Command::Destroy);
        self.shared.abort_input();
        if !self.shared.wait_bit(TASK_DESTROYED_BIT, DEFAULT_CONTROL_TIMEOUT) {
            warn!(tag = %self.shared.tag, "element task did not acknowledge destroy");
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Element {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct Worker {
    shared: Arc<Shared>,
    io: ElementIo,
    processor: Box<dyn Processor>,
    is_open: bool,
    running: bool,
}

fn worker_main(shared: Arc<Shared>, rx: Receiver<Command>, io: ElementIo, processor: Box<dyn Processor>) {
    shared.task_run.store(true, Ordering::SeqCst);
    shared.set_state(ElementState::Init);
    shared.set_bit(TASK_CREATED_BIT);

    let mut w = Worker {
        shared: shared.clone(),
        io,
        processor,
        is_open: false,
        running: false,
    };

    loop {
        let cmd = if w.running {
            match rx.try_recv() {
                Ok(c) => Some(c),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(c) => Some(c),
                Err(_) => break,
            }
        };

        if let Some(cmd) = cmd {
            if matches!(cmd, Command::Destroy) {
                break;
            }
            w.handle_command(cmd);
        }

        if w.running {
            w.process_once();
        }
    }

    if w.is_open {
        w.close_io(false);
    }
    debug!(tag = %shared.tag, "element task leaving");
    shared.task_run.store(false, Ordering::SeqCst);
    shared.is_running.store(false, Ordering::SeqCst);
    shared.set_bit(TASK_DESTROYED_BIT);
}

impl Worker {
    fn close_io(&mut self, paused: bool) {
        if self.is_open {
            self.processor.close(&mut self.io, paused);
            self.io.close(paused);
            self.is_open = false;
        }
    }

    fn set_running(&mut self, on: bool) {
        self.running = on;
        self.shared.is_running.store(on, Ordering::SeqCst);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Resume => self.on_resume(),
            Command::Pause => self.on_pause(),
            Command::Stop => self.on_stop(),
            Command::Seek(offset) => self.on_seek(offset),
            Command::Destroy => unreachable!("handled by the loop"),
        }
    }

    fn on_resume(&mut self) {
        if self.shared.state() == ElementState::Running {
            self.set_running(true);
            self.shared.set_bit(RESUMED_BIT);
            return;
        }
        if !self.is_open {
            let opened = self
                .io
                .input
                .open()
                .and_then(|()| self.processor.open(&mut self.io));
            if let Err(e) = opened {
                error!(tag = %self.shared.tag, ?e, "element open failed");
                self.shared.report(ElementStatus::ErrorOpen);
                self.enter_error();
                self.shared.set_bit(RESUMED_BIT);
                return;
            }
            self.is_open = true;
        }
        self.shared.set_state(ElementState::Running);
        self.shared.report(ElementStatus::Running);
        self.shared.clear_bit(STOPPED_BIT);
        self.set_running(true);
        self.shared.set_bit(STARTED_BIT);
        self.shared.set_bit(RESUMED_BIT);
    }

    fn on_pause(&mut self) {
        self.shared.set_state(ElementState::Paused);
        self.close_io(true);
        self.shared.report(ElementStatus::Paused);
        self.set_running(false);
        self.shared.set_bit(PAUSED_BIT);
    }

    fn on_stop(&mut self) {
        let state = self.shared.state();
        if state != ElementState::Finished && state != ElementState::Stopped {
            self.close_io(false);
        }
        self.shared.set_state(ElementState::Stopped);
        self.shared.report(ElementStatus::Stopped);
        self.set_running(false);
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.set_bit(STOPPED_BIT);
    }

    fn on_seek(&mut self, offset: u64) {
        let state = self.shared.state();
        let legal = matches!(
            state,
            ElementState::Init | ElementState::Running | ElementState::Paused
        );
        if legal {
            let res = self
                .io
                .input
                .seek(offset)
                .and_then(|()| self.processor.seek(&mut self.io, offset));
            match res {
                Ok(()) => self.shared.seek_ok.store(true, Ordering::SeqCst),
                Err(e) => warn!(tag = %self.shared.tag, ?e, "element seek failed"),
            }
        }
        self.shared.set_bit(SEEKED_BIT);
    }

    fn enter_finished(&mut self) {
        let state = self.shared.state();
        if state == ElementState::Error || state == ElementState::Stopped {
            return;
        }
        self.close_io(false);
        self.shared.set_state(ElementState::Finished);
        self.shared.report(ElementStatus::Finished);
        self.set_running(false);
        self.shared.set_bit(STOPPED_BIT);
    }

    fn enter_error(&mut self) {
        self.close_io(false);
        self.shared.set_state(ElementState::Error);
        self.shared.abort_input();
        self.set_running(false);
        self.shared.set_bit(STOPPED_BIT);
    }

    fn process_once(&mut self) {
        match self.processor.process(&mut self.io) {
            Ok(_) => {}
            Err(IoError::Done) => self.enter_finished(),
            Err(IoError::Timeout) => self.shared.report(ElementStatus::TimedOut),
            Err(IoError::Abort) => self.on_stop(),
            Err(IoError::Fail) => {
                let status = match self.io.fail_site {
                    FailSite::Input => ElementStatus::ErrorInput,
                    FailSite::Output => ElementStatus::ErrorOutput,
                    FailSite::Process => ElementStatus::ErrorProcess,
                };
                self.io.fail_site = FailSite::Process;
                self.shared.report(status);
                self.enter_error();
            }
        }
    }
}
