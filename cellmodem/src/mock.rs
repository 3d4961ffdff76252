//! # mock - Scripted stand-ins for the modem's hardware
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! `MockPort` plays the module: each write is matched against a list of
//! rules and the matching rule's reply is queued for the receive path.
//! `MockClock` is simulated time, so a sixty second registration poll runs
//! instantly. `MockPins` records every power line transition with the
//! simulated time it happened at.
//!
//! All three are cheap handles onto shared state; keep a clone in the test
//! to inspect what the driver did after handing the original to a `Modem`.
//!
//! ```
//! use cellmodem::mock::{MockClock, MockPort};
//! use cellmodem::hal::SerialPort;
//!
//! let clock = MockClock::new();
//! let port = MockPort::with_clock(&clock);
//! port.expect("AT", "\r\nOK\r\n");
//! let mut driver_side = port.clone();
//! driver_side.write(b"AT\r\n", 100).unwrap();
//! let mut got = Vec::new();
//! driver_side.receive(&mut |b| { got.push(b); true });
//! assert_eq!(got, b"\r\nOK\r\n");
//! ```

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::hal::{Clock, PowerControl, SerialPort};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Simulated monotonic time. `delay_ms` just moves the counter on.
#[derive(Clone, Default)]
pub struct MockClock {
	now: Rc<Cell<u64>>,
}

/// A scripted module on the end of a serial line.
#[derive(Clone)]
pub struct MockPort {
	state: Rc<RefCell<PortState>>,
	clock: MockClock,
}

/// Which power line changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pin {
	PowerEnable,
	PowerKey,
}

/// One recorded power line transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PinEvent {
	pub pin: Pin,
	pub high: bool,
	pub at_ms: u64,
}

/// Records power line transitions.
#[derive(Clone)]
pub struct MockPins {
	events: Rc<RefCell<Vec<PinEvent>>>,
	clock: MockClock,
}

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

enum Pattern {
	/// The whole command line, terminator excluded
	Command(Vec<u8>),
	/// The start of a command line
	CommandPrefix(Vec<u8>),
	/// An exact raw write
	Data(Vec<u8>),
}

struct Rule {
	pattern: Pattern,
	reply: Vec<u8>,
	delay_ms: u64,
	/// None means the rule never runs out
	remaining: Option<usize>,
}

struct PortState {
	rules: Vec<Rule>,
	/// Bytes waiting for the driver, with the time they become visible
	pending: VecDeque<(u64, u8)>,
	written: Vec<Vec<u8>>,
	baud: Option<u32>,
	fail_writes: bool,
	max_burst: Option<usize>,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl MockClock {
	pub fn new() -> MockClock {
		MockClock::default()
	}

	pub fn now(&self) -> u64 {
		self.now.get()
	}

	pub fn advance(&self, ms: u64) {
		self.now.set(self.now.get() + ms);
	}
}

impl Clock for MockClock {
	fn delay_ms(&mut self, ms: u32) {
		self.advance(u64::from(ms));
	}

	fn now_ms(&self) -> u64 {
		self.now()
	}
}

impl MockPort {
	/// A port with its own private clock. Replies are visible immediately.
	pub fn new() -> MockPort {
		MockPort::with_clock(&MockClock::new())
	}

	/// A port that shares the driver's clock, so delayed replies and
	/// injections line up with the driver's waits.
	pub fn with_clock(clock: &MockClock) -> MockPort {
		MockPort {
			state: Rc::new(RefCell::new(PortState {
				rules: Vec::new(),
				pending: VecDeque::new(),
				written: Vec::new(),
				baud: None,
				fail_writes: false,
				max_burst: None,
			})),
			clock: clock.clone(),
		}
	}

	/// Reply once to exactly `cmd`.
	pub fn expect(&self, cmd: &str, reply: &str) -> &MockPort {
		self.add(Pattern::Command(cmd.as_bytes().to_vec()), reply.as_bytes(), 0, Some(1))
	}

	/// Reply once to exactly `cmd`, but only after `delay_ms` of simulated
	/// time.
	pub fn expect_delayed(&self, cmd: &str, reply: &str, delay_ms: u64) -> &MockPort {
		self.add(
			Pattern::Command(cmd.as_bytes().to_vec()),
			reply.as_bytes(),
			delay_ms,
			Some(1),
		)
	}

	/// Reply to exactly `cmd` every time it is sent.
	pub fn always(&self, cmd: &str, reply: &str) -> &MockPort {
		self.add(Pattern::Command(cmd.as_bytes().to_vec()), reply.as_bytes(), 0, None)
	}

	/// Reply every time a command starting with `prefix` is sent.
	pub fn always_prefix(&self, prefix: &str, reply: &str) -> &MockPort {
		self.add(
			Pattern::CommandPrefix(prefix.as_bytes().to_vec()),
			reply.as_bytes(),
			0,
			None,
		)
	}

	/// Reply once when exactly `data` is written raw (a payload, not a
	/// command).
	pub fn expect_data(&self, data: &[u8], reply: &[u8]) -> &MockPort {
		self.add(Pattern::Data(data.to_vec()), reply, 0, Some(1))
	}

	/// Queue bytes that arrive without being asked for.
	pub fn inject(&self, data: &[u8]) {
		self.inject_after(data, 0);
	}

	/// Queue unsolicited bytes that become visible `delay_ms` from now.
	pub fn inject_after(&self, data: &[u8], delay_ms: u64) {
		let at = self.clock.now() + delay_ms;
		let mut state = self.state.borrow_mut();
		state.pending.extend(data.iter().map(|b| (at, *b)));
	}

	/// Make every write fail.
	pub fn fail_writes(&self, fail: bool) {
		self.state.borrow_mut().fail_writes = fail;
	}

	/// Deliver at most `n` bytes per `receive` call, as a slow line would.
	pub fn set_max_burst(&self, n: usize) {
		self.state.borrow_mut().max_burst = Some(n);
	}

	/// Everything the driver wrote, one entry per write.
	pub fn written(&self) -> Vec<Vec<u8>> {
		self.state.borrow().written.clone()
	}

	/// Every write as text, with the line terminator removed.
	pub fn commands(&self) -> Vec<String> {
		self.state
			.borrow()
			.written
			.iter()
			.map(|w| String::from_utf8_lossy(strip_terminator(w)).into_owned())
			.collect()
	}

	/// How many writes were a command starting with `prefix`.
	pub fn count(&self, prefix: &str) -> usize {
		self.commands().iter().filter(|c| c.starts_with(prefix)).count()
	}

	/// Bytes still queued for the driver.
	pub fn pending(&self) -> usize {
		self.state.borrow().pending.len()
	}

	pub fn baud(&self) -> Option<u32> {
		self.state.borrow().baud
	}
}

impl Default for MockPort {
	fn default() -> MockPort {
		MockPort::new()
	}
}

impl SerialPort for MockPort {
	fn configure(&mut self, baud: u32) -> io::Result<()> {
		self.state.borrow_mut().baud = Some(baud);
		Ok(())
	}

	fn write(&mut self, data: &[u8], _timeout_ms: u32) -> io::Result<()> {
		let now = self.clock.now();
		let mut state = self.state.borrow_mut();
		if state.fail_writes {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
		}
		state.written.push(data.to_vec());
		let reply = state
			.rules
			.iter_mut()
			.find(|r| r.remaining != Some(0) && r.pattern.matches(data))
			.map(|r| {
				if let Some(n) = r.remaining.as_mut() {
					*n -= 1;
				}
				(now + r.delay_ms, r.reply.clone())
			});
		if let Some((at, bytes)) = reply {
			state.pending.extend(bytes.into_iter().map(|b| (at, b)));
		}
		Ok(())
	}

	fn receive(&mut self, accept: &mut dyn FnMut(u8) -> bool) -> usize {
		let now = self.clock.now();
		let mut state = self.state.borrow_mut();
		let limit = state.max_burst.unwrap_or(usize::max_value());
		let mut count = 0;
		while count < limit {
			match state.pending.front() {
				Some(&(at, byte)) if at <= now => {
					if !accept(byte) {
						break;
					}
					state.pending.pop_front();
					count += 1;
				}
				_ => break,
			}
		}
		count
	}
}

impl MockPins {
	pub fn new(clock: &MockClock) -> MockPins {
		MockPins {
			events: Rc::new(RefCell::new(Vec::new())),
			clock: clock.clone(),
		}
	}

	pub fn events(&self) -> Vec<PinEvent> {
		self.events.borrow().clone()
	}

	/// The last level driven on `pin`, if it was ever driven.
	pub fn level(&self, pin: Pin) -> Option<bool> {
		self.events
			.borrow()
			.iter()
			.rev()
			.find(|e| e.pin == pin)
			.map(|e| e.high)
	}

	fn record(&self, pin: Pin, high: bool) {
		self.events.borrow_mut().push(PinEvent {
			pin,
			high,
			at_ms: self.clock.now(),
		});
	}
}

impl PowerControl for MockPins {
	fn set_power_enable(&mut self, high: bool) {
		self.record(Pin::PowerEnable, high);
	}

	fn set_power_key(&mut self, high: bool) {
		self.record(Pin::PowerKey, high);
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl MockPort {
	fn add(
		&self,
		pattern: Pattern,
		reply: &[u8],
		delay_ms: u64,
		remaining: Option<usize>,
	) -> &MockPort {
		self.state.borrow_mut().rules.push(Rule {
			pattern,
			reply: reply.to_vec(),
			delay_ms,
			remaining,
		});
		self
	}
}

impl Pattern {
	fn matches(&self, data: &[u8]) -> bool {
		match *self {
			Pattern::Command(ref cmd) => {
				data.ends_with(b"\r\n") && strip_terminator(data) == cmd.as_slice()
			}
			Pattern::CommandPrefix(ref prefix) => {
				data.ends_with(b"\r\n") && strip_terminator(data).starts_with(prefix)
			}
			Pattern::Data(ref bytes) => data == bytes.as_slice(),
		}
	}
}

fn strip_terminator(data: &[u8]) -> &[u8] {
	if data.ends_with(b"\r\n") {
		&data[..data.len() - 2]
	} else {
		data
	}
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
