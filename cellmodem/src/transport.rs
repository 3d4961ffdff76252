//! # transport - Send a line, then wait for what comes back
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! Every exchange with the module is the same shape: drop whatever is left
//! over from last time, write a command line, then poll the receive path
//! until the reply shows what we're waiting for or the budget runs out. The
//! polling is cooperative - sleep one tick, look again - and a wait can't be
//! cancelled once started.
//!
//! Received bytes go three places. The ring buffer is the hand-off from the
//! port. From there each byte is appended to the raw capture (unstripped,
//! used to pull binary payloads out of replies) and to one of two line
//! buffers (carriage returns stripped, used for matching and tokenizing).
//! The secondary line buffer lets a caller soak up an unsolicited result
//! code without disturbing the reply it has already collected.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::borrow::Cow;
use std::cmp;
use std::fmt;
use std::ops::Range;

use crate::config::Config;
use crate::hal::{Clock, SerialPort};
use crate::ring::RingBuffer;
use crate::tokenize;
use crate::Error;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Bounded scratch area for one exchange's reply text.
pub struct LineBuffer {
	data: Vec<u8>,
	capacity: usize,
	dropped: usize,
}

/// Which line buffer a wait should collect into.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
	Primary,
	Secondary,
}

/// The line-oriented half of the driver: owns the port, the clock, the ring
/// buffer and the per-exchange buffers.
pub struct Transport {
	port: Box<dyn SerialPort>,
	clock: Box<dyn Clock>,
	ring: RingBuffer,
	primary: LineBuffer,
	secondary: LineBuffer,
	capture: Vec<u8>,
	capture_capacity: usize,
	tick_ms: u32,
	settle_ms: u32,
	write_timeout_ms: u32,
	overruns: usize,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const TERMINATOR: &[u8] = b"\r\n";

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl LineBuffer {
	pub fn new(capacity: usize) -> LineBuffer {
		LineBuffer {
			data: Vec::with_capacity(capacity),
			capacity,
			dropped: 0,
		}
	}

	/// Append a received byte. Carriage returns are dropped, as is a line
	/// feed arriving at position zero; anything past capacity is counted
	/// and discarded.
	pub fn push(&mut self, byte: u8) {
		if byte == b'\r' || (byte == b'\n' && self.data.is_empty()) {
			return;
		}
		if self.data.len() < self.capacity {
			self.data.push(byte);
		} else {
			self.dropped += 1;
		}
	}

	pub fn clear(&mut self) {
		self.data.clear();
		self.dropped = 0;
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.data
	}

	pub fn text(&self) -> Cow<str> {
		String::from_utf8_lossy(&self.data)
	}

	pub fn contains(&self, token: &str) -> bool {
		let token = token.as_bytes();
		token.is_empty() || self.data.windows(token.len()).any(|w| w == token)
	}

	/// Number of `\n` terminated lines collected so far.
	pub fn line_count(&self) -> usize {
		self.data.iter().filter(|b| **b == b'\n').count()
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Bytes thrown away because the buffer was full.
	pub fn dropped(&self) -> usize {
		self.dropped
	}
}

impl Transport {
	pub fn new(port: Box<dyn SerialPort>, clock: Box<dyn Clock>, config: &Config) -> Transport {
		Transport {
			port,
			clock,
			ring: RingBuffer::new(config.rx_capacity),
			primary: LineBuffer::new(config.line_capacity),
			secondary: LineBuffer::new(config.line_capacity),
			capture: Vec::with_capacity(config.capture_capacity),
			capture_capacity: config.capture_capacity,
			tick_ms: cmp::max(config.tick_ms, 1),
			settle_ms: config.settle_ms,
			write_timeout_ms: config.write_timeout_ms,
			overruns: 0,
		}
	}

	/// Bring the serial peripheral up.
	pub fn configure(&mut self, baud: u32) -> Result<(), Error> {
		debug!("Configuring serial port at {} baud", baud);
		self.port.configure(baud)?;
		Ok(())
	}

	/// Start a new exchange: forget everything received so far, let the line
	/// settle, then write `cmd` and the terminator.
	pub fn send_command(&mut self, cmd: &str) -> Result<(), Error> {
		self.ring.reset();
		self.primary.clear();
		self.secondary.clear();
		self.capture.clear();
		self.clock.delay_ms(self.settle_ms);
		let mut stale = 0;
		loop {
			let n = self.port.receive(&mut |_| true);
			if n == 0 {
				break;
			}
			stale += n;
		}
		if stale > 0 {
			debug!("Discarded {} stale bytes", stale);
		}
		debug!("Tx: {}", cmd);
		let mut line = Vec::with_capacity(cmd.len() + TERMINATOR.len());
		line.extend_from_slice(cmd.as_bytes());
		line.extend_from_slice(TERMINATOR);
		self.port.write(&line, self.write_timeout_ms)?;
		Ok(())
	}

	/// Write payload bytes in the middle of an exchange (after a `> ` or
	/// `CONNECT` prompt). Nothing is reset and no terminator is added.
	pub fn send_raw(&mut self, data: &[u8]) -> Result<(), Error> {
		debug!("Tx: {} raw bytes", data.len());
		self.port.write(data, self.write_timeout_ms)?;
		Ok(())
	}

	/// Clear the primary buffer ahead of a wait that isn't preceded by a
	/// command, such as waiting for a start-up URC.
	pub fn begin_wait(&mut self) {
		self.primary.clear();
	}

	/// Wait until `token` appears in the primary buffer.
	pub fn await_token(&mut self, token: &str, timeout_ms: u32) -> Result<(), Error> {
		let result = self.wait_for(Slot::Primary, timeout_ms, |buf, _| buf.contains(token));
		if result.is_err() {
			debug!(
				"No {:?} within {} ms, got {:?}",
				token,
				timeout_ms,
				self.primary.text()
			);
		}
		result
	}

	/// Wait until any of `tokens` appears; returns the index of the first
	/// one (in `tokens` order) present.
	pub fn await_any(&mut self, tokens: &[&str], timeout_ms: u32) -> Result<usize, Error> {
		let mut found = None;
		let result = self.wait_for(Slot::Primary, timeout_ms, |buf, _| {
			found = tokens.iter().position(|t| buf.contains(t));
			found.is_some()
		});
		match (result, found) {
			(Ok(()), Some(idx)) => Ok(idx),
			(Ok(()), None) => Err(Error::Timeout),
			(Err(e), _) => {
				debug!(
					"None of {:?} within {} ms, got {:?}",
					tokens,
					timeout_ms,
					self.primary.text()
				);
				Err(e)
			}
		}
	}

	/// Wait until at least `count` complete lines are in the primary buffer.
	pub fn await_lines(&mut self, count: usize, timeout_ms: u32) -> Result<(), Error> {
		self.wait_for(Slot::Primary, timeout_ms, |buf, _| buf.line_count() >= count)
	}

	/// Like `await_lines`, but collects into the secondary buffer.
	pub fn await_lines_secondary(&mut self, count: usize, timeout_ms: u32) -> Result<(), Error> {
		self.secondary.clear();
		self.wait_for(Slot::Secondary, timeout_ms, |buf, _| buf.line_count() >= count)
	}

	/// Wait for a complete line starting with `prefix`, returning the rest
	/// of that line.
	pub fn await_line(&mut self, prefix: &str, timeout_ms: u32) -> Result<String, Error> {
		self.wait_for(Slot::Primary, timeout_ms, |buf, _| {
			tokenize::complete_line_after(&buf.text(), prefix).is_some()
		})?;
		let text = self.primary.text();
		tokenize::complete_line_after(&text, prefix)
			.map(String::from)
			.ok_or(Error::Malformed)
	}

	/// Keep polling until the raw capture holds at least `len` bytes, or the
	/// budget runs out. Asking for more than the capture can hold fails
	/// straight away with `Malformed`.
	pub fn await_capture(&mut self, len: usize, timeout_ms: u32) -> Result<(), Error> {
		if len > self.capture_capacity {
			warn!("Can't capture {} bytes, limit is {}", len, self.capture_capacity);
			return Err(Error::Malformed);
		}
		self.wait_for(Slot::Primary, timeout_ms, |_, capture| capture.len() >= len)
	}

	/// Keep polling until the raw capture ends with `marker`, such as the
	/// `\r\nOK\r\n` closing a binary reply. Fails with `Malformed` as soon
	/// as the capture fills up without it.
	pub fn await_capture_end(&mut self, marker: &[u8], timeout_ms: u32) -> Result<(), Error> {
		let limit = self.capture_capacity;
		self.wait_for(Slot::Primary, timeout_ms, |_, capture| {
			capture.ends_with(marker) || capture.len() >= limit
		})?;
		if self.capture.ends_with(marker) {
			Ok(())
		} else {
			warn!("Capture full at {} bytes before the end marker", limit);
			Err(Error::Malformed)
		}
	}

	/// Text collected in the primary buffer this exchange.
	pub fn text(&self) -> Cow<str> {
		self.primary.text()
	}

	pub fn secondary_text(&self) -> Cow<str> {
		self.secondary.text()
	}

	pub fn primary(&self) -> &LineBuffer {
		&self.primary
	}

	pub fn secondary(&self) -> &LineBuffer {
		&self.secondary
	}

	/// Every byte received this exchange, carriage returns and all.
	pub fn capture(&self) -> &[u8] {
		&self.capture
	}

	/// Remove a span from the raw capture, e.g. a URC that landed in the
	/// middle of a payload.
	pub fn excise_capture(&mut self, range: Range<usize>) {
		let end = cmp::min(range.end, self.capture.len());
		let start = cmp::min(range.start, end);
		self.capture.drain(start..end);
	}

	pub fn delay_ms(&mut self, ms: u32) {
		self.clock.delay_ms(ms);
	}

	pub fn now_ms(&self) -> u64 {
		self.clock.now_ms()
	}

	pub fn ring(&self) -> &RingBuffer {
		&self.ring
	}

	/// Bytes the capture had to discard because it was full.
	pub fn overruns(&self) -> usize {
		self.overruns
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl Transport {
	/// Move everything the port has for us through the ring buffer and into
	/// the capture and the chosen line buffer.
	fn drain(&mut self, slot: Slot) {
		loop {
			let ring = &mut self.ring;
			let accepted = self.port.receive(&mut |b| ring.put(b).is_ok());
			while let Ok(byte) = self.ring.get() {
				if self.capture.len() < self.capture_capacity {
					self.capture.push(byte);
				} else {
					self.overruns += 1;
				}
				match slot {
					Slot::Primary => self.primary.push(byte),
					Slot::Secondary => self.secondary.push(byte),
				}
			}
			if accepted == 0 {
				break;
			}
		}
	}

	fn buffer(&self, slot: Slot) -> &LineBuffer {
		match slot {
			Slot::Primary => &self.primary,
			Slot::Secondary => &self.secondary,
		}
	}

	/// The polling loop everything else is built on. `done` is checked after
	/// every drain; between checks we sleep one tick and charge it to the
	/// budget.
	fn wait_for<F>(&mut self, slot: Slot, timeout_ms: u32, mut done: F) -> Result<(), Error>
	where
		F: FnMut(&LineBuffer, &[u8]) -> bool,
	{
		let mut remaining = timeout_ms;
		loop {
			self.drain(slot);
			if done(self.buffer(slot), &self.capture) {
				trace!("Rx: {:?}", self.buffer(slot).text());
				return Ok(());
			}
			if remaining == 0 {
				return Err(Error::Timeout);
			}
			let step = cmp::min(self.tick_ms, remaining);
			self.clock.delay_ms(step);
			remaining -= step;
		}
	}
}

impl fmt::Debug for LineBuffer {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"LineBuffer {{ len: {}, capacity: {}, text: {:?} }}",
			self.data.len(),
			self.capacity,
			self.text()
		)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::mock::{MockClock, MockPort};

	fn transport() -> (Transport, MockPort, MockClock) {
		let clock = MockClock::new();
		let port = MockPort::with_clock(&clock);
		let t = Transport::new(
			Box::new(port.clone()),
			Box::new(clock.clone()),
			&Config::default(),
		);
		(t, port, clock)
	}

	#[test]
	fn line_buffer_strips_carriage_returns() {
		let mut buf = LineBuffer::new(16);
		for b in b"\r\nOK\r\n" {
			buf.push(*b);
		}
		assert_eq!(buf.as_bytes(), b"OK\n");
		assert_eq!(buf.line_count(), 1);
	}

	#[test]
	fn line_buffer_counts_overflow() {
		let mut buf = LineBuffer::new(2);
		for b in b"abcd" {
			buf.push(*b);
		}
		assert_eq!(buf.as_bytes(), b"ab");
		assert_eq!(buf.dropped(), 2);
		buf.clear();
		assert!(buf.is_empty());
		assert_eq!(buf.dropped(), 0);
	}

	#[test]
	fn token_found_in_reply() {
		let (mut t, port, _clock) = transport();
		port.expect("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
		t.send_command("AT+CPIN?").unwrap();
		assert!(t.await_token("+CPIN: READY", 3_000).is_ok());
		assert_eq!(port.commands(), vec!["AT+CPIN?".to_string()]);
		assert_eq!(port.written()[0], b"AT+CPIN?\r\n".to_vec());
	}

	#[test]
	fn missing_token_uses_whole_budget() {
		let (mut t, port, clock) = transport();
		port.expect("AT+CPIN?", "\r\nOK\r\n");
		t.send_command("AT+CPIN?").unwrap();
		let start = clock.now();
		assert_eq!(t.await_token("+CPIN: READY", 3_000), Err(Error::Timeout));
		assert_eq!(clock.now() - start, 3_000);
	}

	#[test]
	fn zero_budget_checks_once() {
		let (mut t, port, clock) = transport();
		port.inject(b"OK\r\n");
		let start = clock.now();
		assert!(t.await_token("OK", 0).is_ok());
		assert_eq!(t.await_token("ERROR", 0), Err(Error::Timeout));
		assert_eq!(clock.now(), start);
	}

	#[test]
	fn slow_reply_arrives_within_budget() {
		let (mut t, port, clock) = transport();
		port.expect_delayed("AT", "\r\nOK\r\n", 400);
		port.set_max_burst(1);
		t.send_command("AT").unwrap();
		assert!(t.await_token("OK", 500).is_ok());
		assert!(clock.now() >= 400);
		assert!(clock.now() < 500);
	}

	#[test]
	fn send_command_discards_stale_bytes() {
		let (mut t, port, _clock) = transport();
		port.inject(b"\r\nOK\r\n");
		t.await_lines(1, 0).unwrap();
		port.expect("AT+CSQ", "\r\n+CSQ: 20,0\r\n");
		t.send_command("AT+CSQ").unwrap();
		t.await_lines(1, 100).unwrap();
		assert_eq!(t.text(), "+CSQ: 20,0\n");
		assert!(!t.primary().contains("OK"));
	}

	#[test]
	fn late_reply_does_not_answer_next_command() {
		let (mut t, port, clock) = transport();
		port.expect_delayed("AT+QIDEACT", "\r\nOK\r\n", 600);
		t.send_command("AT+QIDEACT").unwrap();
		assert_eq!(t.await_token("OK", 500), Err(Error::Timeout));
		clock.advance(200);
		t.send_command("AT+CSQ").unwrap();
		assert_eq!(t.await_token("OK", 1_000), Err(Error::Timeout));
		assert!(t.text().is_empty());
		assert_eq!(port.pending(), 0);
	}

	#[test]
	fn any_reports_first_listed_token() {
		let (mut t, port, _clock) = transport();
		port.expect("AT+QIOPEN", "\r\nOK\r\n\r\nCONNECT FAIL\r\n");
		t.send_command("AT+QIOPEN").unwrap();
		let idx = t
			.await_any(&["CONNECT OK", "ALREADY CONNECT", "CONNECT FAIL"], 1_000)
			.unwrap();
		assert_eq!(idx, 2);
	}

	#[test]
	fn line_waits_for_terminator() {
		let (mut t, port, _clock) = transport();
		port.inject(b"\r\n+QFOPEN: 12");
		assert_eq!(t.await_line("+QFOPEN: ", 100), Err(Error::Timeout));
		port.inject(b"34\r\n");
		assert_eq!(t.await_line("+QFOPEN: ", 100), Ok("1234".to_string()));
	}

	#[test]
	fn secondary_leaves_primary_alone() {
		let (mut t, port, _clock) = transport();
		port.expect("AT+QSSLRECV=0,1,4", "\r\n+QSSLRECV: 0,4\r\nabcd\r\nOK\r\n");
		t.send_command("AT+QSSLRECV=0,1,4").unwrap();
		t.await_token("OK", 100).unwrap();
		let before = t.text().into_owned();
		port.inject(b"\r\n+QSSLURC: \"recv\",0\r\n");
		t.await_lines_secondary(1, 100).unwrap();
		assert_eq!(t.text(), before.as_str());
		assert!(t.secondary().contains("+QSSLURC"));
		assert!(!t.primary().contains("+QSSLURC"));
	}

	#[test]
	fn capture_keeps_raw_bytes() {
		let (mut t, port, _clock) = transport();
		port.inject(b"\r\nCONNECT\r\nab\r\ncd\r\nOK\r\n");
		t.await_capture(10, 100).unwrap();
		assert!(t.capture().starts_with(b"\r\nCONNECT\r\n"));
		t.await_token("OK", 100).unwrap();
		t.excise_capture(0..11);
		assert_eq!(t.capture(), b"ab\r\ncd\r\nOK\r\n");
		t.excise_capture(100..200);
		assert_eq!(t.capture().len(), 12);
	}

	#[test]
	fn capture_end_ignores_text_inside_payload() {
		let (mut t, port, _clock) = transport();
		port.inject(b"\r\nCONNECT\r\nOK then\r\n");
		assert_eq!(t.await_capture_end(b"\r\nOK\r\n", 100), Err(Error::Timeout));
		port.inject(b"\r\nOK\r\n");
		assert!(t.await_capture_end(b"\r\nOK\r\n", 100).is_ok());
	}

	#[test]
	fn capture_too_small_fails_fast() {
		let clock = MockClock::new();
		let port = MockPort::with_clock(&clock);
		let mut config = Config::default();
		config.capture_capacity = 16;
		let mut t = Transport::new(Box::new(port.clone()), Box::new(clock.clone()), &config);
		assert_eq!(t.await_capture(17, 5_000), Err(Error::Malformed));
		port.inject(b"\r\nCONNECT\r\n0123456789abcdef\r\nOK\r\n");
		assert_eq!(t.await_capture_end(b"\r\nOK\r\n", 5_000), Err(Error::Malformed));
		assert_eq!(clock.now(), 0);
		assert!(t.overruns() > 0);
	}

	#[test]
	fn small_ring_still_delivers_everything() {
		let clock = MockClock::new();
		let port = MockPort::with_clock(&clock);
		let mut config = Config::default();
		config.rx_capacity = 3;
		let mut t = Transport::new(Box::new(port.clone()), Box::new(clock), &config);
		port.inject(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
		t.await_token("OK", 100).unwrap();
		assert_eq!(t.text(), "+CREG: 0,1\n\nOK\n");
		assert_eq!(t.ring().available(), 0);
	}

	#[test]
	fn write_failure_is_reported() {
		let (mut t, port, _clock) = transport();
		port.fail_writes(true);
		assert_eq!(
			t.send_command("AT"),
			Err(Error::IOError(::std::io::ErrorKind::BrokenPipe))
		);
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
