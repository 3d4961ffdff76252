//! # cellmodem - Drive a GSM/GPRS module over its AT command port
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! The module is on the end of a serial line and speaks the Hayes AT dialect
//! with the Quectel extensions for sockets, HTTP and the on-module file
//! system. This crate turns the received byte stream into bounded
//! command/response exchanges (`transport`), classifies their outcomes
//! (`Modem::send_expect_ok` and friends) and runs the power-up and network
//! registration sequence (`Modem::initialize`).
//!
//! Sockets live in `cellmodem-net` and HTTP/file transfer in
//! `cellmodem-http`; both are built on the `Modem` defined here.
//!
//! Everything is single threaded and cooperative. A wait sleeps one tick,
//! looks at what has arrived, and gives up when its budget is spent. There
//! are no retries except the explicit polling loops described on each
//! operation.

#[macro_use]
extern crate log;

// ****************************************************************************
//
// Sub-modules
//
// ****************************************************************************

pub mod config;
pub mod hal;
pub mod lifecycle;
pub mod mock;
pub mod ring;
pub mod tokenize;
pub mod transport;

#[cfg(unix)]
pub mod host;

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::fmt;
use std::io;

pub use crate::config::Config;
use crate::hal::{Clock, PowerControl, SerialPort, Watchdog};
use crate::transport::Transport;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Why an exchange with the module failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
	/// What we were waiting for didn't arrive within the budget
	Timeout,
	/// The module answered `ERROR`, or `+CME ERROR: <n>` (with the code)
	Protocol(Option<i32>),
	/// The serial port failed
	IOError(io::ErrorKind),
	/// A reply arrived but couldn't be picked apart
	Malformed,
}

/// The outcome of bringing the module up, as reported by `Modem::status`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModemErrorCode {
	NoError,
	/// Nothing answered `AT` after power-up
	NoModule,
	/// `AT+CPIN?` didn't report `READY`
	NoSIMCard,
	/// Never registered on the GSM network
	NotRegisteredGSM,
	/// Never attached to GPRS
	NotRegisteredGPRS,
	/// `AT+GMM` reported a different model from the one configured
	ModelMismatch,
	Unknown,
}

/// How an HTTP style request went.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
	Failed,
	NoResponseReceived,
	Successful,
}

/// Which TLS versions a secure socket may negotiate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlsMode {
	/// Plain TCP
	None,
	Ssl3,
	Tls10,
	Tls11,
	Tls12,
	/// Whatever the far end supports
	All,
}

/// The `<stat>` field of `+CREG` / `+CGREG`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetworkRegistrationState {
	NotRegistered,
	Registered,
	Searching,
	Denied,
	Unknown,
	Roaming,
}

/// Where the driver has got to in bringing the module up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleState {
	PoweredOff,
	PoweringOn,
	AwaitingATEcho,
	Configuring,
	AwaitingSimReady,
	AwaitingRegistration(NetworkRegistrationState),
	Ready,
	Failed(ModemErrorCode),
}

/// One physical module, and everything needed to talk to it.
pub struct Modem {
	transport: Transport,
	pins: Box<dyn PowerControl>,
	watchdog: Option<Watchdog>,
	config: Config,
	tls_mode: TlsMode,
	last_error: Option<i32>,
	state: LifecycleState,
	status: ModemErrorCode,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const CME_ERROR: &str = "+CME ERROR: ";

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Modem {
	/// Take ownership of the port, clock and power lines. Nothing is sent
	/// until `initialize` or `power_on` is called.
	pub fn new(
		port: Box<dyn SerialPort>,
		clock: Box<dyn Clock>,
		pins: Box<dyn PowerControl>,
		config: Config,
	) -> Modem {
		Modem {
			transport: Transport::new(port, clock, &config),
			pins,
			watchdog: None,
			config,
			tls_mode: TlsMode::None,
			last_error: None,
			state: LifecycleState::PoweredOff,
			status: ModemErrorCode::NoError,
		}
	}

	/// Register a callback to be poked from inside long polling loops.
	pub fn set_watchdog(&mut self, watchdog: Watchdog) {
		self.watchdog = Some(watchdog);
	}

	pub fn poke_watchdog(&mut self) {
		if let Some(ref mut watchdog) = self.watchdog {
			watchdog();
		}
	}

	/// Send `cmd` and wait for `token` to appear in the reply.
	pub fn send_and_check(&mut self, cmd: &str, token: &str, timeout_ms: u32) -> Result<(), Error> {
		self.transport.send_command(cmd)?;
		self.transport.await_token(token, timeout_ms)
	}

	/// Send `cmd`, wait for `lines` complete lines, and return the reply
	/// text.
	pub fn send_and_collect(
		&mut self,
		cmd: &str,
		timeout_ms: u32,
		lines: usize,
	) -> Result<String, Error> {
		self.transport.send_command(cmd)?;
		self.transport.await_lines(lines, timeout_ms)?;
		Ok(self.transport.text().into_owned())
	}

	/// Send `cmd`, wait for its final result code and classify it.
	pub fn send_expect_ok(&mut self, cmd: &str, timeout_ms: u32) -> Result<(), Error> {
		self.transport.send_command(cmd)?;
		self.transport.await_any(&["OK", "ERROR"], timeout_ms)?;
		self.classify_result()
	}

	/// Decide whether the reply collected so far is a success. A CME error
	/// code is remembered and can be read back with `last_error`.
	pub fn classify_result(&mut self) -> Result<(), Error> {
		let text = self.transport.text();
		if text.contains("OK") {
			self.last_error = None;
			Ok(())
		} else if let Some(rest) = tokenize::line_after(&text, CME_ERROR) {
			let code = tokenize::leading_int(rest).map(|n| n as i32);
			warn!("Module reported CME error {:?} ({})", code, rest);
			if code.is_some() {
				self.last_error = code;
			}
			Err(Error::Protocol(code))
		} else {
			warn!("Unexpected reply {:?}", text);
			Err(Error::Protocol(None))
		}
	}

	/// The last `+CME ERROR` code seen, cleared by the next `OK`.
	pub fn last_error(&self) -> Option<i32> {
		self.last_error
	}

	pub fn tls_mode(&self) -> TlsMode {
		self.tls_mode
	}

	pub fn set_tls_mode(&mut self, mode: TlsMode) {
		self.tls_mode = mode;
	}

	pub fn state(&self) -> LifecycleState {
		self.state
	}

	/// The result of the last bring-up attempt.
	pub fn status(&self) -> ModemErrorCode {
		self.status
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn transport(&self) -> &Transport {
		&self.transport
	}

	/// Direct access to the exchange primitives, for the socket and HTTP
	/// layers.
	pub fn transport_mut(&mut self) -> &mut Transport {
		&mut self.transport
	}

	pub fn delay_ms(&mut self, ms: u32) {
		self.transport.delay_ms(ms);
	}

	pub fn now_ms(&self) -> u64 {
		self.transport.now_ms()
	}
}

impl TlsMode {
	/// The module's `sslversion` code, or `None` for plain TCP.
	pub fn code(self) -> Option<u8> {
		match self {
			TlsMode::None => None,
			TlsMode::Ssl3 => Some(0),
			TlsMode::Tls10 => Some(1),
			TlsMode::Tls11 => Some(2),
			TlsMode::Tls12 => Some(3),
			TlsMode::All => Some(4),
		}
	}

	pub fn is_encrypted(self) -> bool {
		self != TlsMode::None
	}
}

impl NetworkRegistrationState {
	pub fn from_digit(digit: i64) -> NetworkRegistrationState {
		match digit {
			0 => NetworkRegistrationState::NotRegistered,
			1 => NetworkRegistrationState::Registered,
			2 => NetworkRegistrationState::Searching,
			3 => NetworkRegistrationState::Denied,
			5 => NetworkRegistrationState::Roaming,
			_ => NetworkRegistrationState::Unknown,
		}
	}

	/// Pull `<stat>` out of a `+CREG: <n>,<stat>` style reply. The
	/// unsolicited form `+CREG: <stat>` is accepted too. Anything else is
	/// `Unknown`.
	pub fn decode(text: &str, prefix: &str) -> NetworkRegistrationState {
		let stat = tokenize::tagged(text, prefix).and_then(|f| match f.len() {
			1 => f.int(0),
			_ => f.int(1),
		});
		match stat {
			Some(digit) => NetworkRegistrationState::from_digit(digit),
			None => NetworkRegistrationState::Unknown,
		}
	}

	/// Home network or roaming.
	pub fn is_registered(self) -> bool {
		self == NetworkRegistrationState::Registered || self == NetworkRegistrationState::Roaming
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl Modem {
	fn set_state(&mut self, state: LifecycleState) {
		if state != self.state {
			info!("Modem {:?} -> {:?}", self.state, state);
			self.state = state;
		}
	}

	fn fail(&mut self, code: ModemErrorCode) -> ModemErrorCode {
		warn!("Modem bring-up failed: {:?}", code);
		self.set_state(LifecycleState::Failed(code));
		self.status = code;
		code
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Error::Timeout => write!(f, "timed out waiting for the module"),
			Error::Protocol(Some(code)) => write!(f, "module reported CME error {}", code),
			Error::Protocol(None) => write!(f, "module reported an error"),
			Error::IOError(kind) => write!(f, "serial port error: {:?}", kind),
			Error::Malformed => write!(f, "malformed reply"),
		}
	}
}

/// Wrap io::Errors into Errors easily
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::IOError(e.kind())
	}
}

impl fmt::Debug for Modem {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"Modem {{ state: {:?}, status: {:?}, tls: {:?}, last_error: {:?} }}",
			self.state, self.status, self.tls_mode, self.last_error
		)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::mock::{MockClock, MockPins, MockPort};

	fn modem() -> (Modem, MockPort, MockClock) {
		let clock = MockClock::new();
		let port = MockPort::with_clock(&clock);
		let pins = MockPins::new(&clock);
		let m = Modem::new(
			Box::new(port.clone()),
			Box::new(clock.clone()),
			Box::new(pins),
			Config::default(),
		);
		(m, port, clock)
	}

	#[test]
	fn cme_error_code_is_kept() {
		let (mut m, port, _) = modem();
		port.expect("AT+QIREGAPP", "\r\n+CME ERROR: 23\r\n");
		assert_eq!(m.send_expect_ok("AT+QIREGAPP", 3_000), Err(Error::Protocol(Some(23))));
		assert_eq!(m.last_error(), Some(23));
	}

	#[test]
	fn ok_clears_last_error() {
		let (mut m, port, _) = modem();
		port.expect("AT+QIACT", "\r\n+CME ERROR: 23\r\n");
		port.expect("AT+QIACT", "\r\nOK\r\n");
		assert!(m.send_expect_ok("AT+QIACT", 1_000).is_err());
		assert_eq!(m.last_error(), Some(23));
		assert_eq!(m.send_expect_ok("AT+QIACT", 1_000), Ok(()));
		assert_eq!(m.last_error(), None);
	}

	#[test]
	fn plain_error_has_no_code() {
		let (mut m, port, _) = modem();
		port.expect("AT+QIDEACT", "\r\nERROR\r\n");
		assert_eq!(m.send_expect_ok("AT+QIDEACT", 1_000), Err(Error::Protocol(None)));
		assert_eq!(m.last_error(), None);
	}

	#[test]
	fn silence_is_a_timeout() {
		let (mut m, _port, clock) = modem();
		assert_eq!(m.send_expect_ok("ATE0", 1_000), Err(Error::Timeout));
		// settle delay plus the whole budget
		assert_eq!(clock.now(), 1_010);
	}

	#[test]
	fn collect_returns_stripped_lines() {
		let (mut m, port, _) = modem();
		port.expect("AT+CREG?", "\r\n+CREG: 0,5\r\n\r\nOK\r\n");
		let text = m.send_and_collect("AT+CREG?", 1_000, 3).unwrap();
		assert_eq!(text, "+CREG: 0,5\n\nOK\n");
	}

	#[test]
	fn registration_decoding() {
		use crate::NetworkRegistrationState as S;
		assert_eq!(S::decode("+CREG: 0,1\n\nOK\n", "+CREG: "), S::Registered);
		assert_eq!(S::decode("+CREG: 0,2\n\nOK\n", "+CREG: "), S::Searching);
		assert_eq!(S::decode("+CREG: 0,5\n", "+CREG: "), S::Roaming);
		assert_eq!(S::decode("+CREG: 3\n", "+CREG: "), S::Denied);
		assert_eq!(S::decode("+CGREG: 0,0\n", "+CGREG: "), S::NotRegistered);
		assert_eq!(S::decode("+CREG: 0,1\n", "+CGREG: "), S::Unknown);
		assert_eq!(S::decode("garbage", "+CREG: "), S::Unknown);
		assert_eq!(S::decode("+CREG: x,y\n", "+CREG: "), S::Unknown);
		assert!(S::Roaming.is_registered());
		assert!(!S::Searching.is_registered());
	}

	#[test]
	fn tls_codes() {
		assert_eq!(TlsMode::None.code(), None);
		assert_eq!(TlsMode::Ssl3.code(), Some(0));
		assert_eq!(TlsMode::Tls12.code(), Some(3));
		assert_eq!(TlsMode::All.code(), Some(4));
		assert!(!TlsMode::None.is_encrypted());
	}

	#[test]
	fn io_errors_convert() {
		let e: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
		assert_eq!(e, Error::IOError(io::ErrorKind::TimedOut));
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
