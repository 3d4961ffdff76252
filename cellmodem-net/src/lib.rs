//! # cellmodem-net - GPRS bearer, TLS and sockets on the module
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! The module runs its own TCP/IP stack. This crate drives it: bring the
//! GPRS bearer up with `connect_gprs`, optionally configure TLS with
//! `set_encryption`, then open a `Socket` to a host and exchange bytes with
//! it. Only one socket (connection index 0) is used at a time.
//!
//! A socket borrows the `Modem` mutably for as long as it's alive, so
//! nothing else can talk to the module in the middle of a socket exchange.

#[macro_use]
extern crate log;

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::cmp;
use std::fmt;

use cellmodem::tokenize;
use cellmodem::{Modem, TlsMode};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Everything that can go wrong on the network side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
	/// The exchange with the module itself failed
	Modem(cellmodem::Error),
	/// The PDP context didn't come up
	ActivationFailed,
	/// The far end couldn't be reached. Carries the module's error code
	/// where it gave one.
	OpenFailed(Option<i32>),
	/// The socket isn't (or is no longer) connected
	NotConnected,
	/// A reply arrived but couldn't be picked apart
	Malformed,
}

/// The module's IP stack state, from `AT+QISTAT`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpSessionState {
	Initial,
	Start,
	Config,
	Ind,
	GprsActive,
	Status,
	Unknown,
}

/// Access point settings for the data bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apn {
	pub name: String,
	pub user: String,
	pub password: String,
	/// How long `AT+QIACT` may take, in seconds
	pub activation_timeout_s: u32,
}

/// An open connection through the module.
pub struct Socket<'m> {
	modem: &'m mut Modem,
	mode: TlsMode,
	open: bool,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// TLS context used for secure sockets and HTTPS.
pub const SSL_CONTEXT: u8 = 1;

/// Largest payload the module accepts in one send.
pub const MAX_SEND_LEN: usize = 1460;

/// Largest payload we ask the module for in one read.
pub const MAX_READ_LEN: usize = 1500;

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const STANDARD_TIMEOUT_MS: u32 = 3_000;
const DEACT_TIMEOUT_MS: u32 = 90_000;
const OPEN_TIMEOUT_MS: u32 = 30_000;
const PROMPT_TIMEOUT_MS: u32 = 5_000;
const SEND_TIMEOUT_MS: u32 = 5_000;
const READ_TIMEOUT_MS: u32 = 5_000;
const CLOSE_POLL_MS: u32 = 500;
const CLOSE_BUDGET_MS: u32 = 20_000;
const GPRSACT_POLLS: usize = 5;
/// The numeric state `AT+QISTATE` / `AT+QSSLSTATE` report for a live
/// connection
const STATE_CONNECTED: i64 = 2;
/// Field of the state line carrying that number
const STATE_FIELD: usize = 5;
/// Where a data-ready URC can land in the middle of an SSL read
const SSL_URC: &[u8] = b"+QSSLURC: \"recv\"";
/// How far into the payload the URC may start (it may bring its own CRLF)
const SSL_URC_WINDOW: usize = 2;

/// `AT+QISTAT` phrases, matched at the very start of the reply text.
const IP_STATES: [(&str, IpSessionState); 6] = [
	("IP INITIAL", IpSessionState::Initial),
	("IP START", IpSessionState::Start),
	("IP CONFIG", IpSessionState::Config),
	("IP IND", IpSessionState::Ind),
	("IP GPRSACT", IpSessionState::GprsActive),
	("IP STATUS", IpSessionState::Status),
];

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Apn {
	pub fn new(name: &str) -> Apn {
		Apn {
			name: name.to_string(),
			user: String::new(),
			password: String::new(),
			activation_timeout_s: 150,
		}
	}

	pub fn with_credentials(mut self, user: &str, password: &str) -> Apn {
		self.user = user.to_string();
		self.password = password.to_string();
		self
	}
}

/// Configure the PDP context and bring the GPRS bearer up.
pub fn connect_gprs(modem: &mut Modem, apn: &Apn) -> Result<(), Error> {
	let ctx = modem.config().context_id;
	info!("Activating context {} on {:?}", ctx, apn.name);
	modem.send_expect_ok(&format!("AT+QIFGCNT={}", ctx), STANDARD_TIMEOUT_MS)?;
	modem.send_expect_ok(
		&format!(
			"AT+QICSGP=1,\"{}\",\"{}\",\"{}\"",
			apn.name, apn.user, apn.password
		),
		STANDARD_TIMEOUT_MS,
	)?;
	modem.send_expect_ok("AT+QIREGAPP", STANDARD_TIMEOUT_MS)?;
	let act_ms = apn.activation_timeout_s.saturating_mul(1_000);
	if let Err(e) = modem.send_expect_ok("AT+QIACT", act_ms) {
		warn!("AT+QIACT failed: {}", e);
		return Err(Error::ActivationFailed);
	}
	for poll in 1..=GPRSACT_POLLS {
		if modem
			.send_and_check("AT+QISTAT", "IP GPRSACT", STANDARD_TIMEOUT_MS)
			.is_ok()
		{
			info!("GPRS active after {} poll(s)", poll);
			return Ok(());
		}
		modem.poke_watchdog();
	}
	warn!("Context never reached IP GPRSACT");
	Err(Error::ActivationFailed)
}

/// Take the GPRS bearer down.
pub fn disconnect_gprs(modem: &mut Modem) -> Result<(), Error> {
	modem.transport_mut().send_command("AT+QIDEACT")?;
	match modem
		.transport_mut()
		.await_any(&["DEACT OK", "ERROR"], DEACT_TIMEOUT_MS)?
	{
		0 => {
			info!("GPRS deactivated");
			Ok(())
		}
		_ => Err(modem.classify_result().err().unwrap_or(cellmodem::Error::Malformed).into()),
	}
}

/// Ask the module where its IP stack is.
pub fn ip_state(modem: &mut Modem) -> Result<IpSessionState, Error> {
	modem.transport_mut().send_command("AT+QISTAT")?;
	modem
		.transport_mut()
		.await_line("STATE: ", STANDARD_TIMEOUT_MS)?;
	let text = modem.transport().text();
	Ok(IpSessionState::decode(&text))
}

/// Choose plain TCP or TLS for the sockets opened after this.
pub fn set_encryption(modem: &mut Modem, mode: TlsMode) {
	debug!("Encryption -> {:?}", mode);
	modem.set_tls_mode(mode);
}

/// Configure TLS context `ctx` to negotiate `mode` with any cipher suite
/// and no certificate checks. Does nothing for `TlsMode::None`.
pub fn activate_ssl(modem: &mut Modem, ctx: u8, mode: TlsMode) -> Result<(), Error> {
	let version = match mode.code() {
		Some(version) => version,
		None => return Ok(()),
	};
	modem.send_expect_ok(
		&format!("AT+QSSLCFG=\"sslversion\",{},{}", ctx, version),
		STANDARD_TIMEOUT_MS,
	)?;
	modem.send_expect_ok(
		&format!("AT+QSSLCFG=\"ciphersuite\",{},\"0XFFFF\"", ctx),
		STANDARD_TIMEOUT_MS,
	)?;
	modem.send_expect_ok(
		&format!("AT+QSSLCFG=\"seclevel\",{},0", ctx),
		STANDARD_TIMEOUT_MS,
	)?;
	Ok(())
}

impl IpSessionState {
	/// Match the reply against the known phrases. Only a phrase at offset
	/// zero counts, so a reply starting `STATE: ` decodes as `Unknown`.
	pub fn decode(reply: &str) -> IpSessionState {
		IP_STATES
			.iter()
			.find(|(phrase, _)| reply.starts_with(phrase))
			.map(|(_, state)| *state)
			.unwrap_or(IpSessionState::Unknown)
	}
}

impl<'m> Socket<'m> {
	/// Open a connection to `host:port`, using TLS if the modem's mode (see
	/// `set_encryption`) asks for it.
	pub fn connect_to(modem: &'m mut Modem, host: &str, port: u16) -> Result<Socket<'m>, Error> {
		let mode = modem.tls_mode();
		let mut socket = Socket {
			modem,
			mode,
			open: false,
		};
		socket.open(host, port)?;
		Ok(socket)
	}

	/// Open a TLS connection to `host:port` with the given mode.
	pub fn connect_secure(
		modem: &'m mut Modem,
		host: &str,
		port: u16,
		mode: TlsMode,
	) -> Result<Socket<'m>, Error> {
		set_encryption(modem, mode);
		Socket::connect_to(modem, host, port)
	}

	pub fn is_secure(&self) -> bool {
		self.mode.is_encrypted()
	}

	/// Send up to `MAX_SEND_LEN` bytes of `data`, returning how many went.
	pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
		if !self.open {
			return Err(Error::NotConnected);
		}
		if data.is_empty() {
			return Ok(0);
		}
		let data = &data[..cmp::min(data.len(), MAX_SEND_LEN)];
		let cmd = if self.is_secure() {
			format!("AT+QSSLSEND=0,{}", data.len())
		} else {
			format!("AT+QISEND={}", data.len())
		};
		self.modem.send_and_check(&cmd, "> ", PROMPT_TIMEOUT_MS)?;
		let transport = self.modem.transport_mut();
		transport.send_raw(data)?;
		match transport.await_any(&["SEND OK", "SEND FAIL", "ERROR"], SEND_TIMEOUT_MS)? {
			0 => {
				debug!("Sent {} bytes", data.len());
				Ok(data.len())
			}
			1 => Err(Error::NotConnected),
			_ => Err(Error::Modem(cellmodem::Error::Protocol(None))),
		}
	}

	/// Send all of `data`, in as many pieces as it takes.
	pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), Error> {
		while !data.is_empty() {
			let sent = self.write(data)?;
			data = &data[sent..];
		}
		Ok(())
	}

	/// Fetch whatever the module has buffered for us, up to `buf.len()`
	/// bytes. Returns 0 when nothing is waiting.
	pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
		if !self.open {
			return Err(Error::NotConnected);
		}
		let want = cmp::min(buf.len(), MAX_READ_LEN);
		if want == 0 {
			return Ok(0);
		}
		let (cmd, tag) = if self.is_secure() {
			(format!("AT+QSSLRECV=0,{}", want), "+QSSLRECV: ")
		} else {
			(format!("AT+QIRD=0,1,0,{}", want), "+QIRD: ")
		};
		let transport = self.modem.transport_mut();
		transport.send_command(&cmd)?;
		match transport.await_any(&[tag, "OK", "ERROR"], READ_TIMEOUT_MS)? {
			0 => {}
			1 => return Ok(0),
			_ => {
				return Err(self
					.modem
					.classify_result()
					.err()
					.unwrap_or(cellmodem::Error::Malformed)
					.into())
			}
		}
		let header = transport.await_line(tag, READ_TIMEOUT_MS)?;
		let len = tokenize::fields(&header)
			.last()
			.and_then(|f| f.parse::<usize>().ok())
			.ok_or(Error::Malformed)?;
		let len = cmp::min(len, want);
		if len == 0 {
			return Ok(0);
		}
		let start = payload_start(transport.capture(), tag).ok_or(Error::Malformed)?;
		transport.await_capture(start + len, READ_TIMEOUT_MS)?;
		if self.mode.is_encrypted() {
			self.splice_out_urc(start, len)?;
		}
		let capture = self.modem.transport().capture();
		buf[..len].copy_from_slice(&capture[start..start + len]);
		debug!("Read {} bytes", len);
		Ok(len)
	}

	/// Close the connection and wait for the module to agree it's closed.
	pub fn close(&mut self) -> Result<(), Error> {
		let cmd = if self.is_secure() {
			"AT+QSSLCLOSE=0"
		} else {
			"AT+QICLOSE"
		};
		if let Err(e) = self.modem.send_expect_ok(cmd, STANDARD_TIMEOUT_MS) {
			debug!("{} failed ({}), checking state anyway", cmd, e);
		}
		self.open = false;
		let start = self.modem.now_ms();
		loop {
			match self.connected() {
				Ok(false) => {
					info!("Socket closed");
					return Ok(());
				}
				Ok(true) => trace!("Still connected"),
				Err(e) => debug!("State query failed: {}", e),
			}
			if self.modem.now_ms() - start >= u64::from(CLOSE_BUDGET_MS) {
				warn!("Socket still connected after {} ms", CLOSE_BUDGET_MS);
				return Err(Error::Modem(cellmodem::Error::Timeout));
			}
			self.modem.poke_watchdog();
			self.modem.delay_ms(CLOSE_POLL_MS);
		}
	}

	/// Ask the module whether the connection is up.
	pub fn connected(&mut self) -> Result<bool, Error> {
		let (cmd, tag) = if self.is_secure() {
			("AT+QSSLSTATE=0", "+QSSLSTATE: ")
		} else {
			("AT+QISTATE=1,0", "+QISTATE: ")
		};
		self.modem.send_expect_ok(cmd, STANDARD_TIMEOUT_MS)?;
		let text = self.modem.transport().text();
		let state = tokenize::tagged(&text, tag).and_then(|f| f.int(STATE_FIELD));
		Ok(state == Some(STATE_CONNECTED))
	}

	/// The modem the socket is using, for anything not covered here.
	pub fn modem(&mut self) -> &mut Modem {
		self.modem
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl<'m> Socket<'m> {
	fn open(&mut self, host: &str, port: u16) -> Result<(), Error> {
		info!("Opening {:?} connection to {}:{}", self.mode, host, port);
		if self.is_secure() {
			activate_ssl(self.modem, SSL_CONTEXT, self.mode)?;
		}
		self.modem.send_expect_ok("AT+QIURC=0", STANDARD_TIMEOUT_MS)?;
		if self.is_secure() {
			self.open_secure(host, port)?;
		} else {
			self.open_plain(host, port)?;
		}
		self.open = true;
		Ok(())
	}

	fn open_plain(&mut self, host: &str, port: u16) -> Result<(), Error> {
		let cmd = format!("AT+QIOPEN=\"TCP\",\"{}\",{}", host, port);
		let transport = self.modem.transport_mut();
		transport.send_command(&cmd)?;
		let outcome = transport.await_any(
			&["CONNECT OK", "ALREADY CONNECT", "CONNECT FAIL", "ERROR"],
			OPEN_TIMEOUT_MS,
		)?;
		match outcome {
			0 | 1 => Ok(()),
			2 => {
				warn!("Connection to {}:{} failed", host, port);
				Err(Error::OpenFailed(None))
			}
			_ => {
				let _ = self.modem.classify_result();
				Err(Error::OpenFailed(self.modem.last_error()))
			}
		}
	}

	fn open_secure(&mut self, host: &str, port: u16) -> Result<(), Error> {
		let cmd = format!("AT+QSSLOPEN=0,{},\"{}\",{},0", SSL_CONTEXT, host, port);
		let transport = self.modem.transport_mut();
		transport.send_command(&cmd)?;
		if transport.await_any(&["+QSSLOPEN: ", "ERROR"], OPEN_TIMEOUT_MS)? != 0 {
			let _ = self.modem.classify_result();
			return Err(Error::OpenFailed(self.modem.last_error()));
		}
		let line = transport.await_line("+QSSLOPEN: ", OPEN_TIMEOUT_MS)?;
		let fields = tokenize::fields(&line);
		match fields.int(1) {
			Some(0) => Ok(()),
			Some(err) => {
				warn!("TLS connection to {}:{} failed with {}", host, port, err);
				Err(Error::OpenFailed(Some(err as i32)))
			}
			None => Err(Error::Malformed),
		}
	}

	/// A `+QSSLURC: "recv"` can arrive between the length header and the
	/// payload. Cut it out of the capture and read on so the payload is
	/// complete again.
	fn splice_out_urc(&mut self, start: usize, len: usize) -> Result<(), Error> {
		let transport = self.modem.transport_mut();
		let found = {
			let capture = transport.capture();
			let window_end = cmp::min(start + SSL_URC_WINDOW + SSL_URC.len(), capture.len());
			capture[start..window_end]
				.windows(SSL_URC.len())
				.position(|w| w == SSL_URC)
				.map(|offset| {
					let urc_start = start + offset;
					let urc_end = find(&capture[urc_start..], b"\r\n")
						.map(|idx| urc_start + idx + 2)
						.unwrap_or_else(|| capture.len());
					// Take a CRLF that came in front of the URC too
					let cut_from = if urc_start >= start + 2
						&& &capture[urc_start - 2..urc_start] == b"\r\n"
					{
						urc_start - 2
					} else {
						urc_start
					};
					cut_from..urc_end
				})
		};
		if let Some(range) = found {
			debug!("Removing data-ready URC spliced into the payload");
			transport.excise_capture(range);
			if transport.await_lines_secondary(2, STANDARD_TIMEOUT_MS).is_err() {
				trace!("Nothing more after the URC: {:?}", transport.secondary_text());
			}
			transport.await_capture(start + len, READ_TIMEOUT_MS)?;
		}
		Ok(())
	}
}

/// Where the payload begins: just after the CRLF ending the `tag` line.
fn payload_start(capture: &[u8], tag: &str) -> Option<usize> {
	let header = find(capture, tag.as_bytes())?;
	find(&capture[header..], b"\r\n").map(|idx| header + idx + 2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack.windows(needle.len()).position(|w| w == needle)
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Error::Modem(ref e) => write!(f, "{}", e),
			Error::ActivationFailed => write!(f, "PDP context activation failed"),
			Error::OpenFailed(Some(code)) => write!(f, "connection failed with code {}", code),
			Error::OpenFailed(None) => write!(f, "connection failed"),
			Error::NotConnected => write!(f, "not connected"),
			Error::Malformed => write!(f, "malformed reply"),
		}
	}
}

/// Wrap modem errors into Errors easily
impl From<cellmodem::Error> for Error {
	fn from(e: cellmodem::Error) -> Error {
		Error::Modem(e)
	}
}

impl<'m> fmt::Debug for Socket<'m> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Socket {{ mode: {:?}, open: {} }}", self.mode, self.open)
	}
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
