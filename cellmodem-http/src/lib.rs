//! # cellmodem-http - HTTP through the module's own client
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! The module can run HTTP(S) requests itself: we give it a URL (and
//! optionally a complete request header block), tell it to GET or POST, and
//! then either read the response body back over the serial line or have it
//! stored in a file on the module (see `file`).
//!
//! Large downloads go through a file in module RAM one chunk at a time,
//! using `Range` requests, so the body never has to fit in our reply
//! buffers.

#[macro_use]
extern crate log;

// ****************************************************************************
//
// Sub-modules
//
// ****************************************************************************

pub mod file;

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use cellmodem::tokenize;
use cellmodem::{Modem, RequestOutcome, TlsMode};

use crate::file::{FileStore, MAX_READ_LEN};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// What to fetch, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
	pub url: String,
	pub tls: TlsMode,
	/// A complete request header block, sent instead of the module's own
	pub headers: Option<String>,
	/// PDP context the request goes out on
	pub context_id: u8,
}

/// What came back from a GET.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HttpResponse {
	pub outcome: RequestOutcome,
	/// The module's error code from `+QHTTPGET`, 0 on success
	pub error: Option<i32>,
	/// The HTTP status code
	pub status: Option<u16>,
	/// Content length, when the server gave one
	pub length: Option<usize>,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const STANDARD_TIMEOUT_MS: u32 = 3_000;
const URL_TIMEOUT_MS: u32 = 2_000;
const GET_TIMEOUT_S: u32 = 30;
const POST_TIMEOUT_S: u32 = 120;
const READ_TIMEOUT_S: u32 = 30;
const DOWNLOAD_TIMEOUT_S: u32 = 60;
/// How long to wait for `+QHTTPGET` after the `OK`
const GET_RESULT_TIMEOUT_MS: u32 = 3_000;
/// Where each download chunk is parked on the module
const DOWNLOAD_FILE: &str = "dl.bin";
const BODY_START: &[u8] = b"CONNECT\r\n";
const BODY_END: &[u8] = b"\r\nOK";

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Request {
	pub fn new(url: &str) -> Request {
		Request {
			url: url.to_string(),
			tls: TlsMode::None,
			headers: None,
			context_id: 1,
		}
	}

	pub fn with_tls(mut self, mode: TlsMode) -> Request {
		self.tls = mode;
		self
	}

	pub fn with_headers(mut self, headers: &str) -> Request {
		self.headers = Some(headers.to_string());
		self
	}

	pub fn with_context(mut self, context_id: u8) -> Request {
		self.context_id = context_id;
		self
	}

	/// The host and path parts of the URL.
	pub fn host_and_path(&self) -> (&str, &str) {
		let rest = self
			.url
			.find("://")
			.map(|idx| &self.url[idx + 3..])
			.unwrap_or(self.url.as_str());
		match rest.find('/') {
			Some(idx) => (&rest[..idx], &rest[idx..]),
			None => (rest, "/"),
		}
	}

	/// A GET header block asking for bytes `start` to `end` (exclusive).
	pub fn range_headers(&self, start: usize, end: usize) -> String {
		let (host, path) = self.host_and_path();
		format!(
			"GET {} HTTP/1.1\r\nHost: {}\r\nRange: bytes={}-{}\r\n\r\n",
			path,
			host,
			start,
			end.saturating_sub(1)
		)
	}
}

impl HttpResponse {
	fn new(outcome: RequestOutcome) -> HttpResponse {
		HttpResponse {
			outcome,
			error: None,
			status: None,
			length: None,
		}
	}
}

/// Issue a GET for `req`. The body stays on the module; fetch it with
/// `read_body`.
pub fn get(modem: &mut Modem, req: &Request) -> HttpResponse {
	if let Err(e) = setup(modem, req) {
		warn!("HTTP setup for {} failed: {}", req.url, e);
		return HttpResponse::new(RequestOutcome::Failed);
	}
	send_get(modem, req.headers.as_ref().map(|h| h.as_str()), GET_TIMEOUT_S)
}

/// POST `body` to `req`'s URL. With `read_back` set the response body is
/// read and returned as well.
pub fn post(
	modem: &mut Modem,
	req: &Request,
	body: &[u8],
	read_back: bool,
) -> (RequestOutcome, Option<Vec<u8>>) {
	if let Err(e) = setup(modem, req) {
		warn!("HTTP setup for {} failed: {}", req.url, e);
		return (RequestOutcome::Failed, None);
	}
	let timeout_ms = POST_TIMEOUT_S * 1_000;
	let cmd = format!("AT+QHTTPPOST={},{},{}", body.len(), POST_TIMEOUT_S, POST_TIMEOUT_S);
	let outcome = send_payload(modem, &cmd, body, timeout_ms);
	if outcome != RequestOutcome::Successful {
		return (outcome, None);
	}
	info!("Posted {} bytes to {}", body.len(), req.url);
	if !read_back {
		return (outcome, None);
	}
	let mut response = Vec::new();
	match read_body(modem, &mut response) {
		RequestOutcome::Successful => (RequestOutcome::Successful, Some(response)),
		other => (other, None),
	}
}

/// Read the body of the last response and append it to `dest`.
pub fn read_body(modem: &mut Modem, dest: &mut Vec<u8>) -> RequestOutcome {
	let timeout_ms = READ_TIMEOUT_S * 1_000;
	let transport = modem.transport_mut();
	let overruns = transport.overruns();
	if let Err(e) = transport.send_command(&format!("AT+QHTTPREAD={}", READ_TIMEOUT_S)) {
		warn!("AT+QHTTPREAD failed: {}", e);
		return RequestOutcome::Failed;
	}
	match transport.await_any(&["CONNECT", "ERROR"], timeout_ms) {
		Ok(0) => {}
		Ok(_) => {
			let _ = modem.classify_result();
			return RequestOutcome::Failed;
		}
		Err(_) => return RequestOutcome::NoResponseReceived,
	}
	match transport.await_capture_end(b"\r\nOK\r\n", timeout_ms) {
		Ok(()) => {}
		Err(cellmodem::Error::Timeout) => {
			warn!("Response body never finished");
			return RequestOutcome::NoResponseReceived;
		}
		Err(_) => {
			warn!(
				"Response body too big for the capture ({} bytes lost); use download",
				transport.overruns() - overruns
			);
			return RequestOutcome::Failed;
		}
	}
	match body_between_markers(transport.capture()) {
		Some(body) => {
			debug!("Read {} byte body", body.len());
			dest.extend_from_slice(body);
			RequestOutcome::Successful
		}
		None => RequestOutcome::Failed,
	}
}

/// Fetch `total` bytes from `url` in `chunk` sized ranged requests, each
/// staged through a file in module RAM, into `dest`.
pub fn download(
	modem: &mut Modem,
	req: &Request,
	total: usize,
	chunk: usize,
	dest: &mut [u8],
) -> RequestOutcome {
	if chunk == 0 || dest.len() < total {
		warn!("Can't download {} bytes into {} in {} byte chunks", total, dest.len(), chunk);
		return RequestOutcome::Failed;
	}
	let mut ranged = req.clone();
	ranged.headers = Some(String::new());
	if let Err(e) = setup(modem, &ranged) {
		warn!("HTTP setup for {} failed: {}", req.url, e);
		return RequestOutcome::Failed;
	}
	let mut files = FileStore::new();
	let parts = (total + chunk - 1) / chunk;
	for part in 0..parts {
		let start = part * chunk;
		let end = std::cmp::min(total, start + chunk);
		debug!("Downloading part {} of {}: bytes {}..{}", part + 1, parts, start, end);
		let headers = req.range_headers(start, end);
		let response = send_get(modem, Some(headers.as_str()), DOWNLOAD_TIMEOUT_S);
		if response.outcome != RequestOutcome::Successful {
			return response.outcome;
		}
		let outcome = store_and_copy(modem, &mut files, &mut dest[start..end]);
		if outcome != RequestOutcome::Successful {
			return outcome;
		}
		modem.poke_watchdog();
	}
	info!("Downloaded {} bytes from {}", total, req.url);
	RequestOutcome::Successful
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

/// Point the module's HTTP client at `req`: TLS, bearer, header mode and
/// URL.
fn setup(modem: &mut Modem, req: &Request) -> Result<(), cellmodem_net::Error> {
	if req.tls.is_encrypted() {
		modem.send_expect_ok(
			&format!("AT+QHTTPCFG=\"sslctxid\",{}", cellmodem_net::SSL_CONTEXT),
			STANDARD_TIMEOUT_MS,
		)?;
		cellmodem_net::activate_ssl(modem, cellmodem_net::SSL_CONTEXT, req.tls)?;
	}
	modem.send_expect_ok(
		&format!("AT+QHTTPCFG=\"contextid\",{}", req.context_id),
		STANDARD_TIMEOUT_MS,
	)?;
	let header_mode = if req.headers.is_some() { 1 } else { 0 };
	modem.send_expect_ok(
		&format!("AT+QHTTPCFG=\"requestheader\",{}", header_mode),
		STANDARD_TIMEOUT_MS,
	)?;
	modem.send_and_check(
		&format!("AT+QHTTPURL={},{}", req.url.len(), URL_TIMEOUT_MS / 1_000),
		"CONNECT",
		URL_TIMEOUT_MS,
	)?;
	let transport = modem.transport_mut();
	transport.send_raw(req.url.as_bytes())?;
	if transport.await_any(&["OK", "ERROR"], STANDARD_TIMEOUT_MS)? != 0 {
		return Err(modem.classify_result().err().unwrap_or(cellmodem::Error::Malformed).into());
	}
	Ok(())
}

/// `AT+QHTTPGET`, with our own header block if given, then pick up the
/// result line.
fn send_get(modem: &mut Modem, headers: Option<&str>, timeout_s: u32) -> HttpResponse {
	let timeout_ms = timeout_s * 1_000;
	let outcome = match headers {
		Some(headers) => {
			let cmd = format!("AT+QHTTPGET={},{}", timeout_s, headers.len());
			send_payload(modem, &cmd, headers.as_bytes(), timeout_ms)
		}
		None => {
			let cmd = format!("AT+QHTTPGET={}", timeout_s);
			match modem.send_expect_ok(&cmd, timeout_ms) {
				Ok(()) => RequestOutcome::Successful,
				Err(cellmodem::Error::Timeout) => RequestOutcome::NoResponseReceived,
				Err(_) => RequestOutcome::Failed,
			}
		}
	};
	let mut response = HttpResponse::new(outcome);
	if outcome != RequestOutcome::Successful {
		warn!("GET failed: {:?} (CME {:?})", outcome, modem.last_error());
		return response;
	}
	match modem
		.transport_mut()
		.await_line("+QHTTPGET: ", GET_RESULT_TIMEOUT_MS)
	{
		Ok(line) => {
			let fields = tokenize::fields(&line);
			response.error = fields.int(0).map(|n| n as i32);
			response.status = fields.int(1).map(|n| n as u16);
			response.length = fields.int(2).map(|n| n as usize);
			if response.error.map_or(false, |e| e != 0) {
				response.outcome = RequestOutcome::Failed;
			}
		}
		Err(e) => {
			warn!("GET accepted but no +QHTTPGET result: {}", e);
			response.outcome = RequestOutcome::NoResponseReceived;
		}
	}
	debug!("GET gave {:?}", response);
	response
}

/// Send a command that answers `CONNECT`, then the payload, then wait for
/// the final result.
fn send_payload(modem: &mut Modem, cmd: &str, payload: &[u8], timeout_ms: u32) -> RequestOutcome {
	let transport = modem.transport_mut();
	if transport.send_command(cmd).is_err() {
		return RequestOutcome::Failed;
	}
	match transport.await_any(&["CONNECT", "ERROR"], timeout_ms) {
		Ok(0) => {}
		Ok(_) => {
			let _ = modem.classify_result();
			return RequestOutcome::Failed;
		}
		Err(_) => return RequestOutcome::NoResponseReceived,
	}
	// Only what follows the payload counts as the result
	transport.begin_wait();
	if transport.send_raw(payload).is_err() {
		return RequestOutcome::Failed;
	}
	match transport.await_any(&["OK", "ERROR"], timeout_ms) {
		Ok(0) => RequestOutcome::Successful,
		Ok(_) => {
			let _ = modem.classify_result();
			RequestOutcome::Failed
		}
		Err(_) => RequestOutcome::NoResponseReceived,
	}
}

/// Have the module store the response in RAM, then copy it out into
/// `dest` and tidy up.
fn store_and_copy(modem: &mut Modem, files: &mut FileStore, dest: &mut [u8]) -> RequestOutcome {
	let name = format!("RAM:{}", DOWNLOAD_FILE);
	let cmd = format!("AT+QHTTPREADFILE=\"{}\",{}", name, DOWNLOAD_TIMEOUT_S);
	let stored = modem
		.transport_mut()
		.send_command(&cmd)
		.and_then(|_| {
			modem
				.transport_mut()
				.await_line("+QHTTPREADFILE: ", DOWNLOAD_TIMEOUT_S * 1_000)
		});
	match stored.as_ref().map(|l| tokenize::leading_int(l)) {
		Ok(Some(0)) => {}
		Ok(code) => {
			warn!("Storing the response failed with {:?}", code);
			return RequestOutcome::Failed;
		}
		Err(_) => return RequestOutcome::NoResponseReceived,
	}

	let outcome = match files.open_read_only(modem, &name) {
		Ok(handle) => {
			let mut copied = 0;
			let mut outcome = RequestOutcome::Successful;
			while copied < dest.len() {
				let end = std::cmp::min(dest.len(), copied + MAX_READ_LEN);
				match files.read(modem, handle, &mut dest[copied..end]) {
					Ok(0) => {
						warn!("Stored response ended after {} of {} bytes", copied, dest.len());
						outcome = RequestOutcome::Failed;
						break;
					}
					Ok(n) => copied += n,
					Err(e) => {
						warn!("Reading stored response failed: {}", e);
						outcome = RequestOutcome::Failed;
						break;
					}
				}
			}
			outcome
		}
		Err(e) => {
			warn!("Can't open {}: {}", name, e);
			RequestOutcome::Failed
		}
	};
	if let Err(e) = files.delete(modem, &name) {
		warn!("Can't delete {}: {}", name, e);
	}
	outcome
}

/// The body of an `AT+QHTTPREAD` reply: everything after `CONNECT\r\n` up
/// to the last `\r\nOK`.
fn body_between_markers(capture: &[u8]) -> Option<&[u8]> {
	let start = find(capture, BODY_START)? + BODY_START.len();
	let end = rfind(capture, BODY_END)?;
	if end >= start {
		Some(&capture[start..end])
	} else {
		None
	}
}

/// Offset just past the CRLF ending the first line that starts with `tag`.
pub(crate) fn after_line(capture: &[u8], tag: &[u8]) -> Option<usize> {
	let at = find(capture, tag)?;
	find(&capture[at..], b"\r\n").map(|idx| at + idx + 2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
pub(crate) fn test_modem() -> (Modem, cellmodem::mock::MockPort, cellmodem::mock::MockClock) {
	use cellmodem::mock::{MockClock, MockPins, MockPort};
	let _ = env_logger::try_init();
	let clock = MockClock::new();
	let port = MockPort::with_clock(&clock);
	let m = Modem::new(
		Box::new(port.clone()),
		Box::new(clock.clone()),
		Box::new(MockPins::new(&clock)),
		cellmodem::Config::default(),
	);
	(m, port, clock)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
