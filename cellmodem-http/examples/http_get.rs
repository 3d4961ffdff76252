//! # http_get - fetch a URL through the module and print the body
//!
//! Usage: `http_get <tty> <apn> <url>`

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
extern crate log;

use std::env;
use std::process;

use cellmodem::hal::{NoPowerControl, SystemClock};
use cellmodem::{Config, Modem, RequestOutcome, TlsMode};
use cellmodem_http::Request;
use cellmodem_net::Apn;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// Start of our example program
#[cfg(unix)]
fn main() {
	init_logging();

	let args: Vec<String> = env::args().collect();
	if args.len() != 4 {
		eprintln!("Usage: {} <tty> <apn> <url>", args[0]);
		process::exit(1);
	}

	let serial = match cellmodem::host::HostSerial::open(&args[1]) {
		Ok(serial) => serial,
		Err(e) => {
			error!("Can't open {}: {}", args[1], e);
			process::exit(1);
		}
	};
	let mut modem = Modem::new(
		Box::new(serial),
		Box::new(SystemClock::new()),
		Box::new(NoPowerControl),
		Config::default(),
	);

	info!("Hello, this is the cellmodem HTTP example.");
	if let Err(code) = modem.initialize() {
		error!("Modem didn't come up: {:?}", code);
		process::exit(1);
	}
	if let Err(e) = cellmodem_net::connect_gprs(&mut modem, &Apn::new(&args[2])) {
		error!("No data bearer: {}", e);
		process::exit(1);
	}

	let mut req = Request::new(&args[3]);
	if args[3].starts_with("https://") {
		req = req.with_tls(TlsMode::All);
	}
	let response = cellmodem_http::get(&mut modem, &req);
	info!("GET {} -> {:?}", req.url, response);
	if response.outcome == RequestOutcome::Successful {
		let mut body = Vec::new();
		match cellmodem_http::read_body(&mut modem, &mut body) {
			RequestOutcome::Successful => println!("{}", String::from_utf8_lossy(&body)),
			other => warn!("Couldn't read the body: {:?}", other),
		}
	}

	if let Err(e) = cellmodem_net::disconnect_gprs(&mut modem) {
		warn!("Deactivation failed: {}", e);
	}
	modem.power_off();
}

#[cfg(not(unix))]
fn main() {
	eprintln!("This example needs a Unix tty");
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

#[cfg(unix)]
fn init_logging() {
	let mut builder = env_logger::Builder::new();
	builder.filter(None, log::LevelFilter::Info);
	if let Ok(spec) = env::var("RUST_LOG") {
		// Allow environment variable override
		builder.parse(&spec);
	}
	builder.init();
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
