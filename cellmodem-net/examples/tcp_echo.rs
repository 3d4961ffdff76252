//! # tcp_echo - talk to a TCP echo server through the module
//!
//! Usage: `tcp_echo <tty> <apn> <host> <port>`

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
use cellmodem::{Config, Modem};
use cellmodem_net::{Apn, Socket};

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
	if args.len() != 5 {
		eprintln!("Usage: {} <tty> <apn> <host> <port>", args[0]);
		process::exit(1);
	}
	let port: u16 = match args[4].parse() {
		Ok(port) => port,
		Err(_) => {
			eprintln!("Bad port {:?}", args[4]);
			process::exit(1);
		}
	};

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

	info!("Hello, this is the cellmodem TCP echo example.");
	if let Err(code) = modem.initialize() {
		error!("Modem didn't come up: {:?}", code);
		process::exit(1);
	}
	if let Err(e) = cellmodem_net::connect_gprs(&mut modem, &Apn::new(&args[2])) {
		error!("No data bearer: {}", e);
		process::exit(1);
	}

	if let Err(e) = echo(&mut modem, &args[3], port) {
		error!("Echo failed: {}", e);
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

fn echo(modem: &mut Modem, host: &str, port: u16) -> Result<(), cellmodem_net::Error> {
	let mut socket = Socket::connect_to(modem, host, port)?;
	socket.write_all(b"hello from cellmodem\r\n")?;
	let mut buf = [0u8; 256];
	for _ in 0..10 {
		let n = socket.read(&mut buf)?;
		if n > 0 {
			info!("Echoed: {:?}", String::from_utf8_lossy(&buf[..n]));
			break;
		}
		socket.modem().delay_ms(500);
	}
	socket.close()
}

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
