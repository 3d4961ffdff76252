//! # host - A `SerialPort` on a Unix tty
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! For running the driver on a development host with the module on a USB
//! serial adapter. A background thread polls the tty with mio and forwards
//! whatever it reads over a channel; the driver picks the chunks up when it
//! drains. The thread's stop signal arrives on a mio-more channel registered
//! in the same poll set.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io;
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::sync::mpsc;
use std::thread;

use mio::unix::EventedFd;

use crate::hal::SerialPort;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A tty opened read/write, with a receive thread behind it.
pub struct HostSerial {
	name: String,
	file: File,
	chunks: mpsc::Receiver<Vec<u8>>,
	stop: mio_more::channel::Sender<()>,
	/// Received but not yet accepted by the driver
	pending: VecDeque<u8>,
	pump: Option<thread::JoinHandle<()>>,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const MAX_READ_LEN: usize = 2048;
const MESSAGE_TOKEN: mio::Token = mio::Token(0);
const TTY_TOKEN: mio::Token = mio::Token(1);

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl HostSerial {
	/// Open a tty device such as `/dev/ttyUSB0`.
	pub fn open(path: &str) -> io::Result<HostSerial> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		HostSerial::from_file(file, path)
	}

	/// Wrap something already open. It must be pollable (a tty, pipe or
	/// socket, not a regular file).
	pub fn from_file(file: File, name: &str) -> io::Result<HostSerial> {
		let reader = file.try_clone()?;
		let (chunk_tx, chunk_rx) = mpsc::channel();
		let (stop_tx, stop_rx) = mio_more::channel::channel();
		let poll = mio::Poll::new()?;
		poll.register(
			&stop_rx,
			MESSAGE_TOKEN,
			mio::Ready::readable(),
			mio::PollOpt::level(),
		)?;
		let fd = reader.as_raw_fd();
		poll.register(
			&EventedFd(&fd),
			TTY_TOKEN,
			mio::Ready::readable(),
			mio::PollOpt::level(),
		)?;
		let pump = thread::Builder::new()
			.name(format!("serial {}", name))
			.spawn(move || pump(&poll, reader, &stop_rx, &chunk_tx))?;
		info!("Opened {}", name);
		Ok(HostSerial {
			name: name.to_string(),
			file,
			chunks: chunk_rx,
			stop: stop_tx,
			pending: VecDeque::new(),
			pump: Some(pump),
		})
	}
}

impl SerialPort for HostSerial {
	/// Put the line into raw mode at `baud` using `stty`.
	fn configure(&mut self, baud: u32) -> io::Result<()> {
		let status = Command::new("stty")
			.arg("-F")
			.arg(&self.name)
			.arg(baud.to_string())
			.arg("raw")
			.arg("-echo")
			.status()?;
		if status.success() {
			Ok(())
		} else {
			Err(io::Error::new(
				io::ErrorKind::Other,
				format!("stty failed on {}", self.name),
			))
		}
	}

	/// The tty is in blocking mode, so `timeout_ms` isn't enforced here.
	fn write(&mut self, data: &[u8], _timeout_ms: u32) -> io::Result<()> {
		self.file.write_all(data)?;
		self.file.flush()
	}

	fn receive(&mut self, accept: &mut dyn FnMut(u8) -> bool) -> usize {
		while let Ok(chunk) = self.chunks.try_recv() {
			self.pending.extend(chunk);
		}
		let mut count = 0;
		while let Some(&byte) = self.pending.front() {
			if !accept(byte) {
				break;
			}
			self.pending.pop_front();
			count += 1;
		}
		count
	}
}

impl Drop for HostSerial {
	fn drop(&mut self) {
		debug!("Closing {}", self.name);
		if self.stop.send(()).is_err() {
			debug!("Serial pump for {} already gone", self.name);
		}
		if let Some(pump) = self.pump.take() {
			if pump.join().is_err() {
				warn!("Serial pump for {} panicked", self.name);
			}
		}
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

/// The receive thread. Runs until told to stop, the tty closes, or nobody
/// is listening any more.
fn pump(
	poll: &mio::Poll,
	mut tty: File,
	stop: &mio_more::channel::Receiver<()>,
	chunks: &mpsc::Sender<Vec<u8>>,
) {
	let mut events = mio::Events::with_capacity(16);
	let mut buf = [0u8; MAX_READ_LEN];
	loop {
		if let Err(e) = poll.poll(&mut events, None) {
			warn!("Serial poll failed: {}", e);
			return;
		}
		for event in events.iter() {
			let token = event.token();
			if token == MESSAGE_TOKEN {
				if stop.try_recv().is_ok() {
					debug!("Serial pump stopping");
					return;
				}
			} else if token == TTY_TOKEN && event.readiness().is_readable() {
				match tty.read(&mut buf) {
					Ok(0) => {
						debug!("Serial port closed");
						return;
					}
					Ok(n) => {
						trace!("Rx {} bytes", n);
						if chunks.send(buf[..n].to_vec()).is_err() {
							return;
						}
					}
					Err(ref e)
						if e.kind() == io::ErrorKind::WouldBlock
							|| e.kind() == io::ErrorKind::Interrupted => {}
					Err(e) => {
						warn!("Serial read failed: {}", e);
						return;
					}
				}
			} else {
				warn!("Event on unknown token {:?}", token);
			}
		}
	}
}

impl fmt::Debug for HostSerial {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"HostSerial {{ name: {}, pending.len: {} }}",
			self.name,
			self.pending.len()
		)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::os::unix::io::OwnedFd;
	use std::os::unix::net::UnixStream;
	use std::time::Duration;

	fn pair() -> (HostSerial, UnixStream) {
		let (ours, theirs) = UnixStream::pair().unwrap();
		let file = File::from(OwnedFd::from(ours));
		(HostSerial::from_file(file, "socketpair").unwrap(), theirs)
	}

	fn collect(port: &mut HostSerial, want: usize) -> Vec<u8> {
		let mut got = Vec::new();
		for _ in 0..200 {
			port.receive(&mut |b| {
				got.push(b);
				true
			});
			if got.len() >= want {
				break;
			}
			thread::sleep(Duration::from_millis(5));
		}
		got
	}

	#[test]
	fn bytes_arrive_through_the_pump() {
		let (mut port, mut far) = pair();
		far.write_all(b"\r\nOK\r\n").unwrap();
		assert_eq!(collect(&mut port, 6), b"\r\nOK\r\n");
	}

	#[test]
	fn writes_reach_the_far_end() {
		let (mut port, mut far) = pair();
		port.write(b"AT\r\n", 100).unwrap();
		let mut buf = [0u8; 4];
		far.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"AT\r\n");
	}

	#[test]
	fn refused_bytes_wait_for_next_time() {
		let (mut port, mut far) = pair();
		far.write_all(b"abcd").unwrap();
		let mut first = Vec::new();
		for _ in 0..200 {
			port.receive(&mut |b| {
				if first.len() < 2 {
					first.push(b);
					true
				} else {
					false
				}
			});
			if first.len() == 2 {
				break;
			}
			thread::sleep(Duration::from_millis(5));
		}
		assert_eq!(first, b"ab");
		assert_eq!(collect(&mut port, 2), b"cd");
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
