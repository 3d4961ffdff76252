//! # hal - The hardware the modem driver needs from its host
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! The driver owns none of the board. It is handed a serial port, a clock
//! and the two power lines as trait objects, so the same engine runs against
//! a real UART, a tty on a development host, or the scripted doubles in
//! `mock`.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::io;
use std::thread;
use std::time::{Duration, Instant};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// An asynchronous serial link to the module (8N1).
pub trait SerialPort {
	/// Bring the peripheral up at the given baud rate.
	fn configure(&mut self, _baud: u32) -> io::Result<()> {
		Ok(())
	}

	/// Blocking write of every byte in `data`. Implementations give up after
	/// `timeout_ms`.
	fn write(&mut self, data: &[u8], timeout_ms: u32) -> io::Result<()>;

	/// Hand over bytes received since the last call, oldest first. `accept`
	/// returns false once the receiver has no more room; any byte it refused
	/// must be offered again on the next call. Returns the number of bytes
	/// accepted.
	fn receive(&mut self, accept: &mut dyn FnMut(u8) -> bool) -> usize;
}

/// Monotonic time and a blocking delay.
pub trait Clock {
	fn delay_ms(&mut self, ms: u32);
	fn now_ms(&self) -> u64;
}

/// The modem's power-enable (regulator) and power-key lines.
pub trait PowerControl {
	fn set_power_enable(&mut self, high: bool);
	fn set_power_key(&mut self, high: bool);
}

/// Poked from inside long waits so an external supervisor isn't tripped.
/// Must not block, and must not touch the modem.
pub type Watchdog = Box<dyn FnMut()>;

/// A `Clock` on top of `std::time`.
pub struct SystemClock {
	start: Instant,
}

/// For boards where the modem's rails are switched by something else.
#[derive(Debug, Default)]
pub struct NoPowerControl;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl SystemClock {
	pub fn new() -> SystemClock {
		SystemClock {
			start: Instant::now(),
		}
	}
}

impl Default for SystemClock {
	fn default() -> SystemClock {
		SystemClock::new()
	}
}

impl Clock for SystemClock {
	fn delay_ms(&mut self, ms: u32) {
		thread::sleep(Duration::from_millis(u64::from(ms)));
	}

	fn now_ms(&self) -> u64 {
		let elapsed = self.start.elapsed();
		elapsed.as_secs() * 1_000 + u64::from(elapsed.subsec_millis())
	}
}

impl PowerControl for NoPowerControl {
	fn set_power_enable(&mut self, high: bool) {
		trace!("power enable -> {} (not wired)", high);
	}

	fn set_power_key(&mut self, high: bool) {
		trace!("power key -> {} (not wired)", high);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn system_clock_advances() {
		let mut clock = SystemClock::new();
		let before = clock.now_ms();
		clock.delay_ms(5);
		assert!(clock.now_ms() >= before + 5);
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
