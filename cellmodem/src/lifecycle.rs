//! # lifecycle - Power the module up and get it onto the network
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! `Modem::initialize` walks the module through the states in
//! `LifecycleState`: power sequencing, waiting for it to answer `AT`, the
//! one-off configuration, SIM check and network registration. A failure
//! stops the walk and is recorded as both the state and the status code.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use crate::tokenize;
use crate::{Error, LifecycleState, Modem, ModemErrorCode, NetworkRegistrationState};

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const SETUP_TIMEOUT_MS: u32 = 1_000;
const CPIN_TIMEOUT_MS: u32 = 1_000;
const CREG_TIMEOUT_MS: u32 = 1_000;
/// `+CREG: ..`, a blank line and `OK`
const CREG_LINES: usize = 3;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Modem {
	/// Power the module up and take it all the way to `Ready`.
	pub fn initialize(&mut self) -> Result<(), ModemErrorCode> {
		let baud = self.config.baud;
		if let Err(e) = self.transport.configure(baud) {
			warn!("Serial port setup failed: {}", e);
			return Err(self.fail(ModemErrorCode::NoModule));
		}
		self.pins.set_power_enable(false);
		self.pins.set_power_key(false);

		if self.power_on(true).is_err() {
			return Err(self.fail(ModemErrorCode::NoModule));
		}

		self.set_state(LifecycleState::Configuring);
		let ipr = format!("AT+IPR={}", baud);
		for cmd in &[ipr.as_str(), "AT&W", "ATE0", "AT+CMEE=2"] {
			if let Err(e) = self.send_expect_ok(cmd, SETUP_TIMEOUT_MS) {
				warn!("{} failed: {}", cmd, e);
			}
		}

		// The start-up URCs may already be in the buffer from the last
		// exchange; neither is fatal if it never shows.
		let ready_ms = self.config.ready_timeout_ms;
		for urc in &["Call Ready", "SMS Ready"] {
			if self.transport.await_token(urc, ready_ms).is_err() {
				debug!("No {:?} from the module", urc);
			}
		}

		if let Some(model) = self.config.expected_model.clone() {
			self.check_model(&model)?;
		}

		self.set_state(LifecycleState::AwaitingSimReady);
		if self
			.send_and_check("AT+CPIN?", "+CPIN: READY", CPIN_TIMEOUT_MS)
			.is_err()
		{
			return Err(self.fail(ModemErrorCode::NoSIMCard));
		}

		let budget = self.config.registration_budget_ms;
		if !self.poll_registration("AT+CREG?", "+CREG: ", budget, true) {
			return Err(self.fail(ModemErrorCode::NotRegisteredGSM));
		}

		self.status = ModemErrorCode::NoError;
		self.set_state(LifecycleState::Ready);
		Ok(())
	}

	/// Run the power-key sequence. With `probe` set, then keep sending `AT`
	/// until the module answers or the probe budget is spent; every
	/// unanswered probe pokes the watchdog.
	pub fn power_on(&mut self, probe: bool) -> Result<(), Error> {
		self.set_state(LifecycleState::PoweringOn);
		self.pins.set_power_enable(true);
		self.delay_ms(self.config.regulator_settle_ms);
		self.pins.set_power_key(false);
		self.delay_ms(self.config.power_key_low_ms);
		self.pins.set_power_key(true);
		self.delay_ms(self.config.power_key_high_ms);
		if !probe {
			return Ok(());
		}

		self.set_state(LifecycleState::AwaitingATEcho);
		let interval = self.config.probe_interval_ms;
		let attempts = std::cmp::max(self.config.probe_budget_ms / std::cmp::max(interval, 1), 1);
		for attempt in 1..=attempts {
			match self.send_and_check("AT", "OK", interval) {
				Ok(()) => {
					info!("Module answered after {} probe(s)", attempt);
					return Ok(());
				}
				Err(Error::IOError(kind)) => return Err(Error::IOError(kind)),
				Err(_) => {
					trace!("No answer to probe {}", attempt);
					self.poke_watchdog();
				}
			}
		}
		Err(Error::Timeout)
	}

	/// Release the power key and drop the regulator. Always succeeds.
	pub fn power_off(&mut self) {
		self.pins.set_power_key(false);
		self.delay_ms(self.config.power_off_ms);
		self.pins.set_power_enable(false);
		self.delay_ms(self.config.power_off_ms);
		self.set_state(LifecycleState::PoweredOff);
	}

	/// Ask for the GSM registration state once.
	pub fn registration(&mut self) -> Result<NetworkRegistrationState, Error> {
		self.query_registration("AT+CREG?", "+CREG: ")
	}

	/// Ask for the GPRS attach state once.
	pub fn gprs_registration(&mut self) -> Result<NetworkRegistrationState, Error> {
		self.query_registration("AT+CGREG?", "+CGREG: ")
	}

	/// Poll the GPRS attach state until registered or `timeout_ms` runs out.
	pub fn await_gprs_registration(&mut self, timeout_ms: u32) -> Result<(), ModemErrorCode> {
		if self.poll_registration("AT+CGREG?", "+CGREG: ", timeout_ms, false) {
			Ok(())
		} else {
			warn!("Not attached to GPRS after {} ms", timeout_ms);
			self.status = ModemErrorCode::NotRegisteredGPRS;
			Err(ModemErrorCode::NotRegisteredGPRS)
		}
	}

	/// The model string from `AT+GMM`.
	pub fn model(&mut self) -> Result<String, Error> {
		self.send_expect_ok("AT+GMM", self.config.command_timeout_ms)?;
		let text = self.transport.text();
		let model = tokenize::lines(&text)
			.find(|l| *l != "OK" && *l != "AT+GMM")
			.map(|l| l.trim().to_string());
		model.ok_or(Error::Malformed)
	}

	/// Fail with `ModelMismatch` unless the module reports `expected`.
	pub fn check_model(&mut self, expected: &str) -> Result<(), ModemErrorCode> {
		match self.model() {
			Ok(ref model) if model == expected => Ok(()),
			Ok(model) => {
				warn!("Expected model {:?}, module says {:?}", expected, model);
				Err(self.fail(ModemErrorCode::ModelMismatch))
			}
			Err(e) => {
				warn!("Couldn't read the model: {}", e);
				Err(self.fail(ModemErrorCode::ModelMismatch))
			}
		}
	}

	/// `(rssi, ber)` from `AT+CSQ`. 99 means not known.
	pub fn signal_quality(&mut self) -> Result<(u8, u8), Error> {
		self.send_expect_ok("AT+CSQ", self.config.command_timeout_ms)?;
		let text = self.transport.text();
		let fields = tokenize::tagged(&text, "+CSQ: ").ok_or(Error::Malformed)?;
		match (fields.int(0), fields.int(1)) {
			(Some(rssi), Some(ber)) => Ok((rssi as u8, ber as u8)),
			_ => Err(Error::Malformed),
		}
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl Modem {
	fn query_registration(
		&mut self,
		cmd: &str,
		prefix: &str,
	) -> Result<NetworkRegistrationState, Error> {
		let text = self.send_and_collect(cmd, CREG_TIMEOUT_MS, CREG_LINES)?;
		Ok(NetworkRegistrationState::decode(&text, prefix))
	}

	/// Keep asking until registered (home or roaming) or the budget is
	/// spent. Each unsuccessful poll pokes the watchdog.
	fn poll_registration(&mut self, cmd: &str, prefix: &str, budget_ms: u32, track: bool) -> bool {
		let start = self.now_ms();
		let interval = self.config.registration_interval_ms;
		loop {
			let reg = match self.query_registration(cmd, prefix) {
				Ok(reg) => reg,
				Err(e) => {
					debug!("{} failed: {}", cmd, e);
					NetworkRegistrationState::Unknown
				}
			};
			if track {
				self.set_state(LifecycleState::AwaitingRegistration(reg));
			}
			if reg.is_registered() {
				info!("{} reports {:?}", cmd, reg);
				return true;
			}
			self.poke_watchdog();
			if self.now_ms() - start >= u64::from(budget_ms) {
				return false;
			}
			self.delay_ms(interval);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::mock::{MockClock, MockPins, MockPort, Pin, PinEvent};
	use crate::Config;
	use std::cell::Cell;
	use std::rc::Rc;

	struct Rig {
		modem: Modem,
		port: MockPort,
		clock: MockClock,
		pins: MockPins,
		pokes: Rc<Cell<u32>>,
	}

	fn rig(config: Config) -> Rig {
		let _ = env_logger::try_init();
		let clock = MockClock::new();
		let port = MockPort::with_clock(&clock);
		let pins = MockPins::new(&clock);
		let mut modem = Modem::new(
			Box::new(port.clone()),
			Box::new(clock.clone()),
			Box::new(pins.clone()),
			config,
		);
		let pokes = Rc::new(Cell::new(0));
		let counter = pokes.clone();
		modem.set_watchdog(Box::new(move || counter.set(counter.get() + 1)));
		Rig {
			modem,
			port,
			clock,
			pins,
			pokes,
		}
	}

	fn script_setup(port: &MockPort) {
		port.always("AT", "\r\nOK\r\n");
		port.expect("AT+IPR=115200", "\r\nOK\r\n");
		port.expect("AT&W", "\r\nOK\r\n");
		port.expect("ATE0", "\r\nOK\r\n");
		port.expect("AT+CMEE=2", "\r\nOK\r\n\r\nCall Ready\r\n\r\nSMS Ready\r\n");
	}

	#[test]
	fn initialize_reaches_ready() {
		let mut r = rig(Config::default());
		script_setup(&r.port);
		r.port.expect("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
		r.port.expect("AT+CREG?", "\r\n+CREG: 0,2\r\n\r\nOK\r\n");
		r.port.expect("AT+CREG?", "\r\n+CREG: 0,1\r\n\r\nOK\r\n");
		assert_eq!(r.modem.initialize(), Ok(()));
		assert_eq!(r.modem.state(), LifecycleState::Ready);
		assert_eq!(r.modem.status(), ModemErrorCode::NoError);
		assert_eq!(r.port.baud(), Some(115_200));
		assert_eq!(
			r.port.commands(),
			vec![
				"AT",
				"AT+IPR=115200",
				"AT&W",
				"ATE0",
				"AT+CMEE=2",
				"AT+CPIN?",
				"AT+CREG?",
				"AT+CREG?",
			]
		);
		// One poke for the poll that saw Searching
		assert_eq!(r.pokes.get(), 1);
	}

	#[test]
	fn silent_module_is_no_module() {
		let mut r = rig(Config::default());
		assert_eq!(r.modem.initialize(), Err(ModemErrorCode::NoModule));
		assert_eq!(r.modem.status(), ModemErrorCode::NoModule);
		assert_eq!(r.modem.state(), LifecycleState::Failed(ModemErrorCode::NoModule));
		let probes = r.port.commands().iter().filter(|c| *c == "AT").count();
		assert_eq!(probes, 10);
		assert_eq!(r.pokes.get(), 10);
		// 5 s of power sequencing, then ten probes of settle plus 500 ms
		assert_eq!(r.clock.now(), 5_000 + 10 * 510);
	}

	#[test]
	fn late_module_is_found() {
		let mut r = rig(Config::default());
		r.port.expect("AT", "");
		r.port.expect("AT", "");
		r.port.expect("AT", "\r\nOK\r\n");
		assert_eq!(r.modem.power_on(true), Ok(()));
		assert_eq!(r.pokes.get(), 2);
		assert_eq!(r.modem.state(), LifecycleState::AwaitingATEcho);
	}

	#[test]
	fn missing_sim() {
		let mut r = rig(Config::default());
		script_setup(&r.port);
		r.port.expect("AT+CPIN?", "\r\n+CME ERROR: SIM not inserted\r\n");
		assert_eq!(r.modem.initialize(), Err(ModemErrorCode::NoSIMCard));
		assert_eq!(r.modem.state(), LifecycleState::Failed(ModemErrorCode::NoSIMCard));
		assert_eq!(r.port.count("AT+CREG?"), 0);
	}

	#[test]
	fn never_registers() {
		let mut r = rig(Config::default());
		script_setup(&r.port);
		r.port.expect("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
		r.port.always("AT+CREG?", "\r\n+CREG: 0,2\r\n\r\nOK\r\n");
		let start = r.clock.now();
		assert_eq!(r.modem.initialize(), Err(ModemErrorCode::NotRegisteredGSM));
		assert_eq!(r.modem.status(), ModemErrorCode::NotRegisteredGSM);
		let polls = r.port.count("AT+CREG?");
		assert!(polls > 100, "only {} polls", polls);
		assert!(polls <= 121, "{} polls", polls);
		assert!(r.clock.now() - start >= 60_000);
		assert_eq!(r.pokes.get() as usize, polls);
	}

	#[test]
	fn roaming_counts_as_registered() {
		let mut r = rig(Config::default());
		script_setup(&r.port);
		r.port.expect("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
		r.port.expect("AT+CREG?", "\r\n+CREG: 0,5\r\n\r\nOK\r\n");
		assert_eq!(r.modem.initialize(), Ok(()));
	}

	#[test]
	fn missing_start_up_urcs_are_not_fatal() {
		let mut r = rig(Config::default());
		r.port.always("AT", "\r\nOK\r\n");
		r.port.expect("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n");
		r.port.expect("AT+CREG?", "\r\n+CREG: 0,1\r\n\r\nOK\r\n");
		assert_eq!(r.modem.initialize(), Ok(()));
	}

	#[test]
	fn wrong_model_is_rejected() {
		let mut config = Config::default();
		config.expected_model = Some("M66".to_string());
		let mut r = rig(config);
		script_setup(&r.port);
		r.port.expect("AT+GMM", "\r\nM95\r\n\r\nOK\r\n");
		assert_eq!(r.modem.initialize(), Err(ModemErrorCode::ModelMismatch));
		assert_eq!(r.port.count("AT+CPIN?"), 0);
	}

	#[test]
	fn right_model_is_accepted() {
		let mut r = rig(Config::default());
		r.port.expect("AT+GMM", "\r\nQuectel_M66\r\n\r\nOK\r\n");
		assert_eq!(r.modem.model(), Ok("Quectel_M66".to_string()));
		r.port.expect("AT+GMM", "\r\nQuectel_M66\r\n\r\nOK\r\n");
		assert_eq!(r.modem.check_model("Quectel_M66"), Ok(()));
	}

	#[test]
	fn power_sequence_timing() {
		let mut r = rig(Config::default());
		assert_eq!(r.modem.power_on(false), Ok(()));
		assert_eq!(r.clock.now(), 5_000);
		r.modem.power_off();
		assert_eq!(r.modem.state(), LifecycleState::PoweredOff);
		let ev = |pin, high, at_ms| PinEvent { pin, high, at_ms };
		assert_eq!(
			r.pins.events(),
			vec![
				ev(Pin::PowerEnable, true, 0),
				ev(Pin::PowerKey, false, 2_000),
				ev(Pin::PowerKey, true, 4_000),
				ev(Pin::PowerKey, false, 5_000),
				ev(Pin::PowerEnable, false, 5_500),
			]
		);
		assert_eq!(r.clock.now(), 6_000);
		assert!(r.port.written().is_empty());
	}

	#[test]
	fn signal_quality_is_parsed() {
		let mut r = rig(Config::default());
		r.port.expect("AT+CSQ", "\r\n+CSQ: 24,0\r\n\r\nOK\r\n");
		assert_eq!(r.modem.signal_quality(), Ok((24, 0)));
		r.port.expect("AT+CSQ", "\r\nOK\r\n");
		assert_eq!(r.modem.signal_quality(), Err(Error::Malformed));
	}

	#[test]
	fn gprs_attach_poll() {
		let mut r = rig(Config::default());
		r.port.expect("AT+CGREG?", "\r\n+CGREG: 0,2\r\n\r\nOK\r\n");
		r.port.expect("AT+CGREG?", "\r\n+CGREG: 0,1\r\n\r\nOK\r\n");
		assert_eq!(r.modem.await_gprs_registration(10_000), Ok(()));
		assert_eq!(r.port.count("AT+CGREG?"), 2);
	}

	#[test]
	fn gprs_never_attaches() {
		let mut r = rig(Config::default());
		r.port.always("AT+CGREG?", "\r\n+CGREG: 0,0\r\n\r\nOK\r\n");
		assert_eq!(
			r.modem.await_gprs_registration(2_000),
			Err(ModemErrorCode::NotRegisteredGPRS)
		);
		assert_eq!(r.modem.status(), ModemErrorCode::NotRegisteredGPRS);
		assert_eq!(r.modem.gprs_registration(), Ok(NetworkRegistrationState::NotRegistered));
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
