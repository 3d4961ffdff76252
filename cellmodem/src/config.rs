//! # config - Tunables for the modem driver
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! Everything here has a working default for a Quectel M66 on a 115200 baud
//! link. Build one with `Config::default()` and override the fields you care
//! about.

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Sizes, delays and timeouts used by the driver. All times are in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// Serial line rate, and the rate pinned on the module with `AT+IPR`
	pub baud: u32,
	/// Bytes the receive ring buffer can hold between polls
	pub rx_capacity: usize,
	/// Bytes each line buffer keeps per exchange
	pub line_capacity: usize,
	/// Bytes of raw reply kept for payload extraction
	pub capture_capacity: usize,
	/// How long a wait sleeps between polls
	pub tick_ms: u32,
	/// Pause before each command is written
	pub settle_ms: u32,
	/// How long a single serial write may block
	pub write_timeout_ms: u32,
	/// Default reply timeout for simple commands
	pub command_timeout_ms: u32,

	/// Regulator on, before the power key is pulled low
	pub regulator_settle_ms: u32,
	/// Power key held low
	pub power_key_low_ms: u32,
	/// Power key released, before probing
	pub power_key_high_ms: u32,
	/// Regulator off, after the power key is released on shutdown
	pub power_off_ms: u32,
	/// Gap between `AT` probes while waiting for the module to boot
	pub probe_interval_ms: u32,
	/// Total time spent probing for the module
	pub probe_budget_ms: u32,
	/// Wait for `Call Ready` after start-up
	pub ready_timeout_ms: u32,

	/// Gap between network registration polls
	pub registration_interval_ms: u32,
	/// Total time allowed for network registration
	pub registration_budget_ms: u32,

	/// PDP context used for the data bearer
	pub context_id: u8,
	/// If set, `AT+GMM` must report this model during initialisation
	pub expected_model: Option<String>,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Default for Config {
	fn default() -> Config {
		Config {
			baud: 115_200,
			rx_capacity: 512,
			line_capacity: 4_096,
			capture_capacity: 4_096,
			tick_ms: 17,
			settle_ms: 10,
			write_timeout_ms: 1_000,
			command_timeout_ms: 3_000,

			regulator_settle_ms: 2_000,
			power_key_low_ms: 2_000,
			power_key_high_ms: 1_000,
			power_off_ms: 500,
			probe_interval_ms: 500,
			probe_budget_ms: 5_000,
			ready_timeout_ms: 5_000,

			registration_interval_ms: 500,
			registration_budget_ms: 60_000,

			context_id: 1,
			expected_model: None,
		}
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
