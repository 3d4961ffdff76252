//! # ring - Fixed capacity byte queue between the receive path and the
//! protocol engine.
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! There is exactly one writer (whatever delivers received bytes) and one
//! reader (the transport draining between polls). Both indices wrap the same
//! way, and `used` is what tells a full buffer from an empty one when
//! `head == tail`.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::fmt;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A circular byte queue with a capacity fixed at construction.
pub struct RingBuffer {
	data: Box<[u8]>,
	/// Next slot to write
	head: usize,
	/// Next slot to read
	tail: usize,
	/// Bytes currently queued. Always `(head - tail) mod capacity`, except
	/// that a full buffer has `head == tail` and `used == capacity`.
	used: usize,
}

/// Why a ring buffer operation could not be performed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingError {
	/// `put` on a buffer with no free space
	Full,
	/// `get` on a buffer with nothing queued
	Empty,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl RingBuffer {
	/// Create an empty buffer. A zero capacity is bumped to one so the modulo
	/// arithmetic stays defined.
	pub fn new(capacity: usize) -> RingBuffer {
		let capacity = if capacity == 0 { 1 } else { capacity };
		RingBuffer {
			data: vec![0u8; capacity].into_boxed_slice(),
			head: 0,
			tail: 0,
			used: 0,
		}
	}

	/// Append one byte at the head.
	pub fn put(&mut self, byte: u8) -> Result<(), RingError> {
		if self.used == self.capacity() {
			return Err(RingError::Full);
		}
		self.data[self.head] = byte;
		self.head = self.advance(self.head);
		self.used += 1;
		Ok(())
	}

	/// Remove one byte from the tail.
	pub fn get(&mut self) -> Result<u8, RingError> {
		if self.used == 0 {
			return Err(RingError::Empty);
		}
		let byte = self.data[self.tail];
		self.tail = self.advance(self.tail);
		self.used -= 1;
		Ok(byte)
	}

	/// Number of bytes waiting to be read.
	pub fn available(&self) -> usize {
		self.used
	}

	pub fn free_space(&self) -> usize {
		self.capacity() - self.used
	}

	pub fn capacity(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.used == 0
	}

	pub fn is_full(&self) -> bool {
		self.used == self.capacity()
	}

	/// Throw away everything queued. Called before each new command so that
	/// stale bytes from the previous exchange can't satisfy the next wait.
	pub fn reset(&mut self) {
		self.head = 0;
		self.tail = 0;
		self.used = 0;
	}

	/// Move up to `out.len()` bytes into `out`, returning how many moved.
	pub fn read_into(&mut self, out: &mut [u8]) -> usize {
		let mut count = 0;
		while count < out.len() {
			match self.get() {
				Ok(byte) => {
					out[count] = byte;
					count += 1;
				}
				Err(_) => break,
			}
		}
		count
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl RingBuffer {
	fn advance(&self, index: usize) -> usize {
		(index + 1) % self.capacity()
	}
}

impl fmt::Debug for RingBuffer {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"RingBuffer {{ capacity: {}, head: {}, tail: {}, used: {} }}",
			self.capacity(),
			self.head,
			self.tail,
			self.used
		)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use rand::Rng;
	use std::collections::VecDeque;

	#[test]
	fn fifo_order() {
		let mut r = RingBuffer::new(8);
		for b in b"hello" {
			r.put(*b).unwrap();
		}
		assert_eq!(r.available(), 5);
		assert_eq!(r.free_space(), 3);
		let mut out = Vec::new();
		while let Ok(b) = r.get() {
			out.push(b);
		}
		assert_eq!(out, b"hello");
		assert!(r.is_empty());
	}

	#[test]
	fn put_fails_exactly_when_full() {
		let mut r = RingBuffer::new(4);
		for i in 0..4 {
			assert!(r.put(i).is_ok());
		}
		assert!(r.is_full());
		assert_eq!(r.put(99), Err(RingError::Full));
		assert_eq!(r.get(), Ok(0));
		assert!(r.put(4).is_ok());
		assert_eq!(r.put(5), Err(RingError::Full));
	}

	#[test]
	fn get_fails_when_empty() {
		let mut r = RingBuffer::new(3);
		assert_eq!(r.get(), Err(RingError::Empty));
		r.put(7).unwrap();
		assert_eq!(r.get(), Ok(7));
		assert_eq!(r.get(), Err(RingError::Empty));
	}

	#[test]
	fn reset_discards_content() {
		let mut r = RingBuffer::new(4);
		r.put(1).unwrap();
		r.put(2).unwrap();
		r.get().unwrap();
		r.reset();
		assert_eq!(r.available(), 0);
		assert_eq!(r.free_space(), 4);
		assert_eq!(r.get(), Err(RingError::Empty));
		// Still usable to full capacity afterwards
		for i in 0..4 {
			r.put(i).unwrap();
		}
		assert_eq!(r.put(4), Err(RingError::Full));
	}

	#[test]
	fn wraparound_on_both_indices() {
		let mut r = RingBuffer::new(3);
		// Walk head and tail round the buffer several times at every fill
		// level.
		let mut next = 0u8;
		let mut expect = 0u8;
		for fill in 1..=3 {
			for _ in 0..10 {
				for _ in 0..fill {
					r.put(next).unwrap();
					next = next.wrapping_add(1);
				}
				assert_eq!(r.available(), fill);
				for _ in 0..fill {
					assert_eq!(r.get(), Ok(expect));
					expect = expect.wrapping_add(1);
				}
				assert!(r.is_empty());
			}
		}
	}

	#[test]
	fn read_into_partial() {
		let mut r = RingBuffer::new(4);
		r.put(b'a').unwrap();
		r.put(b'b').unwrap();
		let mut out = [0u8; 4];
		assert_eq!(r.read_into(&mut out), 2);
		assert_eq!(&out[..2], b"ab");
	}

	#[test]
	fn zero_capacity_is_usable() {
		let mut r = RingBuffer::new(0);
		assert_eq!(r.capacity(), 1);
		r.put(1).unwrap();
		assert_eq!(r.put(2), Err(RingError::Full));
	}

	#[test]
	fn random_sequences_match_a_queue() {
		let mut rng = rand::thread_rng();
		for _ in 0..50 {
			let capacity = rng.gen_range(1, 17);
			let mut r = RingBuffer::new(capacity);
			let mut model = VecDeque::new();
			for _ in 0..500 {
				if rng.gen::<bool>() {
					let b = rng.gen::<u8>();
					let result = r.put(b);
					if model.len() == capacity {
						assert_eq!(result, Err(RingError::Full));
					} else {
						assert!(result.is_ok());
						model.push_back(b);
					}
				} else {
					match model.pop_front() {
						Some(b) => assert_eq!(r.get(), Ok(b)),
						None => assert_eq!(r.get(), Err(RingError::Empty)),
					}
				}
				assert_eq!(r.available(), model.len());
				assert_eq!(r.free_space(), capacity - model.len());
			}
		}
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
