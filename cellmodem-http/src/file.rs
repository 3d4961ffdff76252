//! # file - The module's own file system
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! Files live in the module's UFS or RAM storage (`RAM:name`). The module
//! hands out an integer handle on open; we keep a table of what is open so
//! a handle can be checked before use and a file can be closed by name
//! before it is deleted.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::cmp;
use std::fmt;

use multi_map::MultiMap;

use cellmodem::tokenize;
use cellmodem::Modem;

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Largest chunk we ask the module for in one `AT+QFREAD`. Keeps the
/// `CONNECT` header and payload inside the raw capture.
pub const MAX_READ_LEN: usize = 1_024;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A handle from `AT+QFOPEN`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(pub i32);

/// Free and total bytes in one storage area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StorageSpace {
	pub free: u64,
	pub total: u64,
}

/// All possible errors from the file operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileError {
	/// The exchange with the module failed
	IOError(cellmodem::Error),
	/// The given handle was not recognised
	BadHandle,
	/// A reply arrived but couldn't be picked apart
	Malformed,
	/// The module stored fewer bytes than we sent
	ShortWrite,
}

/// Remembers which files are open, by handle and by name.
pub struct FileStore {
	open: MultiMap<FileHandle, String, OpenFile>,
}

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

#[derive(Debug)]
struct OpenFile {
	handle: FileHandle,
	read_only: bool,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const FILE_TIMEOUT_MS: u32 = 3_000;
const DATA_TIMEOUT_MS: u32 = 5_000;
/// Open the file, creating it if it doesn't exist
const MODE_OPEN: u8 = 0;
/// Create the file, throwing away any existing content
const MODE_OVERWRITE: u8 = 1;
const MODE_READ_ONLY: u8 = 2;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl FileHandle {
	/// Never handed out by the module.
	pub const INVALID: FileHandle = FileHandle(-1);

	pub fn is_valid(self) -> bool {
		self != FileHandle::INVALID
	}
}

impl FileStore {
	pub fn new() -> FileStore {
		FileStore {
			open: MultiMap::new(),
		}
	}

	/// Open `name` for reading and writing. With `overwrite` set any existing
	/// content is discarded. Opening a file that's already open gives back
	/// the existing handle.
	pub fn open(
		&mut self,
		modem: &mut Modem,
		name: &str,
		overwrite: bool,
	) -> Result<FileHandle, FileError> {
		let mode = if overwrite { MODE_OVERWRITE } else { MODE_OPEN };
		self.open_mode(modem, name, mode)
	}

	/// Open `name` without write access.
	pub fn open_read_only(
		&mut self,
		modem: &mut Modem,
		name: &str,
	) -> Result<FileHandle, FileError> {
		self.open_mode(modem, name, MODE_READ_ONLY)
	}

	/// Read up to `buf.len()` bytes, capped at `MAX_READ_LEN`, from the
	/// current position. Returns 0 at the end of the file.
	pub fn read(
		&mut self,
		modem: &mut Modem,
		handle: FileHandle,
		buf: &mut [u8],
	) -> Result<usize, FileError> {
		self.check(handle)?;
		if buf.is_empty() {
			return Ok(0);
		}
		let want = cmp::min(buf.len(), MAX_READ_LEN);
		let transport = modem.transport_mut();
		transport.send_command(&format!("AT+QFREAD={},{}", handle.0, want))?;
		if transport.await_any(&["CONNECT ", "ERROR"], DATA_TIMEOUT_MS)? != 0 {
			return Err(FileError::IOError(error_from(modem)));
		}
		let line = transport.await_line("CONNECT ", DATA_TIMEOUT_MS)?;
		let len = tokenize::leading_int(&line).ok_or(FileError::Malformed)? as usize;
		let len = cmp::min(len, want);
		if len == 0 {
			return Ok(0);
		}
		let start =
			crate::after_line(transport.capture(), b"CONNECT ").ok_or(FileError::Malformed)?;
		transport.await_capture(start + len, DATA_TIMEOUT_MS)?;
		buf[..len].copy_from_slice(&transport.capture()[start..start + len]);
		trace!("Read {} bytes from {:?}", len, handle);
		Ok(len)
	}

	/// Write all of `data` at the current position.
	pub fn write(
		&mut self,
		modem: &mut Modem,
		handle: FileHandle,
		data: &[u8],
	) -> Result<usize, FileError> {
		if self.check(handle)?.read_only {
			return Err(FileError::BadHandle);
		}
		if data.is_empty() {
			return Ok(0);
		}
		modem.send_and_check(
			&format!("AT+QFWRITE={},{}", handle.0, data.len()),
			"CONNECT",
			DATA_TIMEOUT_MS,
		)?;
		let transport = modem.transport_mut();
		transport.send_raw(data)?;
		let line = transport.await_line("+QFWRITE: ", DATA_TIMEOUT_MS)?;
		let written = tokenize::fields(&line).int(0).ok_or(FileError::Malformed)? as usize;
		if written < data.len() {
			warn!("Only {} of {} bytes written to {:?}", written, data.len(), handle);
			return Err(FileError::ShortWrite);
		}
		Ok(written)
	}

	/// Move to `offset` bytes from the start of the file.
	pub fn seek(
		&mut self,
		modem: &mut Modem,
		handle: FileHandle,
		offset: u64,
	) -> Result<(), FileError> {
		self.check(handle)?;
		modem.send_expect_ok(&format!("AT+QFSEEK={},{},0", handle.0, offset), FILE_TIMEOUT_MS)?;
		Ok(())
	}

	/// The current offset from the start of the file.
	pub fn position(&mut self, modem: &mut Modem, handle: FileHandle) -> Result<u64, FileError> {
		self.check(handle)?;
		modem.send_expect_ok(&format!("AT+QFPOSITION={}", handle.0), FILE_TIMEOUT_MS)?;
		let text = modem.transport().text();
		let offset = tokenize::tagged(&text, "+QFPOSITION: ")
			.and_then(|f| f.int(0))
			.ok_or(FileError::Malformed)?;
		Ok(offset as u64)
	}

	/// Cut the file off at the current position.
	pub fn truncate(&mut self, modem: &mut Modem, handle: FileHandle) -> Result<(), FileError> {
		self.check(handle)?;
		modem.send_expect_ok(&format!("AT+QFTUCAT={}", handle.0), FILE_TIMEOUT_MS)?;
		Ok(())
	}

	/// Close the file. The handle is forgotten even if the module objects.
	pub fn close(&mut self, modem: &mut Modem, handle: FileHandle) -> Result<(), FileError> {
		self.check(handle)?;
		self.open.remove(&handle);
		modem.send_expect_ok(&format!("AT+QFCLOSE={}", handle.0), FILE_TIMEOUT_MS)?;
		debug!("Closed {:?}", handle);
		Ok(())
	}

	/// Delete `name`, closing it first if it's open.
	pub fn delete(&mut self, modem: &mut Modem, name: &str) -> Result<(), FileError> {
		if let Some(handle) = self.handle_for(name) {
			if let Err(e) = self.close(modem, handle) {
				warn!("Closing {} before delete failed: {}", name, e);
			}
		}
		modem.send_expect_ok(&format!("AT+QFDEL=\"{}\"", name), FILE_TIMEOUT_MS)?;
		debug!("Deleted {}", name);
		Ok(())
	}

	/// Free and total space in `storage` (`UFS`, `RAM` ...).
	pub fn list(&mut self, modem: &mut Modem, storage: &str) -> Result<StorageSpace, FileError> {
		modem.send_expect_ok(&format!("AT+QFLDS=\"{}\"", storage), FILE_TIMEOUT_MS)?;
		let text = modem.transport().text();
		let fields = tokenize::tagged(&text, "+QFLDS: ").ok_or(FileError::Malformed)?;
		match (fields.int(0), fields.int(1)) {
			(Some(free), Some(total)) => Ok(StorageSpace {
				free: free as u64,
				total: total as u64,
			}),
			_ => Err(FileError::Malformed),
		}
	}

	/// The handle `name` is open under, if it is.
	pub fn handle_for(&self, name: &str) -> Option<FileHandle> {
		self.open.get_alt(&name.to_string()).map(|f| f.handle)
	}

	pub fn is_open(&self, handle: FileHandle) -> bool {
		self.open.contains_key(&handle)
	}
}

impl Default for FileStore {
	fn default() -> FileStore {
		FileStore::new()
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl FileStore {
	fn open_mode(
		&mut self,
		modem: &mut Modem,
		name: &str,
		mode: u8,
	) -> Result<FileHandle, FileError> {
		if let Some(handle) = self.handle_for(name) {
			debug!("{} is already open as {:?}", name, handle);
			return Ok(handle);
		}
		modem.send_expect_ok(&format!("AT+QFOPEN=\"{}\",{}", name, mode), FILE_TIMEOUT_MS)?;
		let text = modem.transport().text();
		let handle = tokenize::tagged(&text, "+QFOPEN: ")
			.and_then(|f| f.int(0))
			.map(|h| FileHandle(h as i32))
			.ok_or(FileError::Malformed)?;
		if !handle.is_valid() {
			return Err(FileError::Malformed);
		}
		debug!("Opened {} as {:?}", name, handle);
		self.open.insert(
			handle,
			name.to_string(),
			OpenFile {
				handle,
				read_only: mode == MODE_READ_ONLY,
			},
		);
		Ok(handle)
	}

	fn check(&self, handle: FileHandle) -> Result<&OpenFile, FileError> {
		self.open.get(&handle).ok_or(FileError::BadHandle)
	}
}

/// Classify the reply just collected as the error it must be.
fn error_from(modem: &mut Modem) -> cellmodem::Error {
	modem.classify_result().err().unwrap_or(cellmodem::Error::Malformed)
}

impl fmt::Display for FileError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			FileError::IOError(ref e) => write!(f, "{}", e),
			FileError::BadHandle => write!(f, "unknown file handle"),
			FileError::Malformed => write!(f, "malformed reply"),
			FileError::ShortWrite => write!(f, "short write"),
		}
	}
}

/// Wrap modem errors into FileErrors easily
impl From<cellmodem::Error> for FileError {
	fn from(e: cellmodem::Error) -> FileError {
		FileError::IOError(e)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_modem;

	#[test]
	fn open_write_read_close() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"log.txt\",1", "\r\n+QFOPEN: 12\r\n\r\nOK\r\n");
		port.expect("AT+QFWRITE=12,5", "\r\nCONNECT\r\n");
		port.expect_data(b"hello", b"\r\n+QFWRITE: 5,5\r\n\r\nOK\r\n");
		port.expect("AT+QFSEEK=12,0,0", "\r\nOK\r\n");
		port.expect("AT+QFREAD=12,8", "\r\nCONNECT 5\r\nhello\r\nOK\r\n");
		port.expect("AT+QFPOSITION=12", "\r\n+QFPOSITION: 5\r\n\r\nOK\r\n");
		port.expect("AT+QFCLOSE=12", "\r\nOK\r\n");

		let h = files.open(&mut m, "log.txt", true).unwrap();
		assert_eq!(h, FileHandle(12));
		assert_eq!(files.handle_for("log.txt"), Some(h));
		assert_eq!(files.write(&mut m, h, b"hello"), Ok(5));
		assert_eq!(files.seek(&mut m, h, 0), Ok(()));
		let mut buf = [0u8; 8];
		assert_eq!(files.read(&mut m, h, &mut buf), Ok(5));
		assert_eq!(&buf[..5], b"hello");
		assert_eq!(files.position(&mut m, h), Ok(5));
		assert_eq!(files.close(&mut m, h), Ok(()));
		assert!(!files.is_open(h));
		assert_eq!(files.read(&mut m, h, &mut buf), Err(FileError::BadHandle));
	}

	#[test]
	fn large_read_is_capped() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		let payload = vec![b'x'; MAX_READ_LEN];
		let mut reply = format!("\r\nCONNECT {}\r\n", MAX_READ_LEN).into_bytes();
		reply.extend_from_slice(&payload);
		reply.extend_from_slice(b"\r\nOK\r\n");
		port.expect("AT+QFOPEN=\"big\",2", "\r\n+QFOPEN: 3\r\n\r\nOK\r\n");
		port.expect_data(format!("AT+QFREAD=3,{}\r\n", MAX_READ_LEN).as_bytes(), &reply);
		let h = files.open_read_only(&mut m, "big").unwrap();
		let mut buf = vec![0u8; 5_000];
		assert_eq!(files.read(&mut m, h, &mut buf), Ok(MAX_READ_LEN));
		assert_eq!(&buf[..MAX_READ_LEN], &payload[..]);
		assert_eq!(port.count("AT+QFREAD=3,"), 1);
	}

	#[test]
	fn read_at_end_of_file() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"a\",2", "\r\n+QFOPEN: 3\r\n\r\nOK\r\n");
		port.expect("AT+QFREAD=3,4", "\r\nCONNECT 0\r\n\r\nOK\r\n");
		let h = files.open_read_only(&mut m, "a").unwrap();
		let mut buf = [0u8; 4];
		assert_eq!(files.read(&mut m, h, &mut buf), Ok(0));
	}

	#[test]
	fn read_only_handles_refuse_writes() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"a\",2", "\r\n+QFOPEN: 3\r\n\r\nOK\r\n");
		let h = files.open_read_only(&mut m, "a").unwrap();
		assert_eq!(files.write(&mut m, h, b"x"), Err(FileError::BadHandle));
		assert_eq!(port.count("AT+QFWRITE"), 0);
	}

	#[test]
	fn short_write_is_reported() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"a\",0", "\r\n+QFOPEN: 4\r\n\r\nOK\r\n");
		port.expect("AT+QFWRITE=4,4", "\r\nCONNECT\r\n");
		port.expect_data(b"abcd", b"\r\n+QFWRITE: 2,2\r\n\r\nOK\r\n");
		let h = files.open(&mut m, "a", false).unwrap();
		assert_eq!(files.write(&mut m, h, b"abcd"), Err(FileError::ShortWrite));
	}

	#[test]
	fn unknown_handle_sends_nothing() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		assert_eq!(files.seek(&mut m, FileHandle(9), 0), Err(FileError::BadHandle));
		assert_eq!(files.truncate(&mut m, FileHandle::INVALID), Err(FileError::BadHandle));
		assert!(port.commands().is_empty());
	}

	#[test]
	fn open_failure_keeps_cme_code() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"x\",0", "\r\n+CME ERROR: 4010\r\n");
		assert_eq!(
			files.open(&mut m, "x", false),
			Err(FileError::IOError(cellmodem::Error::Protocol(Some(4010))))
		);
		assert_eq!(m.last_error(), Some(4010));
		assert_eq!(files.handle_for("x"), None);
	}

	#[test]
	fn reopening_returns_same_handle() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"a\",0", "\r\n+QFOPEN: 7\r\n\r\nOK\r\n");
		let first = files.open(&mut m, "a", false).unwrap();
		let second = files.open(&mut m, "a", false).unwrap();
		assert_eq!(first, second);
		assert_eq!(port.count("AT+QFOPEN"), 1);
	}

	#[test]
	fn delete_closes_open_file_first() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFOPEN=\"RAM:x\",1", "\r\n+QFOPEN: 5\r\n\r\nOK\r\n");
		port.expect("AT+QFTUCAT=5", "\r\nOK\r\n");
		port.expect("AT+QFCLOSE=5", "\r\nOK\r\n");
		port.expect("AT+QFDEL=\"RAM:x\"", "\r\nOK\r\n");
		let h = files.open(&mut m, "RAM:x", true).unwrap();
		assert_eq!(files.truncate(&mut m, h), Ok(()));
		assert_eq!(files.delete(&mut m, "RAM:x"), Ok(()));
		assert!(!files.is_open(h));
		assert_eq!(
			port.commands(),
			vec![
				"AT+QFOPEN=\"RAM:x\",1",
				"AT+QFTUCAT=5",
				"AT+QFCLOSE=5",
				"AT+QFDEL=\"RAM:x\"",
			]
		);
	}

	#[test]
	fn storage_space() {
		let (mut m, port, _) = test_modem();
		let mut files = FileStore::new();
		port.expect("AT+QFLDS=\"RAM\"", "\r\n+QFLDS: 102400,524288\r\n\r\nOK\r\n");
		assert_eq!(
			files.list(&mut m, "RAM"),
			Ok(StorageSpace {
				free: 102_400,
				total: 524_288,
			})
		);
		port.expect("AT+QFLDS=\"UFS\"", "\r\nOK\r\n");
		assert_eq!(files.list(&mut m, "UFS"), Err(FileError::Malformed));
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
