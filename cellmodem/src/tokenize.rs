//! # tokenize - Turning captured reply text into typed fields
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! Replies look like `+TAG: a,"b,c",3` spread over `\n` separated lines (the
//! transport has already stripped the carriage returns). Rather than
//! locating values by fixed offsets we find the line carrying a tag and split
//! the remainder into fields, honouring double quotes.

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The comma separated values following a reply tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fields<'a> {
	items: Vec<&'a str>,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// Iterate over the non-empty lines in `text`.
pub fn lines<'a>(text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
	text.split('\n').map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty())
}

/// The remainder of the first line that starts with `prefix`.
pub fn line_after<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
	lines(text).find(|l| l.starts_with(prefix)).map(|l| &l[prefix.len()..])
}

/// Like `line_after`, but only accepts a line that has been terminated by
/// `\n`, so a value still arriving isn't mistaken for a short one.
pub fn complete_line_after<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
	let mut rest = text;
	while let Some(end) = rest.find('\n') {
		let line = rest[..end].trim_end_matches('\r');
		if line.starts_with(prefix) {
			return Some(&line[prefix.len()..]);
		}
		rest = &rest[end + 1..];
	}
	None
}

/// Split `text` into fields at commas that are not inside double quotes.
pub fn fields(text: &str) -> Fields {
	let mut items = Vec::new();
	let mut in_quotes = false;
	let mut start = 0;
	for (idx, ch) in text.char_indices() {
		match ch {
			'"' => in_quotes = !in_quotes,
			',' if !in_quotes => {
				items.push(text[start..idx].trim());
				start = idx + 1;
			}
			_ => {}
		}
	}
	let last = text[start..].trim();
	if !last.is_empty() || !items.is_empty() {
		items.push(last);
	}
	Fields { items }
}

/// Parse the fields on the first line tagged `prefix`.
pub fn tagged<'a>(text: &'a str, prefix: &str) -> Option<Fields<'a>> {
	line_after(text, prefix).map(fields)
}

/// Parse a leading decimal integer (optionally signed), ignoring anything
/// after it. `"23 (x)"` gives 23.
pub fn leading_int(text: &str) -> Option<i64> {
	let text = text.trim_start();
	let mut end = 0;
	for (idx, ch) in text.char_indices() {
		if ch.is_ascii_digit() || (idx == 0 && (ch == '-' || ch == '+')) {
			end = idx + ch.len_utf8();
		} else {
			break;
		}
	}
	text[..end].parse().ok()
}

impl<'a> Fields<'a> {
	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// The raw text of field `index`, quotes included.
	pub fn raw(&self, index: usize) -> Option<&'a str> {
		self.items.get(index).cloned()
	}

	/// Field `index` with surrounding double quotes removed.
	pub fn text(&self, index: usize) -> Option<&'a str> {
		self.raw(index).map(|f| f.trim_matches('"'))
	}

	/// The final field with surrounding double quotes removed.
	pub fn last(&self) -> Option<&'a str> {
		self.items.last().map(|f| f.trim_matches('"'))
	}

	/// Field `index` parsed as a whole integer.
	pub fn int(&self, index: usize) -> Option<i64> {
		self.text(index).and_then(|f| f.parse().ok())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn finds_tagged_line() {
		let text = "\n+CREG: 0,1\n\nOK\n";
		assert_eq!(line_after(text, "+CREG: "), Some("0,1"));
		assert_eq!(line_after(text, "+CGREG: "), None);
	}

	#[test]
	fn complete_line_requires_terminator() {
		assert_eq!(complete_line_after("+QFOPEN: 12", "+QFOPEN: "), None);
		assert_eq!(complete_line_after("+QFOPEN: 12\n", "+QFOPEN: "), Some("12"));
	}

	#[test]
	fn quoted_commas_stay_in_field() {
		let f = fields(r#"0,"TCP","10.0.0.1",80,"a,b",2"#);
		assert_eq!(f.len(), 6);
		assert_eq!(f.text(1), Some("TCP"));
		assert_eq!(f.int(3), Some(80));
		assert_eq!(f.text(4), Some("a,b"));
		assert_eq!(f.int(5), Some(2));
		assert_eq!(f.int(1), None);
		assert_eq!(f.raw(9), None);
		assert_eq!(f.last(), Some("2"));
	}

	#[test]
	fn empty_input_has_no_fields() {
		assert!(fields("").is_empty());
		assert_eq!(fields(",").len(), 2);
	}

	#[test]
	fn leading_integers() {
		assert_eq!(leading_int("23"), Some(23));
		assert_eq!(leading_int(" 23\nOK"), Some(23));
		assert_eq!(leading_int("-1,2"), Some(-1));
		assert_eq!(leading_int("SIM not inserted"), None);
		assert_eq!(leading_int(""), None);
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
