//! Tab-delimited text codec shared by values, events and store records.
//!
//! A stream is a sequence of fields, each terminated by a TAB. Names and
//! string payloads are escaped before they ever reach a stream, so a field
//! never contains a raw TAB or NEWLINE.
//!
//! Escaping is one-way. `\t` in stored text may have been a real tab or the
//! two characters `\` `t` typed by the caller; the stored form is all that is
//! kept. Escaping already escaped text is the identity, which is what makes
//! serialize/deserialize round trips stable.

use std::borrow::Cow;
use std::str::FromStr;

use crate::error::{AnalyticsError, Result};

/// Separator between fields of a serialized record.
pub const FIELD_SEPARATOR: char = '\t';

/// Separator between records of a store file.
pub const RECORD_SEPARATOR: char = '\n';

/// Replace control characters with printable two-character sequences.
///
/// Common whitespace controls use backslash notation (`\t`, `\n`, ...);
/// every other C0 control and DEL use caret notation (`^A`, `^?`).
pub fn escape(input: &str) -> Cow<'_, str> {
    if !input.chars().any(|c| c.is_ascii_control()) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 8);
    for c in input.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0B}' => out.push_str("\\v"),
            '\u{0C}' => out.push_str("\\f"),
            '\u{7F}' => out.push_str("^?"),
            c if (c as u32) < 0x20 => {
                out.push('^');
                out.push(char::from(b'@' + c as u8));
            }
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Append `field` followed by the separator.
pub fn write_field(out: &mut String, field: &str) {
    debug_assert!(
        !field.contains(FIELD_SEPARATOR) && !field.contains(RECORD_SEPARATOR),
        "unescaped separator in field"
    );
    out.push_str(field);
    out.push(FIELD_SEPARATOR);
}

/// Append the `Display` form of `value` followed by the separator.
pub fn write_display(out: &mut String, value: impl std::fmt::Display) {
    use std::fmt::Write;
    let _ = write!(out, "{}{}", value, FIELD_SEPARATOR);
}

/// Cursor over the fields of a serialized record.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    rest: &'a str,
}

impl<'a> FieldReader<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    /// Whether every field has been consumed.
    pub fn is_at_end(&self) -> bool {
        self.rest.is_empty()
    }

    /// Take the next field, or `None` at end of stream.
    ///
    /// A trailing field without a terminating separator is still returned.
    pub fn next_field(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.find(FIELD_SEPARATOR) {
            Some(idx) => {
                let field = &self.rest[..idx];
                self.rest = &self.rest[idx + FIELD_SEPARATOR.len_utf8()..];
                Some(field)
            }
            None => {
                let field = self.rest;
                self.rest = "";
                Some(field)
            }
        }
    }

    /// Take the next field, failing if the stream ended early.
    pub fn expect_field(&mut self, what: &str) -> Result<&'a str> {
        self.next_field().ok_or_else(|| {
            AnalyticsError::Deserialization(format!("unexpected end of stream reading {}", what))
        })
    }

    /// Take the next field and parse it.
    pub fn parse_field<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let field = self.expect_field(what)?;
        field.parse::<T>().map_err(|_| {
            AnalyticsError::Deserialization(format!("malformed {}: {:?}", what, field))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_passthrough_borrows() {
        let s = "plain text with spaces";
        assert!(matches!(escape(s), Cow::Borrowed(_)));
    }

    #[test]
    fn test_escape_backslash_forms() {
        assert_eq!(escape("a\tb"), "a\\tb");
        assert_eq!(escape("line\nbreak\r"), "line\\nbreak\\r");
        assert_eq!(escape("\u{07}\u{08}\u{0B}\u{0C}"), "\\a\\b\\v\\f");
    }

    #[test]
    fn test_escape_caret_forms() {
        assert_eq!(escape("\u{01}"), "^A");
        assert_eq!(escape("\u{00}x\u{1F}"), "^@x^_");
        assert_eq!(escape("\u{7F}"), "^?");
    }

    #[test]
    fn test_escape_is_one_way_and_stable() {
        let once = escape("tab\there").into_owned();
        // The typed two-character sequence and the real tab end up identical.
        assert_eq!(once, escape("tab\\there"));
        assert_eq!(escape(&once), once);
    }

    #[test]
    fn test_field_reader_sequence() {
        let mut reader = FieldReader::new("a\t\tc\tlast");
        assert_eq!(reader.next_field(), Some("a"));
        assert_eq!(reader.next_field(), Some(""));
        assert_eq!(reader.next_field(), Some("c"));
        assert_eq!(reader.next_field(), Some("last"));
        assert_eq!(reader.next_field(), None);
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_field_reader_empty_stream() {
        let mut reader = FieldReader::new("");
        assert!(reader.is_at_end());
        assert!(reader.expect_field("type").is_err());
    }

    #[test]
    fn test_parse_field_errors() {
        let mut reader = FieldReader::new("12\tnope\t");
        assert_eq!(reader.parse_field::<u64>("timestamp").unwrap(), 12);
        let err = reader.parse_field::<u64>("timestamp").unwrap_err();
        assert!(matches!(err, AnalyticsError::Deserialization(_)));
    }

    #[test]
    fn test_write_helpers() {
        let mut out = String::new();
        write_field(&mut out, "name");
        write_display(&mut out, 42u64);
        assert_eq!(out, "name\t42\t");
    }
}
