// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file primitives.

Repository metadata (`Release`, `Packages`, `Sources`) is expressed as
*control files*: paragraphs of `Name: value` fields separated by blank
lines, where continuation lines begin with a space. See
<https://www.debian.org/doc/debian-policy/ch-controlfields.html>.
*/

use {
    crate::error::{MirrorError, Result},
    std::io::BufRead,
};

/// A field in a control file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ControlField {
    name: String,
    value: String,
}

impl ControlField {
    /// Construct an instance from a field name and value.
    pub fn new(name: String, value: String) -> Self {
        Self { name, value }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Obtain the raw value, original formatting preserved.
    pub fn value_str(&self) -> &str {
        &self.value
    }

    /// Obtain an iterator of lines in the value.
    ///
    /// Leading whitespace from each line is stripped.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|x| x.trim_start())
    }

    /// Obtain an iterator of words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }
}

/// A paragraph in a control file.
///
/// An ordered series of control fields. Field names are case insensitive
/// on read.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
}

impl ControlParagraph {
    /// Whether the paragraph has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field, replacing any same-named field.
    pub fn set_field(&mut self, field: ControlField) {
        self.fields
            .retain(|f| !f.name.eq_ignore_ascii_case(&field.name));
        self.fields.push(field);
    }

    /// Obtain the field with a given name in this paragraph.
    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the value of a field, evaluated as a boolean.
    ///
    /// The field is [true] iff its string value is `yes`.
    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.field_str(name).map(|v| matches!(v, "yes"))
    }

    /// Obtain an iterator of words in the named field.
    pub fn field_iter_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_words())
    }

    /// Obtain an iterator of lines in the named field.
    pub fn field_iter_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_lines())
    }
}

/// Holds parsing state for control files.
///
/// Instances are fed lines of text and periodically emit [ControlParagraph]
/// instances as they are completed.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is
    /// returned. `Err` is returned if the control file is invalid.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let is_empty_line = line.trim().is_empty();
        let is_indented = line.starts_with(' ') && line.len() > 1;

        let current_field = self.field.take();

        // Empty lines signify the end of a paragraph. Flush any state.
        if is_empty_line {
            if let Some(field) = current_field {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (current_field, is_indented) {
            // A field on the stack and an unindented line: the beginning of
            // a new field. Flush the current one.
            (Some(v), false) => {
                self.flush_field(v)?;
                self.field = Some(line.to_string());

                Ok(None)
            }

            // A non-empty line with no field in progress: start of a field.
            (None, _) => {
                self.field = Some(line.to_string());

                Ok(None)
            }

            // A field on the stack and an indented line: a continuation.
            (Some(v), true) => {
                self.field = Some(v + line);

                Ok(None)
            }
        }
    }

    /// Finish parsing, consuming self.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let mut parts = v.splitn(2, ':');

        let name = parts.next().ok_or_else(|| {
            MirrorError::ControlParse(format!("error parsing line '{}'; missing colon", v))
        })?;
        let value = parts
            .next()
            .ok_or_else(|| {
                MirrorError::ControlParse(format!(
                    "error parsing field '{}'; could not detect value",
                    v
                ))
            })?
            .trim();

        self.paragraph
            .set_field(ControlField::new(name.to_string(), value.to_string()));

        Ok(())
    }
}

/// A reader of [ControlParagraph] instances.
///
/// Instances can be consumed as an iterator. Each call into the iterator
/// attempts to read a full paragraph from the underlying reader.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = self.parser.take().expect("parser should be present");

        loop {
            let mut line = String::new();

            let bytes_read = self.reader.read_line(&mut line)?;

            if bytes_read != 0 {
                if let Some(paragraph) = parser.write_line(&line)? {
                    self.parser.replace(parser);
                    return Ok(Some(paragraph));
                }
                // Continue reading.
            } else {
                return parser.finish();
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            None
        } else {
            match self.get_next() {
                Ok(Some(para)) => Some(Ok(para)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_single_paragraph() -> Result<()> {
        let data = "Package: foo\nVersion: 1.2-3\nSize: 42\n";
        let paragraphs = ControlParagraphReader::new(data.as_bytes())
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 1);
        let p = &paragraphs[0];
        assert_eq!(p.field_str("Package"), Some("foo"));
        assert_eq!(p.field_str("package"), Some("foo"));
        assert_eq!(p.field_str("Size"), Some("42"));
        assert!(p.field("Missing").is_none());

        Ok(())
    }

    #[test]
    fn parse_multiple_paragraphs() -> Result<()> {
        let data = "Package: foo\n\nPackage: bar\nDepends: foo\n\n\n";
        let paragraphs = ControlParagraphReader::new(data.as_bytes())
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[1].field_str("Package"), Some("bar"));

        Ok(())
    }

    #[test]
    fn parse_multiline_field() -> Result<()> {
        let data = "SHA256:\n aa11 100 main/binary-amd64/Packages\n bb22 50 main/binary-amd64/Packages.gz\nSuite: stable\n";
        let paragraphs = ControlParagraphReader::new(data.as_bytes())
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 1);
        let p = &paragraphs[0];

        let lines = p
            .field_iter_lines("SHA256")
            .unwrap()
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "aa11 100 main/binary-amd64/Packages",
                "bb22 50 main/binary-amd64/Packages.gz"
            ]
        );
        assert_eq!(p.field_str("Suite"), Some("stable"));

        Ok(())
    }

    #[test]
    fn field_words() -> Result<()> {
        let data = "Architectures: amd64 arm64 all\n";
        let paragraphs = ControlParagraphReader::new(data.as_bytes())
            .collect::<Result<Vec<_>>>()?;

        let words = paragraphs[0]
            .field_iter_words("Architectures")
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(words, vec!["amd64", "arm64", "all"]);

        Ok(())
    }

    #[test]
    fn invalid_line_is_error() {
        let data = "not a field line\n\n";
        let res = ControlParagraphReader::new(data.as_bytes()).collect::<Result<Vec<_>>>();
        assert!(res.is_err());
    }
}
