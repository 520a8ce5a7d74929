use std::fmt;
use std::io;

const INDENT_SIZE: usize = 4;

/// Wraps an [io::Write] for use as a [fmt::Write].
pub struct ToWriteFmt<T: io::Write>(pub T);

// Wraps a [fmt::Write] to prepend [str] to each line.
pub struct LinePrefixWrite<'a, W: fmt::Write>(W, &'a str, bool);

impl<T: io::Write> fmt::Write for ToWriteFmt<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl<'a, W: fmt::Write> LinePrefixWrite<'a, W> {
    pub fn new(inner: W, line_prefix: &'a str) -> Self {
        LinePrefixWrite(inner, line_prefix, true)
    }

    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: fmt::Write> fmt::Write for LinePrefixWrite<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if s.is_empty() {
            return Ok(());
        }
        if self.2 {
            self.0.write_str(self.1)?;
        }

        let mut split_iter = s.split_inclusive('\n').peekable();
        while let Some(substring) = split_iter.next() {
            self.0.write_str(substring)?;
            if split_iter.peek().is_some() {
                self.0.write_str(self.1)?;
            }
        }
        self.2 = s.ends_with('\n');
        Ok(())
    }
}

/// Generate a lowercase ASCII name from an index.
///
/// # Examples
/// ```
/// # use archlower::utils::ascii_name;
/// assert_eq!(ascii_name(0), "a");
/// assert_eq!(ascii_name(25), "z");
/// assert_eq!(ascii_name(26), "aa");
/// assert_eq!(ascii_name(27), "ab");
/// ```
pub fn ascii_name(idx: usize) -> String {
    let mut n = idx + 1;
    let mut characters: Vec<u8> = Vec::with_capacity(2);
    while n > 0 {
        let q = (n - 1) / 26;
        let r = ((n - 1) % 26) as u8;
        characters.push(b'a' + r);
        n = q;
    }
    characters.reverse();
    characters.into_iter().map(char::from).collect()
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_line_prefix_comments_out_a_table() {
        let mut write = LinePrefixWrite::new(String::new(), "// ");
        write!(write, "Step | Operator").unwrap();
        write!(write, "\n---- | --------\n").unwrap();
        writeln!(write, "0    | relu").unwrap();
        assert_eq!(
            write.into_inner(),
            "// Step | Operator\n// ---- | --------\n// 0    | relu\n"
        );
    }

    #[test]
    fn test_line_prefix_skips_empty_writes() {
        let mut write = LinePrefixWrite::new(String::new(), "# ");
        write!(write, "").unwrap();
        write!(write, "A").unwrap();
        assert_eq!(write.into_inner(), "# A");
    }

    #[test]
    fn test_join_and_indent() {
        assert_eq!(join_into_string([3, 32, 32], "x"), "3x32x32");
        assert_eq!(format!("{}relu", indent(2)), "        relu");
    }

    #[test]
    fn test_ascii_name_rolls_over_to_two_characters() {
        assert_eq!(ascii_name(1), "b");
        assert_eq!(ascii_name(26 + 25), "az");
        assert_eq!(ascii_name(26 * 2), "ba");
    }
}
