use std::io::{self, Write};

/// Renders color changes as `<green-bold>`-style markers so colored output
/// can be asserted as plain text.
#[derive(Debug, Default)]
pub struct TaggedColorWriter(Vec<u8>);

impl TaggedColorWriter {
    pub fn into_string(self) -> String {
        String::from_utf8(self.0).unwrap()
    }
}

impl io::Write for TaggedColorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl termcolor::WriteColor for TaggedColorWriter {
    fn supports_color(&self) -> bool {
        true
    }

    fn set_color(&mut self, spec: &termcolor::ColorSpec) -> io::Result<()> {
        use termcolor::Color::*;
        let mut parts = vec![];
        if let Some(color) = spec.fg() {
            parts.push(match color {
                Green => "green",
                Red => "red",
                Yellow => "yellow",
                Blue => "blue",
                Cyan => "cyan",
                Magenta => "magenta",
                _ => "other",
            });
        }
        if spec.bold() {
            parts.push("bold");
        }
        write!(&mut self.0, "<{}>", parts.join("-"))
    }

    fn reset(&mut self) -> io::Result<()> {
        write!(&mut self.0, "<reset>")
    }
}
