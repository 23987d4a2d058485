use std::io::{Error as IOError, Write};

/// A sink for rendered content.
pub trait Output {
    fn write(&mut self, seg: &str) -> Result<(), IOError>;
}

/// Adapts any `io::Write` into an [`Output`].
pub struct WriteOutput<W: Write> {
    write: W,
}

impl<W: Write> Output for WriteOutput<W> {
    fn write(&mut self, seg: &str) -> Result<(), IOError> {
        self.write.write_all(seg.as_bytes())
    }
}

impl<W: Write> WriteOutput<W> {
    pub fn new(write: W) -> WriteOutput<W> {
        WriteOutput { write }
    }
}

/// Buffers rendered content in memory. Everything written is `&str`, so
/// the buffer is a `String` and conversion back is free.
pub struct StringOutput {
    buf: String,
}

impl Output for StringOutput {
    fn write(&mut self, seg: &str) -> Result<(), IOError> {
        self.buf.push_str(seg);
        Ok(())
    }
}

impl Default for StringOutput {
    fn default() -> StringOutput {
        StringOutput::new()
    }
}

impl StringOutput {
    pub fn new() -> StringOutput {
        StringOutput {
            buf: String::with_capacity(8 * 1024),
        }
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_string_output() {
        let mut out = StringOutput::new();
        out.write("hello").unwrap();
        out.write("world").unwrap();
        assert_eq!(out.into_string(), "helloworld");
    }

    #[test]
    fn test_write_output() {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut out = WriteOutput::new(&mut buf);
            out.write("hello").unwrap();
        }
        assert_eq!(buf, b"hello");
    }
}
