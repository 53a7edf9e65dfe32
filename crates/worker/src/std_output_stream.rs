use std::{
    io::Write as _,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

/// Destination of a worker's stdout or stderr.
#[derive(Clone, Debug)]
pub enum StdOutput {
    Stdout,
    Stderr,
    /// Collects the output in memory.
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl StdOutput {
    #[must_use]
    pub fn buffer() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::default();
        (Self::Buffer(Arc::clone(&buffer)), buffer)
    }

    fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            StdOutput::Stdout => std::io::stdout().write_all(buf),
            StdOutput::Stderr => std::io::stderr().write_all(buf),
            StdOutput::Buffer(buffer) => {
                buffer.lock().unwrap().extend_from_slice(buf);
                Ok(())
            }
        }
    }
}

/// Writes to a [`StdOutput`], prefixing every line with the worker id.
#[derive(Clone, Debug)]
pub struct LogStream {
    output: StdOutput,
    state: Arc<LogStreamState>,
}

#[derive(Debug)]
struct LogStreamState {
    prefix: String,
    needs_prefix_on_next_write: AtomicBool,
}

impl LogStream {
    #[must_use]
    pub fn new(prefix: String, output: StdOutput) -> LogStream {
        LogStream {
            output,
            state: Arc::new(LogStreamState {
                prefix,
                needs_prefix_on_next_write: AtomicBool::new(true),
            }),
        }
    }

    pub fn write_all(&self, mut bytes: &[u8]) -> std::io::Result<()> {
        while !bytes.is_empty() {
            if self
                .state
                .needs_prefix_on_next_write
                .swap(false, Ordering::Relaxed)
            {
                self.output.write_all(self.state.prefix.as_bytes())?;
            }
            if let Some(i) = bytes.iter().position(|b| *b == b'\n') {
                let (line, rest) = bytes.split_at(i + 1);
                bytes = rest;
                self.output.write_all(line)?;
                self.state
                    .needs_prefix_on_next_write
                    .store(true, Ordering::Relaxed);
            } else {
                self.output.write_all(bytes)?;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_line_is_prefixed() {
        let (output, buffer) = StdOutput::buffer();
        let stream = LogStream::new("[w] ".to_string(), output);
        stream.write_all(b"first\nsec").unwrap();
        stream.write_all(b"ond\n").unwrap();
        stream.write_all(b"third").unwrap();
        assert_eq!(
            "[w] first\n[w] second\n[w] third",
            String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
        );
    }
}
