//! Outbound byte-rate limiting for the send path of an association.
use std::io::Write;
use std::time::{Duration, Instant};

/// A writer adapter which paces the bytes written through it
/// so that the average rate stays at or below a configured
/// number of bytes per second.
///
/// Without a rate, the adapter is a transparent passthrough.
/// Pacing is applied after each write:
/// when the bytes written so far run ahead of the configured rate,
/// the writing thread sleeps for the difference.
#[derive(Debug)]
pub struct ThrottledWriter<W> {
    inner: W,
    bytes_per_second: Option<u32>,
    started: Instant,
    written: u64,
}

impl<W> ThrottledWriter<W>
where
    W: Write,
{
    /// Create a new throttled writer over `inner`.
    ///
    /// `bytes_per_second` of `None` (or zero) disables pacing.
    pub fn new(inner: W, bytes_per_second: Option<u32>) -> Self {
        ThrottledWriter {
            inner,
            bytes_per_second: bytes_per_second.filter(|rate| *rate > 0),
            started: Instant::now(),
            written: 0,
        }
    }

    fn pace(&mut self) {
        if let Some(rate) = self.bytes_per_second {
            let expected = Duration::from_secs_f64(self.written as f64 / rate as f64);
            let elapsed = self.started.elapsed();
            if expected > elapsed {
                std::thread::sleep(expected - elapsed);
            }
        }
    }
}

impl<W> Write for ThrottledWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.pace();
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::ThrottledWriter;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn passthrough_without_rate() {
        let mut sink = Vec::new();
        let mut writer = ThrottledWriter::new(&mut sink, None);
        writer.write_all(&[5; 4096]).unwrap();
        assert_eq!(sink.len(), 4096);
    }

    #[test]
    fn paces_to_configured_rate() {
        let mut sink = Vec::new();
        // 40 kB/s, 2 kB payload: should take at least ~50 ms
        let started = Instant::now();
        let mut writer = ThrottledWriter::new(&mut sink, Some(40_000));
        writer.write_all(&[1; 2_000]).unwrap();
        assert!(started.elapsed().as_millis() >= 40);
        assert_eq!(sink.len(), 2_000);
    }
}
