use std::io::{self, Stdout, Write};

use pbr::{ProgressBar, Units};

/// Forwards writes to `inner`, advancing a progress bar by the bytes written.
pub struct ProgressBarReporter<W> {
    pb: ProgressBar<Stdout>,
    inner: W,
    written: u64,
}

impl<W: Write> ProgressBarReporter<W> {
    pub fn new(total_bytes: u64, inner: W) -> Self {
        let mut pb = ProgressBar::new(total_bytes);
        pb.set_units(Units::Bytes);
        pb.message("UF2 ");
        pb.show_speed = false;

        Self {
            pb,
            inner,
            written: 0,
        }
    }

    pub fn finish(&mut self) {
        self.pb
            .finish_println(&format!("Wrote {} bytes\n", self.written));
    }
}

impl<W: Write> Write for ProgressBarReporter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.written += written as u64;
        self.pb.add(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
