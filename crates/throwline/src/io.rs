use std::io::{self, Write as _};

/// Sink for the engine's diagnostic stream.
///
/// The engine writes here only on its fatal paths (an exhausted search for a
/// non-termination exception, a dangling exception reference, an
/// out-of-memory raise before initialization). The default implementation
/// [`StdDiagnostics`] writes to stderr.
pub trait DiagnosticWriter {
    /// Writes one line of diagnostic output, without the trailing newline.
    fn write_line(&mut self, line: &str);
}

impl<W: DiagnosticWriter + ?Sized> DiagnosticWriter for &mut W {
    fn write_line(&mut self, line: &str) {
        (**self).write_line(line);
    }
}

/// Default `DiagnosticWriter` that writes to stderr.
#[derive(Debug, Default)]
pub struct StdDiagnostics;

impl DiagnosticWriter for StdDiagnostics {
    fn write_line(&mut self, line: &str) {
        let mut stderr = io::stderr().lock();
        // the process is usually about to abort; there is nowhere to report a failed write
        let _ = writeln!(stderr, "{line}");
        let _ = stderr.flush();
    }
}

/// A `DiagnosticWriter` that collects all output into a string.
///
/// Useful for tests and for reporting diagnostics in structured output.
#[derive(Debug, Default)]
pub struct CollectDiagnostics(String);

impl CollectDiagnostics {
    /// Creates a new empty `CollectDiagnostics`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output, one `\n`-terminated line per write.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl DiagnosticWriter for CollectDiagnostics {
    fn write_line(&mut self, line: &str) {
        self.0.push_str(line);
        self.0.push('\n');
    }
}
