use std::io::Write;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Lines kept for slow `/api/logs` subscribers before they see a lag notice.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 500;

/// Tees every formatted log line into a broadcast channel and, unless
/// suppressed, to stdout.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            // No receivers is fine.
            let _ = self.sender.send(line);
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// `[logging] level` to a tracing level; unknown names fall back to `info`.
pub(crate) fn parse_level(name: &str) -> Level {
    Level::from_str(name.trim()).unwrap_or(Level::INFO)
}

/// Installs the global subscriber and returns the sender behind `/api/logs`.
pub(crate) fn init(level: &str, suppress_stdout: bool) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let make_writer = SseMakeWriter {
        sender: log_tx.clone(),
        suppress_stdout,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    // Already set when embedded in tests.
    tracing::subscriber::set_global_default(subscriber).ok();
    log_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive_with_info_fallback() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn writer_broadcasts_trimmed_lines() {
        let (tx, mut rx) = broadcast::channel(4);
        let make = SseMakeWriter {
            sender: tx,
            suppress_stdout: true,
        };
        let mut writer = make.make_writer();
        writer.write_all(b"job claimed\n").unwrap();
        writer.write_all(b"\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "job claimed");
        assert!(rx.try_recv().is_err());
    }
}
