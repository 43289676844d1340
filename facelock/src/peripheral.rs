use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::error::{Error, LockResult};

#[derive(Debug, Clone, PartialEq)]
pub enum DistanceReading {
    Centimeters(f64),
    OutOfRange,
}

/// Line vocabulary spoken with the door controller. Newline-terminated
/// ASCII tokens; the recognition core never sees these - a thin adapter
/// translates pure verdicts into commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SystemReady,
    PinRequired,
    PinPrompt,
    PinEntered(String),
    PinTimeout,
    Success,
    Fail,
    Close,
    RecognitionDone,
    Distance(DistanceReading),
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Command::SystemReady => "SYSTEM_READY".into(),
            Command::PinRequired => "PIN_REQUIRED".into(),
            Command::PinPrompt => "PIN_PROMPT".into(),
            Command::PinEntered(code) => format!("PIN_ENTERED:{code}"),
            Command::PinTimeout => "PIN_TIMEOUT".into(),
            Command::Success => "SUCCESS".into(),
            Command::Fail => "FAIL".into(),
            Command::Close => "CLOSE".into(),
            Command::RecognitionDone => "RECOGNITION_DONE".into(),
            Command::Distance(DistanceReading::OutOfRange) => "DISTANCE:OUT_RANGE".into(),
            Command::Distance(DistanceReading::Centimeters(cm)) => format!("DISTANCE:{cm} cm"),
        }
    }

    /// Parse one trimmed line. `None` for anything outside the vocabulary,
    /// including malformed distance payloads.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if let Some(code) = line.strip_prefix("PIN_ENTERED:") {
            return Some(Command::PinEntered(code.trim().to_owned()));
        }
        if let Some(payload) = line.strip_prefix("DISTANCE:") {
            if payload == "OUT_RANGE" {
                return Some(Command::Distance(DistanceReading::OutOfRange));
            }
            let cm: f64 = payload.trim().trim_end_matches(" cm").trim().parse().ok()?;
            return Some(Command::Distance(DistanceReading::Centimeters(cm)));
        }
        match line {
            "SYSTEM_READY" => Some(Command::SystemReady),
            "PIN_REQUIRED" => Some(Command::PinRequired),
            "PIN_PROMPT" => Some(Command::PinPrompt),
            "PIN_TIMEOUT" => Some(Command::PinTimeout),
            "SUCCESS" => Some(Command::Success),
            "FAIL" => Some(Command::Fail),
            "CLOSE" => Some(Command::Close),
            "RECOGNITION_DONE" => Some(Command::RecognitionDone),
            _ => None,
        }
    }
}

/// Adapter over the controller channel. Incoming lines are pumped through
/// a channel by a dedicated reader thread so that waits can carry a real
/// wall-clock bound even when the tty goes silent mid-read.
pub struct Peripheral<W> {
    lines: Receiver<String>,
    writer: W,
}

impl Peripheral<File> {
    /// Open a serial device (or any character device) as a line channel.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {} for read", path.display()))?,
        );
        let writer = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("opening {} for write", path.display()))?;
        info!("peripheral channel open on {}", path.display());
        Ok(Self::new(reader, writer))
    }
}

impl<W: Write> Peripheral<W> {
    pub fn new(reader: impl BufRead + Send + 'static, writer: W) -> Self {
        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("controller read error: {e}");
                        break;
                    }
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines, writer }
    }

    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        let line = cmd.encode();
        debug!("-> {line}");
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// PIN exchange from face+pin mode: ask the controller to collect a
    /// PIN, then wait for `PIN_ENTERED` or `PIN_TIMEOUT`. `Ok(None)` means
    /// the user did not enter a PIN in time on the controller side. The
    /// deadline holds even if the controller never sends another byte; a
    /// closed line (EOF or read error) counts as a timeout too.
    pub fn request_pin(&mut self, timeout: Duration) -> LockResult<Option<String>> {
        self.send(&Command::PinRequired).map_err(Error::Other)?;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let Ok(line) = self.lines.recv_timeout(deadline - now) else {
                return Err(Error::Timeout);
            };
            match Command::parse(&line) {
                Some(Command::PinEntered(code)) => return Ok(Some(code)),
                Some(Command::PinTimeout) => return Ok(None),
                Some(Command::PinPrompt) => debug!("controller is prompting for PIN"),
                other => debug!("ignoring line while waiting for PIN: {other:?} ({line:?})"),
            }
        }
    }
}

/// Background reader for `DISTANCE:` telemetry. Runs concurrently with the
/// recognition loop; the latest reading is published through one
/// mutex-guarded slot.
pub struct DistanceMonitor {
    latest: Arc<Mutex<Option<DistanceReading>>>,
    handle: JoinHandle<()>,
}

impl DistanceMonitor {
    pub fn spawn(reader: impl BufRead + Send + 'static) -> Self {
        let latest = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&latest);
        let handle = std::thread::spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("distance channel read error: {e}");
                        break;
                    }
                };
                match Command::parse(&line) {
                    Some(Command::Distance(reading)) => {
                        debug!("distance update: {reading:?}");
                        if let Ok(mut guard) = slot.lock() {
                            *guard = Some(reading);
                        }
                    }
                    _ => debug!("ignoring non-distance line: {line:?}"),
                }
            }
        });
        Self { latest, handle }
    }

    pub fn latest(&self) -> Option<DistanceReading> {
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }

    /// Wait for the reader to hit EOF. Mostly useful in tests; in
    /// production the monitor lives until process exit.
    pub fn join(self) -> Option<DistanceReading> {
        let _ = self.handle.join();
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn vocabulary_round_trips() {
        let cmds = [
            Command::SystemReady,
            Command::PinRequired,
            Command::PinPrompt,
            Command::PinEntered("2828".into()),
            Command::PinTimeout,
            Command::Success,
            Command::Fail,
            Command::Close,
            Command::RecognitionDone,
            Command::Distance(DistanceReading::OutOfRange),
            Command::Distance(DistanceReading::Centimeters(42.5)),
        ];
        for cmd in cmds {
            assert_eq!(Command::parse(&cmd.encode()), Some(cmd.clone()), "{cmd:?}");
        }
    }

    #[test]
    fn parse_tolerates_whitespace_and_cm_suffix() {
        assert_eq!(
            Command::parse("DISTANCE:17.2 cm\r\n"),
            Some(Command::Distance(DistanceReading::Centimeters(17.2)))
        );
        assert_eq!(
            Command::parse("  SUCCESS\n"),
            Some(Command::Success)
        );
    }

    #[test]
    fn malformed_lines_are_none() {
        assert_eq!(Command::parse("DISTANCE:garbage"), None);
        assert_eq!(Command::parse("OPEN_SESAME"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn send_appends_newline() {
        let mut p = Peripheral::new(Cursor::new(Vec::new()), Vec::new());
        p.send(&Command::Success).unwrap();
        p.send(&Command::Fail).unwrap();
        assert_eq!(p.writer, b"SUCCESS\nFAIL\n");
    }

    #[test]
    fn pin_exchange_returns_code() {
        let input = Cursor::new(b"PIN_PROMPT\nPIN_ENTERED:2828\n".to_vec());
        let mut p = Peripheral::new(input, Vec::new());
        let pin = p.request_pin(Duration::from_secs(5)).unwrap();
        assert_eq!(pin.as_deref(), Some("2828"));
        assert!(p.writer.starts_with(b"PIN_REQUIRED\n"));
    }

    #[test]
    fn pin_timeout_from_controller() {
        let input = Cursor::new(b"PIN_TIMEOUT\n".to_vec());
        let mut p = Peripheral::new(input, Vec::new());
        assert_eq!(p.request_pin(Duration::from_secs(5)).unwrap(), None);
    }

    /// Reader standing in for a wedged tty: every read blocks far past
    /// any deadline the exchange would use.
    struct SilentChannel;

    impl std::io::Read for SilentChannel {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(60));
            Ok(0)
        }
    }

    #[test]
    fn pin_deadline_holds_on_silent_channel() {
        let mut p = Peripheral::new(BufReader::new(SilentChannel), Vec::new());
        let start = Instant::now();
        let res = p.request_pin(Duration::from_millis(100));
        assert!(matches!(res, Err(Error::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn pin_channel_eof_is_timeout() {
        let input = Cursor::new(Vec::new());
        let mut p = Peripheral::new(input, Vec::new());
        assert!(matches!(
            p.request_pin(Duration::from_secs(5)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn distance_monitor_keeps_latest() {
        let input = Cursor::new(
            b"DISTANCE:100 cm\nnoise\nDISTANCE:OUT_RANGE\nDISTANCE:55.5 cm\n".to_vec(),
        );
        let monitor = DistanceMonitor::spawn(input);
        let last = monitor.join();
        assert_eq!(last, Some(DistanceReading::Centimeters(55.5)));
    }
}
