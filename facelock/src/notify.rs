use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use log::{info, warn};
use reqwest::blocking::{multipart, Client};

use crate::peripheral::DistanceReading;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Notification-worthy moments of a recognition session. Face events can
/// carry the captured frame (PNG bytes) so the recipient sees who was at
/// the door.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessEvent {
    Granted {
        display_name: String,
        confidence_percent: f64,
        snapshot: Option<Vec<u8>>,
    },
    StrangerDetected {
        confidence_percent: f64,
        distance: Option<DistanceReading>,
        snapshot: Option<Vec<u8>>,
    },
    LockedOut {
        duration: Duration,
    },
}

impl AccessEvent {
    /// Human-readable message, timestamped at formatting time.
    pub fn message(&self) -> String {
        let now = humantime::format_rfc3339_seconds(SystemTime::now());
        match self {
            AccessEvent::Granted {
                display_name,
                confidence_percent,
                ..
            } => format!(
                "[{now}] Door opened for {display_name} (confidence {confidence_percent:.1}%)"
            ),
            AccessEvent::StrangerDetected {
                confidence_percent,
                distance,
                ..
            } => {
                let distance = match distance {
                    Some(DistanceReading::Centimeters(cm)) => format!("{cm:.0} cm"),
                    Some(DistanceReading::OutOfRange) => "out of range".into(),
                    None => "no reading".into(),
                };
                format!(
                    "[{now}] WARNING: stranger detected (confidence {confidence_percent:.1}%, distance: {distance})"
                )
            }
            AccessEvent::LockedOut { duration } => format!(
                "[{now}] System locked for {} after repeated failed attempts",
                humantime::format_duration(*duration)
            ),
        }
    }

    pub fn snapshot(&self) -> Option<&[u8]> {
        match self {
            AccessEvent::Granted { snapshot, .. }
            | AccessEvent::StrangerDetected { snapshot, .. } => snapshot.as_deref(),
            AccessEvent::LockedOut { .. } => None,
        }
    }
}

/// Delivery backends are pluggable; failures are the backend's problem to
/// log - a missed notification never aborts recognition.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &AccessEvent);
}

/// Telegram bot backend. Text-only events go out as `sendMessage`; events
/// carrying a snapshot go as `sendPhoto` with the message as caption. The
/// client carries a bounded timeout so a dead network cannot stall the
/// caller.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            client,
            bot_token,
            chat_id,
        })
    }

    /// Check the bot token against the API before relying on it.
    pub fn verify_token(&self) -> bool {
        let url = format!("{TELEGRAM_API}/bot{}/getMe", self.bot_token);
        match self.client.get(url).send().and_then(|r| r.error_for_status()) {
            Ok(_) => true,
            Err(e) => {
                warn!("telegram token check failed: {e}");
                false
            }
        }
    }

    fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{TELEGRAM_API}/bot{}/sendMessage", self.bot_token);
        self.client
            .post(url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()?
            .error_for_status()?;
        Ok(())
    }

    fn send_photo(&self, caption: &str, png: Vec<u8>) -> Result<()> {
        let url = format!("{TELEGRAM_API}/bot{}/sendPhoto", self.bot_token);
        let photo = multipart::Part::bytes(png)
            .file_name("snapshot.png")
            .mime_str("image/png")?;
        let form = multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_owned())
            .part("photo", photo);
        self.client
            .post(url)
            .multipart(form)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: &AccessEvent) {
        let message = event.message();
        let sent = match event.snapshot() {
            Some(png) => self.send_photo(&message, png.to_vec()),
            None => self.send_message(&message),
        };
        match sent {
            Ok(()) => info!("telegram notification sent"),
            Err(e) => warn!("telegram notification failed (skipped): {e:#}"),
        }
    }
}

/// Fire a notification without blocking the recognition loop. Delivery
/// latency lands on a throwaway thread, never on the accept/lockout path.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: AccessEvent) {
    let notifier = Arc::clone(notifier);
    std::thread::spawn(move || notifier.notify(&event));
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn messages_carry_the_essentials() {
        let msg = AccessEvent::Granted {
            display_name: "Alice Smith".into(),
            confidence_percent: 95.0,
            snapshot: None,
        }
        .message();
        assert!(msg.contains("Alice Smith"));
        assert!(msg.contains("95.0%"));

        let msg = AccessEvent::StrangerDetected {
            confidence_percent: 12.3,
            distance: Some(DistanceReading::OutOfRange),
            snapshot: None,
        }
        .message();
        assert!(msg.contains("stranger"));
        assert!(msg.contains("out of range"));

        let msg = AccessEvent::LockedOut {
            duration: Duration::from_secs(60),
        }
        .message();
        assert!(msg.contains("1m"));
    }

    #[test]
    fn snapshot_rides_on_face_events_only() {
        let ev = AccessEvent::StrangerDetected {
            confidence_percent: 12.3,
            distance: None,
            snapshot: Some(vec![0x89, b'P', b'N', b'G']),
        };
        assert_eq!(ev.snapshot(), Some(&[0x89, b'P', b'N', b'G'][..]));

        let ev = AccessEvent::LockedOut {
            duration: Duration::from_secs(60),
        };
        assert_eq!(ev.snapshot(), None);
    }

    struct ChannelNotifier(Mutex<mpsc::Sender<AccessEvent>>);

    impl Notifier for ChannelNotifier {
        fn notify(&self, event: &AccessEvent) {
            let _ = self.0.lock().unwrap().send(event.clone());
        }
    }

    #[test]
    fn detached_dispatch_delivers() {
        let (tx, rx) = mpsc::channel();
        let notifier: Arc<dyn Notifier> = Arc::new(ChannelNotifier(Mutex::new(tx)));
        notify_detached(
            &notifier,
            AccessEvent::LockedOut {
                duration: Duration::from_secs(60),
            },
        );
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(got, AccessEvent::LockedOut { .. }));
    }
}
