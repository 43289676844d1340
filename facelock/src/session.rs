use std::time::{Duration, Instant};

use image::DynamicImage;

use crate::config::LockConfig;
use crate::error::{Error, LockResult};
use crate::extractor::EmbeddingExtractor;
use crate::gallery::Gallery;
use crate::lockout::{Gate, LockoutPolicy};
use crate::matcher::match_embedding;

/// Outcome of evaluating one frame. Terminal decisions are returned to the
/// caller, which decides whether to loop again or stop.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Granted {
        identity: String,
        display_name: String,
        confidence_percent: f64,
    },
    Denied {
        confidence_percent: f64,
        /// true when this rejection tripped the lockout
        lockout_tripped: bool,
    },
    LockedOut {
        remaining: Duration,
    },
    /// No usable face in the frame; not counted as a failure.
    NoFace,
}

/// One recognition pipeline instance per lock identity. Owns its gallery,
/// lockout state and extractor - nothing is shared across locks, so several
/// sessions can run in one process without cross-talk.
pub struct LockSession {
    match_threshold: f64,
    gallery: Gallery,
    lockout: LockoutPolicy,
    extractor: Box<dyn EmbeddingExtractor + Send>,
}

impl LockSession {
    pub fn new(
        config: &LockConfig,
        gallery: Gallery,
        extractor: Box<dyn EmbeddingExtractor + Send>,
    ) -> LockResult<Self> {
        if gallery.is_empty() {
            return Err(Error::NoGalleryAvailable);
        }
        Ok(Self {
            match_threshold: config.match_threshold,
            gallery,
            lockout: LockoutPolicy::new(config.max_failures, config.lockout_duration),
            extractor,
        })
    }

    /// Swap in a freshly rebuilt gallery. Rebuild happens outside the
    /// session; the old value is replaced whole, never mutated while
    /// matching.
    pub fn replace_gallery(&mut self, gallery: Gallery) -> LockResult<()> {
        if gallery.is_empty() {
            return Err(Error::NoGalleryAvailable);
        }
        self.gallery = gallery;
        Ok(())
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Evaluate one frame. While locked out, the extractor is not invoked
    /// at all; the attempt is rejected outright.
    pub fn process_frame(&mut self, img: &DynamicImage, now: Instant) -> LockResult<Verdict> {
        if let Gate::Locked { remaining } = self.lockout.gate(now) {
            return Ok(Verdict::LockedOut { remaining });
        }
        let embedding = match self.extractor.extract(img) {
            Ok(Some(emb)) => emb,
            Ok(None) => return Ok(Verdict::NoFace),
            Err(Error::NoFace | Error::MultipleFaces | Error::TooDark) => {
                return Ok(Verdict::NoFace)
            }
            Err(e) => return Err(e),
        };
        let result = match_embedding(&embedding, &self.gallery, self.match_threshold);
        let tripped = self.lockout.record(result.matched, now);
        if result.matched {
            // identity and display_name are always present on a match
            Ok(Verdict::Granted {
                identity: result.identity.unwrap_or_default(),
                display_name: result.display_name.unwrap_or_default(),
                confidence_percent: result.confidence_percent,
            })
        } else {
            Ok(Verdict::Denied {
                confidence_percent: result.confidence_percent,
                lockout_tripped: tripped,
            })
        }
    }

    /// Count an out-of-band failure (e.g. a wrong PIN in face+pin mode)
    /// against the lockout. Returns true when this tripped the lockout.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.lockout.record(false, now)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::{AfterMatch, DetectorKind, SessionMode};
    use crate::gallery::{Embedding, GalleryEntry};

    struct ScriptedExtractor {
        embedding: Option<Embedding>,
        calls: Cell<u32>,
    }

    impl EmbeddingExtractor for ScriptedExtractor {
        fn extract(&self, _img: &DynamicImage) -> LockResult<Option<Embedding>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.embedding.clone())
        }
    }

    fn config() -> LockConfig {
        LockConfig::new(
            "door".into(),
            0,
            PathBuf::from("models"),
            PathBuf::from("data"),
            0.6,
            30,
            3,
            Duration::from_secs(60),
            DetectorKind::Hog,
            SessionMode::FaceOnly,
            AfterMatch::Continue,
        )
        .unwrap()
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::new(BTreeSet::from(["u1_Alice_s_1.jpg".to_string()]));
        g.push(GalleryEntry::new(
            "u1".into(),
            "Alice".into(),
            Embedding::new(vec![0.0, 0.0]),
        ))
        .unwrap();
        g
    }

    fn session(embedding: Option<Embedding>) -> LockSession {
        LockSession::new(
            &config(),
            gallery(),
            Box::new(ScriptedExtractor {
                embedding,
                calls: Cell::new(0),
            }),
        )
        .unwrap()
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_luma8(4, 4)
    }

    #[test]
    fn empty_gallery_cannot_start() {
        let res = LockSession::new(
            &config(),
            Gallery::new(BTreeSet::new()),
            Box::new(ScriptedExtractor {
                embedding: None,
                calls: Cell::new(0),
            }),
        );
        assert!(matches!(res, Err(Error::NoGalleryAvailable)));
    }

    #[test]
    fn near_match_grants() {
        let mut s = session(Some(Embedding::new(vec![0.0, 0.1])));
        let v = s.process_frame(&frame(), Instant::now()).unwrap();
        match v {
            Verdict::Granted {
                identity,
                display_name,
                confidence_percent,
            } => {
                assert_eq!(identity, "u1");
                assert_eq!(display_name, "Alice");
                assert!((confidence_percent - 95.0).abs() < 1e-6);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn repeated_denials_lock_and_skip_extraction() {
        let mut s = session(Some(Embedding::new(vec![5.0, 5.0])));
        let t0 = Instant::now();
        for i in 0..3 {
            let v = s.process_frame(&frame(), t0).unwrap();
            let Verdict::Denied { lockout_tripped, .. } = v else {
                panic!("expected denial");
            };
            assert_eq!(lockout_tripped, i == 2);
        }
        // locked: verdict comes back without touching the extractor
        let v = s.process_frame(&frame(), t0 + Duration::from_secs(1)).unwrap();
        assert!(matches!(v, Verdict::LockedOut { .. }));
        // cooldown over: attempt evaluated normally again
        let v = s
            .process_frame(&frame(), t0 + Duration::from_secs(61))
            .unwrap();
        assert!(matches!(v, Verdict::Denied { .. }));
    }

    struct CountingExtractor {
        embedding: Embedding,
        calls: Arc<AtomicU32>,
    }

    impl EmbeddingExtractor for CountingExtractor {
        fn extract(&self, _img: &DynamicImage) -> LockResult<Option<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.embedding.clone()))
        }
    }

    #[test]
    fn locked_session_does_not_invoke_extractor() {
        let calls = Arc::new(AtomicU32::new(0));
        let extractor = Box::new(CountingExtractor {
            embedding: Embedding::new(vec![5.0, 5.0]),
            calls: Arc::clone(&calls),
        });
        let mut s = LockSession::new(&config(), gallery(), extractor).unwrap();
        let t0 = Instant::now();
        for _ in 0..3 {
            s.process_frame(&frame(), t0).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        s.process_frame(&frame(), t0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn no_face_is_not_a_failure() {
        let mut s = session(None);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert_eq!(s.process_frame(&frame(), t0).unwrap(), Verdict::NoFace);
        }
        // still open: a real face would be evaluated
        s.replace_gallery(gallery()).unwrap();
        assert_eq!(s.gallery().len(), 1);
        assert!(!matches!(
            s.process_frame(&frame(), t0).unwrap(),
            Verdict::LockedOut { .. }
        ));
    }

    #[test]
    fn pin_failures_feed_lockout() {
        let mut s = session(Some(Embedding::new(vec![0.0, 0.0])));
        let t0 = Instant::now();
        assert!(!s.record_failure(t0));
        assert!(!s.record_failure(t0));
        assert!(s.record_failure(t0));
        assert!(matches!(
            s.process_frame(&frame(), t0).unwrap(),
            Verdict::LockedOut { .. }
        ));
    }
}
