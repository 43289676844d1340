use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DetectorKind {
    /// dlib's frontal HOG detector, no model file needed.
    Hog,
    /// dlib's MMOD CNN detector, needs `mmod_human_face_detector.dat`.
    Cnn,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionMode {
    FaceOnly,
    /// Face match must be confirmed with a PIN entered on the controller.
    FacePin { expected_pin: String },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AfterMatch {
    Continue,
    Stop,
}

/// Per-lock configuration. One value per lock identity; sessions never
/// share config-derived paths across locks.
#[derive(Debug, Clone)]
pub struct LockConfig {
    lock_id: String,
    camera_index: u32,
    model_dir: PathBuf,
    data_dir: PathBuf,
    pub(crate) match_threshold: f64,
    /// maximum percent of dark pixels in frame to allow recognition
    dark_threshold: u32,
    pub(crate) max_failures: u32,
    pub(crate) lockout_duration: Duration,
    pub(crate) detector: DetectorKind,
    pub mode: SessionMode,
    pub after_match: AfterMatch,
}

impl LockConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lock_id: String,
        camera_index: u32,
        model_dir: PathBuf,
        data_dir: PathBuf,
        match_threshold: f64,
        dark_threshold: u32,
        max_failures: u32,
        lockout_duration: Duration,
        detector: DetectorKind,
        mode: SessionMode,
        after_match: AfterMatch,
    ) -> Result<Self> {
        if lock_id.is_empty() || lock_id.contains(['/', '\\']) {
            bail!("Lock id must be a non-empty path-safe string");
        }
        if !(0.0..=2.0).contains(&match_threshold) {
            bail!("Match threshold should be within 0..=2 (euclidean)");
        }
        if dark_threshold > 100 {
            bail!("Dark threshold percent should be 0..=100");
        }
        if max_failures == 0 {
            bail!("Need at least one allowed failure before lockout");
        }
        if lockout_duration.is_zero() {
            bail!("Lockout duration must be positive");
        }
        if let SessionMode::FacePin { expected_pin } = &mode {
            if expected_pin.is_empty() {
                bail!("Expected PIN must not be empty in face+pin mode");
            }
        }
        Ok(Self {
            lock_id,
            camera_index,
            model_dir,
            data_dir,
            match_threshold,
            dark_threshold,
            max_failures,
            lockout_duration,
            detector,
            mode,
            after_match,
        })
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn camera_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/video{}", self.camera_index))
    }

    pub(crate) fn model_path(&self, filename: &str) -> Result<PathBuf> {
        let file = self.model_dir.join(filename);
        if !file.exists() {
            bail!("Model file not found {}", file.display())
        } else {
            Ok(file)
        }
    }

    /// Directory of source face images for this lock.
    pub fn corpus_dir(&self) -> PathBuf {
        self.data_dir.join(&self.lock_id).join("faces")
    }

    /// Cache file holding the persisted gallery for this lock.
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.lock_id).join("gallery.json")
    }

    pub fn dark_threshold(&self) -> u32 {
        self.dark_threshold
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn base(threshold: f64, dark: u32, fails: u32) -> Result<LockConfig> {
        LockConfig::new(
            "front-door".into(),
            0,
            PathBuf::from("models"),
            PathBuf::from("data"),
            threshold,
            dark,
            fails,
            Duration::from_secs(60),
            DetectorKind::Hog,
            SessionMode::FaceOnly,
            AfterMatch::Continue,
        )
    }

    #[test]
    fn validates_ranges() {
        assert!(base(0.6, 30, 3).is_ok());
        assert!(base(2.5, 30, 3).is_err());
        assert!(base(0.6, 101, 3).is_err());
        assert!(base(0.6, 30, 0).is_err());
    }

    #[test]
    fn per_lock_paths() {
        let config = base(0.6, 30, 3).unwrap();
        assert_eq!(config.cache_path(), Path::new("data/front-door/gallery.json"));
        assert_eq!(config.corpus_dir(), Path::new("data/front-door/faces"));
    }

    #[test]
    fn rejects_empty_pin() {
        let res = LockConfig::new(
            "door".into(),
            0,
            PathBuf::from("models"),
            PathBuf::from("data"),
            0.6,
            30,
            3,
            Duration::from_secs(60),
            DetectorKind::Hog,
            SessionMode::FacePin {
                expected_pin: String::new(),
            },
            AfterMatch::Stop,
        );
        assert!(res.is_err());
    }
}
