use anyhow::Result;
use dlib_face_recognition::{
    FaceDetector, FaceDetectorCnn, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait,
    LandmarkPredictor, LandmarkPredictorTrait,
};
use image::math::Rect;
use image::DynamicImage;
use log::warn;

use crate::config::{DetectorKind, LockConfig};
use crate::error::{Error, LockResult};
use crate::gallery::Embedding;
use crate::image_ops::{img_to_dlib, resize_to_width};

/// External collaborator boundary: a cropped/prepared image either yields a
/// fixed-length embedding or nothing (no usable face - expected, not an
/// error). The gallery store and session only see this trait; tests feed in
/// fakes so no model files are needed.
pub trait EmbeddingExtractor {
    fn extract(&self, img: &DynamicImage) -> LockResult<Option<Embedding>>;
}

trait FaceDet {
    fn face_locations(&self, img: &DynamicImage) -> Result<Vec<Rect>>;
}

impl FaceDet for FaceDetector {
    fn face_locations(&self, img: &DynamicImage) -> Result<Vec<Rect>> {
        let mat = img_to_dlib(img)?;
        Ok(rects(FaceDetectorTrait::face_locations(self, &mat).iter()))
    }
}

impl FaceDet for FaceDetectorCnn {
    fn face_locations(&self, img: &DynamicImage) -> Result<Vec<Rect>> {
        let mat = img_to_dlib(img)?;
        Ok(rects(FaceDetectorTrait::face_locations(self, &mat).iter()))
    }
}

fn rects<'a>(locs: impl Iterator<Item = &'a dlib_face_recognition::Rectangle>) -> Vec<Rect> {
    locs.map(|loc| Rect {
        x: loc.left as _,
        y: loc.top as _,
        width: (loc.right - loc.left) as _,
        height: (loc.bottom - loc.top) as _,
    })
    .collect()
}

/// dlib-backed extractor: face detection (HOG or MMOD CNN), 5-point
/// landmarks, ResNet face encoder.
pub struct DlibExtractor {
    fdet: Box<dyn FaceDet>,
    lm_pred: LandmarkPredictor,
    encoder: FaceEncoderNetwork,
}

// dlib handles are only ever used from one thread at a time.
unsafe impl Send for DlibExtractor {}

impl DlibExtractor {
    /// Model files load slowly; do it on parallel threads like any startup
    /// path that has to open three large .dat files.
    pub fn new(config: &LockConfig) -> Result<Self> {
        let lm_path = config.model_path("shape_predictor_5_face_landmarks.dat")?;
        let lmt = std::thread::spawn(move || LandmarkPredictor::open(lm_path));
        let enc_path = config.model_path("dlib_face_recognition_resnet_model_v1.dat")?;
        let ent = std::thread::spawn(move || FaceEncoderNetwork::open(enc_path));

        let fdet: Box<dyn FaceDet> = match config.detector {
            DetectorKind::Hog => Box::new(FaceDetector::new()),
            DetectorKind::Cnn => {
                let path = config.model_path("mmod_human_face_detector.dat")?;
                Box::new(FaceDetectorCnn::open(path).map_err(|e| anyhow::anyhow!(e))?)
            }
        };
        let lm_pred = lmt
            .join()
            .map_err(|_| anyhow::format_err!("Landmark predictor init failed!"))?
            .map_err(|e| anyhow::anyhow!(e))?;
        let encoder = ent
            .join()
            .map_err(|_| anyhow::format_err!("Encoder init failed!"))?
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self {
            fdet,
            lm_pred,
            encoder,
        })
    }

    fn face_rect(&self, img: &DynamicImage) -> LockResult<Option<Rect>> {
        let locs = self.fdet.face_locations(img)?;
        if locs.len() > 1 {
            warn!("Expected just one face, found {}", locs.len());
            return Err(Error::MultipleFaces);
        }
        Ok(locs.first().cloned())
    }

    fn encode(&self, img: &DynamicImage, rect: Rect) -> LockResult<Option<Embedding>> {
        let matrix = img_to_dlib(img)?;
        let dlib_rect = dlib_face_recognition::Rectangle {
            left: rect.x as _,
            top: rect.y as _,
            right: (rect.x + rect.width) as _,
            bottom: (rect.y + rect.height) as _,
        };
        let landmarks = self.lm_pred.face_landmarks(&matrix, &dlib_rect);
        let encodings = self.encoder.get_face_encodings(&matrix, &[landmarks], 0);
        Ok(encodings
            .first()
            .map(|enc| Embedding::new(enc.as_ref().to_vec())))
    }
}

impl EmbeddingExtractor for DlibExtractor {
    fn extract(&self, img: &DynamicImage) -> LockResult<Option<Embedding>> {
        let img = resize_to_width(img, 320);
        let Some(rect) = self.face_rect(&img)? else {
            return Ok(None);
        };
        self.encode(&img, rect)
    }
}
