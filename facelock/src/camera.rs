use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// V4L2 camera producing grayscale frames for the recognition loop.
pub struct Cam {
    cam: rscam::Camera,
    config: rscam::Config<'static>,
}

const FORMAT: &[u8; 4] = b"GREY";

impl Cam {
    pub fn start(camera_path: impl AsRef<Path>) -> Result<Self> {
        let device = camera_path
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow!("Invalid camera path {}", camera_path.as_ref().display()))?;
        let mut cam = rscam::Camera::new(device)
            .with_context(|| format!("opening camera {device}"))?;
        let config = Self::negotiate(&cam)?;
        cam.start(&config)?;
        Ok(Self { cam, config })
    }

    /// Time between frames at the negotiated rate.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.interval.0 as f64 / self.config.interval.1 as f64)
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.config.resolution
    }

    fn negotiate(cam: &rscam::Camera) -> Result<rscam::Config<'static>> {
        let supported = cam
            .formats()
            .filter_map(|fmt| fmt.ok())
            .any(|fmti| &fmti.format == FORMAT);
        if !supported {
            bail!(
                "camera does not offer {} frames",
                String::from_utf8_lossy(FORMAT)
            );
        }
        let resolution = match cam.resolutions(FORMAT).context("listing resolutions")? {
            rscam::ResolutionInfo::Discretes(v) => v
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("no resolutions offered"))?,
            _ => bail!("only discrete resolutions supported"),
        };
        let interval = match cam
            .intervals(FORMAT, resolution)
            .context("listing frame intervals")?
        {
            rscam::IntervalInfo::Discretes(v) => v
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("no frame intervals offered"))?,
            _ => bail!("only discrete intervals supported"),
        };
        Ok(rscam::Config {
            interval,
            resolution,
            format: FORMAT,
            ..Default::default()
        })
    }

    pub fn capture(&mut self) -> Result<rscam::Frame> {
        Ok(self.cam.capture()?)
    }
}
