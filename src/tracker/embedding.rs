use anyhow::Result;
use opencv::{
    core::{Mat, Rect, Vector},
    imgproc,
    prelude::*,
};

use crate::frame::Frame;
use crate::utils::BoxVec;

/// Appearance descriptor extractor used for re-identification.
///
/// Returned vectors are L2-normalised, one per box, in input order.
pub trait Embedder {
    fn embed(&mut self, frame: &Frame, boxes: &[BoxVec]) -> Result<Vec<Vec<f32>>>;
}

/// Hue/saturation histogram of each box's pixels.
#[derive(Debug, Clone)]
pub struct HistogramEmbedder {
    pub hue_bins: i32,
    pub saturation_bins: i32,
}

impl Default for HistogramEmbedder {
    fn default() -> Self {
        Self {
            hue_bins: 16,
            saturation_bins: 16,
        }
    }
}

/// Intersect a tlwh box with the image, in whole pixels.
fn clip_to_image(tlwh: &BoxVec, width: i32, height: i32) -> Option<Rect> {
    let x1 = (tlwh[0] as i32).clamp(0, width);
    let y1 = (tlwh[1] as i32).clamp(0, height);
    let x2 = ((tlwh[0] + tlwh[2]) as i32).clamp(0, width);
    let y2 = ((tlwh[1] + tlwh[3]) as i32).clamp(0, height);
    (x2 > x1 && y2 > y1).then(|| Rect::new(x1, y1, x2 - x1, y2 - y1))
}

pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

impl HistogramEmbedder {
    fn dims(&self) -> usize {
        (self.hue_bins * self.saturation_bins) as usize
    }

    fn histogram(&self, image: &Mat, rect: Rect) -> Result<Vec<f32>> {
        let crop = Mat::roi(image, rect)?;
        let mut hsv = Mat::default();
        imgproc::cvt_color_def(&crop, &mut hsv, imgproc::COLOR_BGR2HSV)?;

        let images: Vector<Mat> = std::iter::once(hsv).collect();
        let mut hist = Mat::default();
        imgproc::calc_hist(
            &images,
            &Vector::from_slice(&[0, 1]),
            &Mat::default(),
            &mut hist,
            &Vector::from_slice(&[self.hue_bins, self.saturation_bins]),
            &Vector::from_slice(&[0.0f32, 180.0, 0.0, 256.0]),
            false,
        )?;

        let mut feature = hist.data_typed::<f32>()?.to_vec();
        l2_normalize(&mut feature);
        Ok(feature)
    }
}

impl Embedder for HistogramEmbedder {
    fn embed(&mut self, frame: &Frame, boxes: &[BoxVec]) -> Result<Vec<Vec<f32>>> {
        boxes
            .iter()
            .map(|tlwh| match clip_to_image(tlwh, frame.width(), frame.height()) {
                Some(rect) => self.histogram(frame.image(), rect),
                // Nothing visible: a zero vector matches nothing by appearance.
                None => Ok(vec![0.0; self.dims()]),
            })
            .collect()
    }
}
