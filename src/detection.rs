use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use log::{debug, trace};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
};
use tch::{Device, IValue, Kind, Tensor};

use crate::config::Config;
use crate::frame::Frame;
use crate::utils::{self, BoxVec};

/// A single detection result.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub tlwh: BoxVec,
    pub confidence: f32,
    pub class_id: i32,
}

impl Detection {
    pub fn new(tlwh: BoxVec, confidence: f32, class_id: i32) -> Self {
        Self {
            tlwh,
            confidence,
            class_id,
        }
    }

    /// Build from corner coordinates.
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: i32) -> Self {
        Self::new(
            utils::tlbr_to_tlwh(&BoxVec::new(x1, y1, x2, y2)),
            confidence,
            class_id,
        )
    }

    pub fn tlbr(&self) -> BoxVec {
        utils::tlwh_to_tlbr(&self.tlwh)
    }
}

/// Object detection backend.
///
/// Implementations apply their own confidence threshold: nothing below it is
/// returned, and a detection exactly at the threshold is kept.
pub trait Detector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

/// Parameters for turning raw model output into detections.
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams<'a> {
    /// Frame width / model input width.
    pub scale_x: f32,
    /// Frame height / model input height.
    pub scale_y: f32,
    pub conf_threshold: f32,
    pub classes: Option<&'a [i32]>,
    /// Class count of the model head, when known. Pins the output layout
    /// instead of guessing it from which dimension is larger.
    pub num_classes: Option<usize>,
}

impl DecodeParams<'_> {
    fn accepts(&self, confidence: f32, class_id: i32) -> bool {
        confidence >= self.conf_threshold
            && self.classes.map_or(true, |allowed| allowed.contains(&class_id))
    }

    fn detection(&self, tlbr: [f32; 4], confidence: f32, class_id: i32) -> Detection {
        Detection::from_tlbr(
            tlbr[0] * self.scale_x,
            tlbr[1] * self.scale_y,
            tlbr[2] * self.scale_x,
            tlbr[3] * self.scale_y,
            confidence,
            class_id,
        )
    }
}

fn best_class(scores: impl Iterator<Item = f32>) -> (i32, f32) {
    scores
        .enumerate()
        .fold((0, f32::MIN), |best, (c, s)| if s > best.1 { (c as i32, s) } else { best })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `[1, N, 6]` rows of `x1, y1, x2, y2, conf, cls`.
    PostNms,
    /// `[1, 4 + C, N]`
    ChannelsFirst,
    /// `[1, N, 5 + C]`
    Rows,
}

fn layout(d1: usize, d2: usize, num_classes: Option<usize>) -> Result<Layout> {
    match num_classes {
        Some(nc) if d1 == 4 + nc => Ok(Layout::ChannelsFirst),
        Some(_) if d2 == 6 => Ok(Layout::PostNms),
        Some(nc) if d2 == 5 + nc => Ok(Layout::Rows),
        Some(nc) => bail!("output shape [1, {d1}, {d2}] does not fit a {nc}-class head"),
        None if d2 == 6 => Ok(Layout::PostNms),
        None if d1 < d2 => Ok(Layout::ChannelsFirst),
        None => Ok(Layout::Rows),
    }
}

fn center_to_tlbr(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// Decode a flattened YOLO output tensor of the given `shape`.
///
/// Three layouts are understood:
/// * `[1, 4 + C, N]`: YOLOv8/11 head, centre boxes then class scores per column.
/// * `[1, N, 5 + C]`: YOLOv5/7 head, centre box, objectness, class scores per row.
/// * `[1, N, 6]`: exported with NMS, `x1, y1, x2, y2, conf, cls` per row.
///
/// Without [`DecodeParams::num_classes`] the first two are told apart by
/// assuming anchors outnumber channels.
pub fn decode_predictions(
    data: &[f32],
    shape: &[i64],
    params: &DecodeParams<'_>,
) -> Result<Vec<Detection>> {
    let [batch, d1, d2] = match shape {
        &[b, d1, d2] => [b as usize, d1 as usize, d2 as usize],
        other => bail!("unsupported detector output shape {other:?}"),
    };
    if batch != 1 {
        bail!("expected a single-image batch, got {batch}");
    }
    if data.len() != d1 * d2 {
        bail!("output holds {} values, shape {shape:?} needs {}", data.len(), d1 * d2);
    }

    let mut detections = Vec::new();

    match layout(d1, d2, params.num_classes)? {
        Layout::PostNms => {
            for row in data.chunks_exact(6) {
                let (confidence, class_id) = (row[4], row[5] as i32);
                if params.accepts(confidence, class_id) {
                    let tlbr = [row[0], row[1], row[2], row[3]];
                    detections.push(params.detection(tlbr, confidence, class_id));
                }
            }
        }
        Layout::ChannelsFirst => {
            if d1 <= 4 {
                bail!("output has no class scores: shape {shape:?}");
            }
            let (channels, anchors) = (d1, d2);
            let at = |c: usize, i: usize| data[c * anchors + i];
            for i in 0..anchors {
                let (class_id, confidence) = best_class((4..channels).map(|c| at(c, i)));
                if params.accepts(confidence, class_id) {
                    let tlbr = center_to_tlbr(at(0, i), at(1, i), at(2, i), at(3, i));
                    detections.push(params.detection(tlbr, confidence, class_id));
                }
            }
        }
        Layout::Rows => {
            if d2 <= 5 {
                bail!("output has no class scores: shape {shape:?}");
            }
            for row in data.chunks_exact(d2) {
                let objectness = row[4];
                let (class_id, class_score) = best_class(row[5..].iter().copied());
                let confidence = objectness * class_score;
                if params.accepts(confidence, class_id) {
                    let tlbr = center_to_tlbr(row[0], row[1], row[2], row[3]);
                    detections.push(params.detection(tlbr, confidence, class_id));
                }
            }
        }
    }

    Ok(detections)
}

/// Class-aware non-max suppression. Output is sorted by confidence, highest first.
pub fn suppress(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut by_class: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (i, det) in detections.iter().enumerate() {
        by_class.entry(det.class_id).or_default().push(i);
    }

    let mut keep = Vec::with_capacity(detections.len());
    for idxs in by_class.values() {
        let boxes: Vec<BoxVec> = idxs.iter().map(|&i| detections[i].tlwh).collect();
        let scores: Vec<f32> = idxs.iter().map(|&i| detections[i].confidence).collect();
        keep.extend(utils::nms(&boxes, &scores, iou_threshold).into_iter().map(|k| idxs[k]));
    }

    let mut kept: Vec<Detection> = keep.into_iter().map(|i| detections[i].clone()).collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept
}

/// YOLO detector backed by a TorchScript export.
pub struct YoloDetector {
    model: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub classes: Option<Vec<i32>>,
    pub num_classes: Option<usize>,
}

impl YoloDetector {
    /// Load a TorchScript model on "cpu" or "cuda"; cuda falls back to cpu
    /// when unavailable.
    pub fn new(
        model_path: &str,
        device: &str,
        input_size: (i64, i64),
        conf_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Self> {
        let device = if device == "cuda" && tch::Cuda::is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        };

        let mut model = tch::CModule::load_on_device(model_path, device)
            .with_context(|| format!("failed to load detector model {model_path:?}"))?;
        model.set_eval();

        Ok(Self {
            model,
            device,
            input_size,
            conf_threshold,
            nms_threshold,
            classes: None,
            num_classes: None,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut detector = Self::new(
            &cfg.model_path,
            &cfg.device,
            (cfg.input_size[0] as i64, cfg.input_size[1] as i64),
            cfg.confidence_threshold,
            cfg.iou_threshold,
        )?;
        detector.classes = cfg.classes.clone();
        detector.num_classes = cfg.num_classes;
        Ok(detector)
    }

    /// Resize, BGR to RGB, scale to [0, 1], NCHW.
    fn preprocess(&self, image: &Mat) -> Result<Tensor> {
        let (w, h) = self.input_size;
        let mut resized = Mat::default();
        imgproc::resize(
            image,
            &mut resized,
            Size::new(w as i32, h as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&resized, &mut rgb, imgproc::COLOR_BGR2RGB)?;

        let tensor = Tensor::from_slice(rgb.data_bytes()?)
            .view([h, w, 3])
            .permute([2, 0, 1])
            .to_kind(Kind::Float)
            / 255.0;

        Ok(tensor.unsqueeze(0).to_device(self.device))
    }

    fn inference(&self, input: Tensor) -> Result<Tensor> {
        let output = tch::no_grad(|| self.model.forward_is(&[IValue::Tensor(input)]))?;
        match output {
            IValue::Tensor(t) => Ok(t),
            // Some exports return (predictions, aux outputs...)
            IValue::Tuple(mut items) | IValue::GenericList(mut items) if !items.is_empty() => {
                match items.swap_remove(0) {
                    IValue::Tensor(t) => Ok(t),
                    other => bail!("unexpected first model output: {other:?}"),
                }
            }
            other => bail!("unexpected model output: {other:?}"),
        }
    }

    fn postprocess(&self, output: &Tensor, frame_size: (i32, i32)) -> Result<Vec<Detection>> {
        let shape = output.size();
        let flat = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .view([-1]);
        let data = Vec::<f32>::try_from(&flat)?;

        let params = DecodeParams {
            scale_x: frame_size.0 as f32 / self.input_size.0 as f32,
            scale_y: frame_size.1 as f32 / self.input_size.1 as f32,
            conf_threshold: self.conf_threshold,
            classes: self.classes.as_deref(),
            num_classes: self.num_classes,
        };
        let candidates = decode_predictions(&data, &shape, &params)?;
        let candidate_count = candidates.len();
        let detections = suppress(candidates, self.nms_threshold);
        debug!(
            "{} detections kept after NMS out of {}",
            detections.len(),
            candidate_count
        );
        Ok(detections)
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.preprocess(frame.image())?;
        let output = self.inference(input)?;
        let detections = self.postprocess(&output, (frame.width(), frame.height()))?;
        for det in &detections {
            trace!(
                "frame {}: class={} conf={:.3} tlwh=[{:.1}, {:.1}, {:.1}, {:.1}]",
                frame.index(),
                det.class_id,
                det.confidence,
                det.tlwh[0],
                det.tlwh[1],
                det.tlwh[2],
                det.tlwh[3]
            );
        }
        Ok(detections)
    }
}
