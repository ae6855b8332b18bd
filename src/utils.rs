//! Box geometry shared by the detector, the trackers and the renderer.
//!
//! Float boxes are `nalgebra` 4-vectors in one of three layouts:
//! `tlwh` (left, top, width, height), `tlbr` (x1, y1, x2, y2) and
//! `xyah` (center x, center y, aspect ratio w/h, height).
use nalgebra::SVector;

pub type BoxVec = SVector<f32, 4>;

/// Convert tlwh to tlbr format.
pub fn tlwh_to_tlbr(tlwh: &BoxVec) -> BoxVec {
    let mut tlbr = *tlwh;
    tlbr[2] = tlwh[0] + tlwh[2];
    tlbr[3] = tlwh[1] + tlwh[3];
    tlbr
}

/// Convert tlbr to tlwh format.
pub fn tlbr_to_tlwh(tlbr: &BoxVec) -> BoxVec {
    let mut tlwh = *tlbr;
    tlwh[2] = tlbr[2] - tlbr[0];
    tlwh[3] = tlbr[3] - tlbr[1];
    tlwh
}

pub fn tlwh_to_xyah(tlwh: &BoxVec) -> BoxVec {
    let h = tlwh[3];
    let aspect = if h > 0.0 { tlwh[2] / h } else { 0.0 };
    BoxVec::new(tlwh[0] + tlwh[2] / 2.0, tlwh[1] + h / 2.0, aspect, h)
}

pub fn xyah_to_tlwh(xyah: &BoxVec) -> BoxVec {
    let w = xyah[2] * xyah[3];
    BoxVec::new(xyah[0] - w / 2.0, xyah[1] - xyah[3] / 2.0, w, xyah[3])
}

/// Integer pixel corners `[x1, y1, x2, y2]` of a tlbr box, truncating.
pub fn pixel_corners(tlbr: &BoxVec) -> [i32; 4] {
    [tlbr[0] as i32, tlbr[1] as i32, tlbr[2] as i32, tlbr[3] as i32]
}

/// Integer `[x, y, w, h]` from integer corners.
pub fn corners_to_xywh(corners: [i32; 4]) -> [i32; 4] {
    let [x1, y1, x2, y2] = corners;
    [x1, y1, x2 - x1, y2 - y1]
}

/// Integer corners from integer `[x, y, w, h]`.
pub fn xywh_to_corners(xywh: [i32; 4]) -> [i32; 4] {
    let [x, y, w, h] = xywh;
    [x, y, x + w, y + h]
}

/// IoU between two tlbr boxes. Degenerate unions yield 0.
pub fn iou_tlbr(a: &BoxVec, b: &BoxVec) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let a_area = (a[2] - a[0]) * (a[3] - a[1]);
    let b_area = (b[2] - b[0]) * (b[3] - b[1]);
    let union = a_area + b_area - inter_area;

    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// IoU between two tlwh boxes.
pub fn iou_tlwh(a: &BoxVec, b: &BoxVec) -> f32 {
    iou_tlbr(&tlwh_to_tlbr(a), &tlwh_to_tlbr(b))
}

/// Greedy non-max suppression over tlwh boxes, returning kept indices in
/// descending score order.
pub fn nms(boxes: &[BoxVec], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    idxs.sort_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut keep = Vec::new();
    while let Some((&i, rest)) = idxs.split_first() {
        keep.push(i);
        idxs = rest
            .iter()
            .copied()
            .filter(|&j| iou_tlwh(&boxes[i], &boxes[j]) <= iou_thresh)
            .collect();
    }
    keep
}
