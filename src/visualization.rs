use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

use crate::tracker::Track;

/// BGR palette, picked by track id.
const COLORS: &[Scalar] = &[
    Scalar::new(255.0, 0.0, 0.0, 0.0),
    Scalar::new(0.0, 255.0, 0.0, 0.0),
    Scalar::new(0.0, 0.0, 255.0, 0.0),
    Scalar::new(255.0, 255.0, 0.0, 0.0),
    Scalar::new(255.0, 0.0, 255.0, 0.0),
    Scalar::new(0.0, 255.0, 255.0, 0.0),
];

const FONT_SCALE: f64 = 0.9;
const THICKNESS: i32 = 2;
const LABEL_OFFSET: i32 = 10;

/// Everything needed to draw one track, independent of any image.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawInstruction {
    /// `[x1, y1, x2, y2]` in whole pixels.
    pub corners: [i32; 4],
    pub label: String,
    pub label_origin: (i32, i32),
    pub color: Scalar,
}

impl DrawInstruction {
    pub fn for_track(track: &Track) -> Self {
        let corners = track.pixel_corners();
        Self {
            corners,
            label: format!("ID: {}", track.track_id),
            label_origin: (corners[0], corners[1] - LABEL_OFFSET),
            color: COLORS[(track.track_id as usize) % COLORS.len()],
        }
    }

    fn rect(&self) -> Rect {
        let [x1, y1, x2, y2] = self.corners;
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }
}

/// Instructions for the confirmed tracks; unconfirmed ones are skipped.
pub fn draw_instructions(tracks: &[Track]) -> Vec<DrawInstruction> {
    tracks
        .iter()
        .filter(|t| t.confirmed)
        .map(DrawInstruction::for_track)
        .collect()
}

/// Composite `instructions` onto a copy of `image`.
pub fn render(image: &Mat, instructions: &[DrawInstruction]) -> opencv::Result<Mat> {
    let mut canvas = image.try_clone()?;
    for ins in instructions {
        imgproc::rectangle(
            &mut canvas,
            ins.rect(),
            ins.color,
            THICKNESS,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            &mut canvas,
            &ins.label,
            Point::new(ins.label_origin.0, ins.label_origin.1),
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            ins.color,
            THICKNESS,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(canvas)
}
