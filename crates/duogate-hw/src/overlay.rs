//! Status overlay drawn onto the preview frame: ROI outline plus a
//! three-segment status bar (barcode, face, authorized).

use crate::frame::{Frame, Roi};

const ROI_LINE: u8 = 255;
const ROI_THICKNESS: u32 = 2;
const BAR_HEIGHT: u32 = 12;
const BAR_ON: u8 = 255;
const BAR_OFF: u8 = 40;

/// Factor flags to render on the status bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStatus {
    pub barcode_ok: bool,
    pub face_ok: bool,
    pub scanning: bool,
}

/// Outline `roi` on the frame.
pub fn draw_roi(frame: &mut Frame, roi: &Roi) {
    let roi = roi.clamp_to(frame.width, frame.height);
    if roi.width == 0 || roi.height == 0 {
        return;
    }
    let t = ROI_THICKNESS.min(roi.width).min(roi.height);

    fill(frame, &Roi { height: t, ..roi }, ROI_LINE);
    fill(frame, &Roi { y: roi.y + roi.height - t, height: t, ..roi }, ROI_LINE);
    fill(frame, &Roi { width: t, ..roi }, ROI_LINE);
    fill(frame, &Roi { x: roi.x + roi.width - t, width: t, ..roi }, ROI_LINE);
}

/// Draw the status bar along the top edge. The third segment lights only
/// when both factors hold.
pub fn draw_status_bar(frame: &mut Frame, status: OverlayStatus) {
    let height = BAR_HEIGHT.min(frame.height);
    let segment = frame.width / 3;
    if segment == 0 || height == 0 || (!status.scanning && !status.barcode_ok && !status.face_ok) {
        return;
    }

    let lit = [
        status.barcode_ok,
        status.face_ok,
        status.barcode_ok && status.face_ok,
    ];
    for (i, on) in lit.into_iter().enumerate() {
        let region = Roi {
            x: i as u32 * segment,
            y: 0,
            width: segment,
            height,
        };
        fill(frame, &region, if on { BAR_ON } else { BAR_OFF });
    }
}

fn fill(frame: &mut Frame, region: &Roi, value: u8) {
    let region = region.clamp_to(frame.width, frame.height);
    let w = frame.width as usize;
    for y in region.y..region.y + region.height {
        let start = y as usize * w + region.x as usize;
        let end = start + region.width as usize;
        if let Some(row) = frame.data.get_mut(start..end) {
            row.fill(value);
        }
    }
}
