//! Output decoding for the two reference model families.
//!
//! Both decoders are pure functions over a flat tensor and its shape so they
//! can be exercised without loading a model.

use anyhow::{anyhow, Result};

use crate::detect::preprocess::Letterbox;
use crate::detect::result::{BoundingBox, Detection};

/// Decode a YOLOv8-style head: `(1, 4 + C, N)` or `(1, N, 4 + C)`.
///
/// Each candidate carries `cx, cy, w, h` in letterboxed input space followed by
/// one score per class; the arg-max class wins. Candidates scoring below
/// `min_confidence` are dropped here to keep the result small.
pub fn decode_yolo(
    data: &[f32],
    shape: &[usize],
    letterbox: &Letterbox,
    frame_width: u32,
    frame_height: u32,
    min_confidence: f32,
) -> Result<Vec<Detection>> {
    let dims: Vec<usize> = shape.iter().copied().skip_while(|&d| d == 1).collect();
    let &[d0, d1] = dims.as_slice() else {
        return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
    };
    if d0 * d1 != data.len() {
        return Err(anyhow!(
            "YOLO output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            d0 * d1
        ));
    }

    // Attributes are the short axis (84 vs 8400 for an 80-class model).
    let attributes_first = d0 < d1;
    let (attributes, candidates) = if attributes_first { (d0, d1) } else { (d1, d0) };
    if attributes < 5 {
        return Err(anyhow!("YOLO output has only {} attributes", attributes));
    }
    let at = |candidate: usize, attribute: usize| -> f32 {
        if attributes_first {
            data[attribute * candidates + candidate]
        } else {
            data[candidate * attributes + attribute]
        }
    };

    let mut detections = Vec::new();
    for i in 0..candidates {
        let (class_id, confidence) = (4..attributes)
            .map(|a| (a - 4, at(i, a)))
            .fold((0usize, f32::NEG_INFINITY), |best, next| {
                if next.1 > best.1 {
                    next
                } else {
                    best
                }
            });
        if !confidence.is_finite() || confidence < min_confidence {
            continue;
        }
        let input_box = BoundingBox::from_center(at(i, 0), at(i, 1), at(i, 2), at(i, 3));
        detections.push(Detection {
            class_id: class_id as u32,
            confidence,
            bbox: letterbox.unmap(input_box).clamp_to(frame_width, frame_height),
        });
    }
    Ok(detections)
}

/// Decode an SSD detection-output head: `(1, 1, N, 7)` rows of
/// `[image_id, class, confidence, x1, y1, x2, y2]` with normalised corners.
pub fn decode_ssd(
    data: &[f32],
    shape: &[usize],
    frame_width: u32,
    frame_height: u32,
    min_confidence: f32,
) -> Result<Vec<Detection>> {
    if shape.last() != Some(&7) || data.len() % 7 != 0 {
        return Err(anyhow!(
            "unexpected SSD output shape {:?} ({} values)",
            shape,
            data.len()
        ));
    }
    let w = frame_width as f32;
    let h = frame_height as f32;

    let detections = data
        .chunks_exact(7)
        .filter(|row| row[1] >= 0.0 && row[2] >= min_confidence)
        .map(|row| Detection {
            class_id: row[1] as u32,
            confidence: row[2],
            bbox: BoundingBox::new(row[3] * w, row[4] * h, row[5] * w, row[6] * h)
                .clamp_to(frame_width, frame_height),
        })
        .collect();
    Ok(detections)
}
