/// Frame Annotator — draws classification results onto a frame copy
///
/// Authorized faces get a thin green box, unauthorized faces a thicker red
/// box plus an `ALERT` tag underneath. Labels sit in a filled bar above the
/// box. Output is a pure function of the input frame and faces.

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::camera_capture::Frame;
use crate::camera_config::AnnotationConfig;
use crate::face_classifier::{ClassifiedFace, ClassifiedFrame};

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const AUTHORIZED_THICKNESS: u32 = 2;
const UNAUTHORIZED_THICKNESS: u32 = 3;
const BAR_HEIGHT: u32 = 20;
const BAR_PADDING: u32 = 4;
const TEXT_SCALE: f32 = 16.0;
// Glyph advance estimate when no font could be loaded.
const FALLBACK_CHAR_WIDTH: u32 = 9;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Clone, Default)]
pub struct FrameAnnotator {
    font: Option<FontArc>,
}

impl FrameAnnotator {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Load a TrueType/OpenType font from disk.
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        match FontArc::try_from_vec(bytes) {
            Ok(font) => Some(Self::new(Some(font))),
            Err(e) => {
                warn!("Invalid font {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Configured font first, then a handful of common system fonts.
    pub fn from_config(cfg: &AnnotationConfig) -> Self {
        let candidates = cfg
            .font_path
            .iter()
            .cloned()
            .chain(SYSTEM_FONTS.iter().map(|p| PathBuf::from(*p)));

        for path in candidates {
            if let Some(annotator) = Self::load(&path) {
                info!("Annotation font loaded from {}", path.display());
                return annotator;
            }
        }
        warn!("No annotation font found; labels are drawn without text");
        Self::new(None)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn annotate(&self, frame: &Frame, faces: &ClassifiedFrame) -> Frame {
        let mut out = frame.clone();

        for face in &faces.authorized {
            self.draw_face(&mut out, face, GREEN, AUTHORIZED_THICKNESS, false);
        }
        for face in &faces.unauthorized {
            self.draw_face(&mut out, face, RED, UNAUTHORIZED_THICKNESS, true);
        }
        out
    }

    fn draw_face(
        &self,
        img: &mut Frame,
        face: &ClassifiedFace,
        color: Rgb<u8>,
        thickness: u32,
        alert: bool,
    ) {
        let Some(rect) = clamp_box(face, img.width(), img.height()) else {
            return;
        };

        for t in 0..thickness {
            let (w, h) = (rect.width(), rect.height());
            if w <= 2 * t || h <= 2 * t {
                break;
            }
            let inner = Rect::at(rect.left() + t as i32, rect.top() + t as i32)
                .of_size(w - 2 * t, h - 2 * t);
            draw_hollow_rect_mut(img, inner, color);
        }

        let label = face_label(face);
        let bar_y = rect.top() - BAR_HEIGHT as i32;
        self.draw_bar(img, rect.left(), bar_y.max(0), &label, color);

        if alert {
            let tag_y = rect.bottom() + 2;
            self.draw_bar(img, rect.left(), tag_y, "ALERT", RED);
        }
    }

    fn draw_bar(&self, img: &mut Frame, x: i32, y: i32, text: &str, color: Rgb<u8>) {
        if y >= img.height() as i32 {
            return;
        }
        let scale = PxScale::from(TEXT_SCALE);
        let text_width = match &self.font {
            Some(font) => text_size(scale, font, text).0,
            None => text.chars().count() as u32 * FALLBACK_CHAR_WIDTH,
        };

        let bar = Rect::at(x, y).of_size(text_width + 2 * BAR_PADDING, BAR_HEIGHT);
        draw_filled_rect_mut(img, bar, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                img,
                WHITE,
                x + BAR_PADDING as i32,
                y + 2,
                scale,
                font,
                text,
            );
        }
    }
}

fn face_label(face: &ClassifiedFace) -> String {
    match (face.classification.is_authorized(), &face.subject, face.similarity) {
        (_, Some(subject), Some(sim)) => format!("{} ({:.1}%)", subject, sim * 100.0),
        (_, Some(subject), None) => subject.clone(),
        (true, None, _) => "AUTHORIZED".to_string(),
        (false, None, _) => "UNAUTHORIZED".to_string(),
    }
}

/// Clip a face box to the frame; `None` when nothing visible remains.
fn clamp_box(face: &ClassifiedFace, width: u32, height: u32) -> Option<Rect> {
    let b = face.face_box;
    let x1 = b.x_min.clamp(0, width as i32);
    let y1 = b.y_min.clamp(0, height as i32);
    let x2 = b.x_max.clamp(0, width as i32);
    let y2 = b.y_max.clamp(0, height as i32);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face_classifier::FaceClassifier;
    use crate::face_recognition::{FaceBox, RawDetection, SubjectMatch};
    use image::RgbImage;

    fn detection(b: FaceBox, subject: Option<(&str, f64)>) -> RawDetection {
        RawDetection {
            face_box: b,
            subjects: subject
                .map(|(s, sim)| {
                    vec![SubjectMatch {
                        subject: s.into(),
                        similarity: sim,
                    }]
                })
                .unwrap_or_default(),
            age: None,
            gender: None,
        }
    }

    fn classified(dets: Vec<RawDetection>) -> ClassifiedFrame {
        FaceClassifier::new(0.85).classify(dets)
    }

    #[test]
    fn test_authorized_box_is_green_two_px() {
        let frame = RgbImage::new(200, 200);
        let faces = classified(vec![detection(
            FaceBox::new(50, 60, 150, 160),
            Some(("alice", 0.95)),
        )]);
        let out = FrameAnnotator::new(None).annotate(&frame, &faces);

        assert_eq!(*out.get_pixel(50, 100), GREEN);
        assert_eq!(*out.get_pixel(51, 100), GREEN);
        assert_eq!(*out.get_pixel(52, 100), Rgb([0, 0, 0]));
        // label bar sits above the box
        assert_eq!(*out.get_pixel(52, 45), GREEN);
        // nothing below the box
        assert_eq!(*out.get_pixel(55, 170), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_unauthorized_box_is_red_with_alert_tag() {
        let frame = RgbImage::new(200, 200);
        let faces = classified(vec![detection(FaceBox::new(50, 60, 150, 160), None)]);
        let out = FrameAnnotator::new(None).annotate(&frame, &faces);

        assert_eq!(*out.get_pixel(52, 100), RED);
        assert_eq!(*out.get_pixel(53, 100), Rgb([0, 0, 0]));
        // ALERT tag under the box
        assert_eq!(*out.get_pixel(55, 170), RED);
    }

    #[test]
    fn test_input_frame_is_untouched() {
        let frame = RgbImage::new(64, 64);
        let faces = classified(vec![detection(FaceBox::new(5, 25, 40, 60), None)]);
        let _ = FrameAnnotator::new(None).annotate(&frame, &faces);
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_annotation_is_deterministic() {
        let frame = RgbImage::from_fn(120, 90, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 7]));
        let faces = classified(vec![
            detection(FaceBox::new(10, 30, 50, 80), Some(("alice", 0.9))),
            detection(FaceBox::new(60, 25, 110, 70), Some(("bob", 0.3))),
        ]);
        let annotator = FrameAnnotator::new(None);
        assert_eq!(
            annotator.annotate(&frame, &faces).as_raw(),
            annotator.annotate(&frame, &faces).as_raw()
        );
    }

    #[test]
    fn test_no_faces_is_identity() {
        let frame = RgbImage::from_pixel(32, 32, Rgb([9, 9, 9]));
        let out = FrameAnnotator::new(None).annotate(&frame, &ClassifiedFrame::default());
        assert_eq!(out.as_raw(), frame.as_raw());
    }

    #[test]
    fn test_out_of_frame_boxes_are_clamped_or_skipped() {
        let frame = RgbImage::new(100, 100);
        let faces = classified(vec![
            detection(FaceBox::new(-20, -20, 300, 300), None),
            detection(FaceBox::new(500, 500, 600, 600), None),
            detection(FaceBox::new(40, 40, 40, 90), None),
        ]);
        let out = FrameAnnotator::new(None).annotate(&frame, &faces);
        assert_eq!(*out.get_pixel(0, 50), RED);
        assert_eq!(*out.get_pixel(99, 50), RED);
    }

    #[test]
    fn test_labels() {
        let faces = classified(vec![
            detection(FaceBox::new(0, 0, 1, 1), Some(("alice", 0.9))),
            detection(FaceBox::new(0, 0, 1, 1), None),
        ]);
        assert_eq!(face_label(&faces.authorized[0]), "alice (90.0%)");
        assert_eq!(face_label(&faces.unauthorized[0]), "UNAUTHORIZED");
    }

    #[test]
    fn test_missing_font_path_falls_back() {
        assert!(FrameAnnotator::load(Path::new("/nonexistent/font.ttf")).is_none());
    }
}
