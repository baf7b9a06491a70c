//! Frame annotation: rectangles, progress bars and a tiny 3x5 bitmap font.

use crate::debounce::{progress_percent, Verdict};
use crate::types::{Employee, FaceRegion};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const LIGHT_YELLOW: Rgb<u8> = Rgb([255, 255, 153]);

const GLYPH_W: i64 = 3;
const GLYPH_H: i64 = 5;
const TEXT_SCALE: i64 = 3;
const BOX_THICKNESS: i64 = 2;

/// What the annotator needs to know about one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionLabel<'a> {
    pub region: FaceRegion,
    pub verdict: Verdict,
    /// Directory entry for a stable recognition, if resolved.
    pub employee: Option<&'a Employee>,
}

/// Draw every region's rectangle and verdict-dependent overlay onto `img`.
pub fn annotate(img: &mut RgbImage, labels: &[RegionLabel<'_>], stabilization_count: u32) {
    for label in labels {
        let r = label.region;
        let (x, y, w, h) = (r.x as i64, r.y as i64, r.width as i64, r.height as i64);
        draw_rect_outline(img, x, y, w, h, BOX_THICKNESS, RED);

        match label.verdict {
            Verdict::Suppressed => {}
            Verdict::Unrecognized => {
                draw_text(img, x, y - text_height() - 4, "UNKNOWN", RED);
            }
            Verdict::Accumulating { hits, .. } => {
                let pct = progress_percent(hits, stabilization_count);
                draw_text(img, x + 20, y + h + 8, &format!("{pct} %"), WHITE);
                let bar_y = y + h + 8 + text_height() + 6;
                draw_rect_outline(img, x, bar_y, w, 10, BOX_THICKNESS, RED);
                let filled = w * pct as i64 / 100;
                fill_rect(img, x, bar_y, filled, 10, WHITE);
            }
            Verdict::Stable { identity } => {
                let text = match label.employee {
                    Some(e) => format!("{} | {}", e.name, e.role),
                    None => identity.to_string(),
                };
                draw_text(img, x - 10, y - text_height() - 4, &text, LIGHT_YELLOW);
            }
        }
    }
}

pub fn text_height() -> i64 {
    GLYPH_H * TEXT_SCALE
}

pub fn text_width(text: &str) -> i64 {
    text.chars().count() as i64 * (GLYPH_W + 1) * TEXT_SCALE
}

pub fn fill_rect(img: &mut RgbImage, x: i64, y: i64, w: i64, h: i64, color: Rgb<u8>) {
    if w <= 0 || h <= 0 {
        return;
    }
    let rect = Rect::at(x as i32, y as i32).of_size(w as u32, h as u32);
    draw_filled_rect_mut(img, rect, color);
}

/// Outline `t` pixels thick, drawn inward from the outer edge.
pub fn draw_rect_outline(img: &mut RgbImage, x: i64, y: i64, w: i64, h: i64, t: i64, color: Rgb<u8>) {
    for i in 0..t {
        let (iw, ih) = (w - 2 * i, h - 2 * i);
        if iw <= 0 || ih <= 0 {
            break;
        }
        let rect = Rect::at((x + i) as i32, (y + i) as i32).of_size(iw as u32, ih as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

/// Render `text` in the 3x5 bitmap font (upper-cased) with its top-left at (x, y).
pub fn draw_text(img: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>) {
    let mut cx = x;
    for c in text.chars() {
        let rows = glyph(c);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if (bits >> (GLYPH_W - 1 - col)) & 1 == 1 {
                    fill_rect(
                        img,
                        cx + col * TEXT_SCALE,
                        y + row as i64 * TEXT_SCALE,
                        TEXT_SCALE,
                        TEXT_SCALE,
                        color,
                    );
                }
            }
        }
        cx += (GLYPH_W + 1) * TEXT_SCALE;
    }
}

fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0x2, 0x5, 0x7, 0x5, 0x5],
        'B' => [0x6, 0x5, 0x6, 0x5, 0x6],
        'C' => [0x3, 0x4, 0x4, 0x4, 0x3],
        'D' => [0x6, 0x5, 0x5, 0x5, 0x6],
        'E' => [0x7, 0x4, 0x6, 0x4, 0x7],
        'F' => [0x7, 0x4, 0x6, 0x4, 0x4],
        'G' => [0x3, 0x4, 0x5, 0x5, 0x3],
        'H' => [0x5, 0x5, 0x7, 0x5, 0x5],
        'I' => [0x7, 0x2, 0x2, 0x2, 0x7],
        'J' => [0x1, 0x1, 0x1, 0x5, 0x2],
        'K' => [0x5, 0x5, 0x6, 0x5, 0x5],
        'L' => [0x4, 0x4, 0x4, 0x4, 0x7],
        'M' => [0x5, 0x7, 0x7, 0x5, 0x5],
        'N' => [0x6, 0x5, 0x5, 0x5, 0x5],
        'O' => [0x2, 0x5, 0x5, 0x5, 0x2],
        'P' => [0x6, 0x5, 0x6, 0x4, 0x4],
        'Q' => [0x2, 0x5, 0x5, 0x6, 0x3],
        'R' => [0x6, 0x5, 0x6, 0x5, 0x5],
        'S' => [0x3, 0x4, 0x2, 0x1, 0x6],
        'T' => [0x7, 0x2, 0x2, 0x2, 0x2],
        'U' => [0x5, 0x5, 0x5, 0x5, 0x7],
        'V' => [0x5, 0x5, 0x5, 0x5, 0x2],
        'W' => [0x5, 0x5, 0x7, 0x7, 0x5],
        'X' => [0x5, 0x5, 0x2, 0x5, 0x5],
        'Y' => [0x5, 0x5, 0x2, 0x2, 0x2],
        'Z' => [0x7, 0x1, 0x2, 0x4, 0x7],
        '0' => [0x7, 0x5, 0x5, 0x5, 0x7],
        '1' => [0x2, 0x6, 0x2, 0x2, 0x7],
        '2' => [0x7, 0x1, 0x7, 0x4, 0x7],
        '3' => [0x7, 0x1, 0x7, 0x1, 0x7],
        '4' => [0x5, 0x5, 0x7, 0x1, 0x1],
        '5' => [0x7, 0x4, 0x7, 0x1, 0x7],
        '6' => [0x7, 0x4, 0x7, 0x5, 0x7],
        '7' => [0x7, 0x1, 0x2, 0x4, 0x4],
        '8' => [0x7, 0x5, 0x7, 0x5, 0x7],
        '9' => [0x7, 0x5, 0x7, 0x1, 0x7],
        ' ' => [0x0, 0x0, 0x0, 0x0, 0x0],
        '%' => [0x5, 0x1, 0x2, 0x4, 0x5],
        '|' => [0x2, 0x2, 0x2, 0x2, 0x2],
        '-' => [0x0, 0x0, 0x7, 0x0, 0x0],
        '.' => [0x0, 0x0, 0x0, 0x0, 0x2],
        ':' => [0x0, 0x2, 0x0, 0x2, 0x0],
        '\'' => [0x2, 0x2, 0x0, 0x0, 0x0],
        _ => [0x7, 0x7, 0x7, 0x7, 0x7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmployeeId;

    fn region() -> FaceRegion {
        FaceRegion { x: 40, y: 40, width: 60, height: 60 }
    }

    fn count(img: &RgbImage, color: Rgb<u8>) -> usize {
        img.pixels().filter(|p| **p == color).count()
    }

    #[test]
    fn test_rect_outline_corners() {
        let mut img = RgbImage::new(20, 20);
        draw_rect_outline(&mut img, 2, 2, 10, 10, 1, RED);
        assert_eq!(*img.get_pixel(2, 2), RED);
        assert_eq!(*img.get_pixel(11, 11), RED);
        assert_eq!(*img.get_pixel(6, 6), Rgb([0, 0, 0]));
        // perimeter of a 10x10 box, 1px thick
        assert_eq!(count(&img, RED), 36);
    }

    #[test]
    fn test_thick_outline_leaves_interior_empty() {
        let mut img = RgbImage::new(20, 20);
        draw_rect_outline(&mut img, 0, 0, 10, 10, 2, RED);
        assert_eq!(*img.get_pixel(1, 1), RED);
        assert_eq!(*img.get_pixel(8, 5), RED);
        assert_eq!(*img.get_pixel(2, 2), Rgb([0, 0, 0]));
        // 100 - 6x6 interior
        assert_eq!(count(&img, RED), 64);
    }

    #[test]
    fn test_empty_progress_fill_draws_nothing() {
        let mut img = RgbImage::new(20, 20);
        fill_rect(&mut img, 2, 2, 0, 10, WHITE);
        assert_eq!(count(&img, WHITE), 0);
    }

    #[test]
    fn test_drawing_clips_at_edges() {
        let mut img = RgbImage::new(8, 8);
        fill_rect(&mut img, -4, -4, 100, 100, WHITE);
        draw_text(&mut img, -50, 6, "HELLO", RED);
        assert_eq!(count(&img, WHITE) + count(&img, RED), 64);
    }

    #[test]
    fn test_unknown_label_drawn_in_red_above_box() {
        let mut img = RgbImage::new(200, 200);
        let labels = [RegionLabel { region: region(), verdict: Verdict::Unrecognized, employee: None }];
        annotate(&mut img, &labels, 30);
        let above = (0..40u32).flat_map(|y| (0..200u32).map(move |x| (x, y)));
        assert!(above.into_iter().any(|(x, y)| *img.get_pixel(x, y) == RED));
    }

    #[test]
    fn test_progress_bar_fill_tracks_hits() {
        let verdict = |hits| Verdict::Accumulating { identity: EmployeeId(1), hits, progress_percent: 0 };
        let mut half = RgbImage::new(200, 200);
        annotate(&mut half, &[RegionLabel { region: region(), verdict: verdict(15), employee: None }], 30);
        let mut full = RgbImage::new(200, 200);
        annotate(&mut full, &[RegionLabel { region: region(), verdict: verdict(29), employee: None }], 30);
        assert!(count(&full, WHITE) > count(&half, WHITE));
    }

    #[test]
    fn test_suppressed_draws_only_rectangle() {
        let mut img = RgbImage::new(200, 200);
        annotate(&mut img, &[RegionLabel { region: region(), verdict: Verdict::Suppressed, employee: None }], 30);
        assert_eq!(count(&img, WHITE), 0);
        assert_eq!(count(&img, LIGHT_YELLOW), 0);
        assert!(count(&img, RED) > 0);
    }

    #[test]
    fn test_stable_label_uses_employee_name() {
        let employee = Employee { id: EmployeeId(7), name: "Ana".into(), role: "Ops".into(), active: true };
        let mut img = RgbImage::new(200, 200);
        annotate(
            &mut img,
            &[RegionLabel { region: region(), verdict: Verdict::Stable { identity: EmployeeId(7) }, employee: Some(&employee) }],
            30,
        );
        assert!(count(&img, LIGHT_YELLOW) > 0);
    }

    #[test]
    fn test_text_width() {
        assert_eq!(text_width("AB"), 2 * 4 * 3);
        assert_eq!(text_height(), 15);
    }
}
