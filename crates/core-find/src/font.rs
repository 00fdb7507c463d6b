//! Built-in 5x7 glyph atlas.
//!
//! The text recognizers compare candidate character cells against rendered
//! reference glyphs, and the tests render their own text fixtures with the
//! same atlas so recognition is exercised end to end without binary
//! fixtures. Glyphs cover the digits and the Latin letters; lowercase input
//! renders through the uppercase forms.
//!
//! Each glyph is five column bytes, least significant bit at the top row:
//! the classic dot-matrix layout.

use image::{GrayImage, Luma, Rgb, RgbImage};

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;
/// Blank columns inserted between rendered glyphs.
pub const GLYPH_SPACING: u32 = 1;

/// The recognizable character set, in atlas order.
pub const ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[rustfmt::skip]
const GLYPHS: [[u8; 5]; 36] = [
    [0x3E, 0x51, 0x49, 0x45, 0x3E], // 0
    [0x00, 0x42, 0x7F, 0x40, 0x00], // 1
    [0x42, 0x61, 0x51, 0x49, 0x46], // 2
    [0x21, 0x41, 0x45, 0x4B, 0x31], // 3
    [0x18, 0x14, 0x12, 0x7F, 0x10], // 4
    [0x27, 0x45, 0x45, 0x45, 0x39], // 5
    [0x3C, 0x4A, 0x49, 0x49, 0x30], // 6
    [0x01, 0x71, 0x09, 0x05, 0x03], // 7
    [0x36, 0x49, 0x49, 0x49, 0x36], // 8
    [0x06, 0x49, 0x49, 0x29, 0x1E], // 9
    [0x7E, 0x11, 0x11, 0x11, 0x7E], // A
    [0x7F, 0x49, 0x49, 0x49, 0x36], // B
    [0x3E, 0x41, 0x41, 0x41, 0x22], // C
    [0x7F, 0x41, 0x41, 0x22, 0x1C], // D
    [0x7F, 0x49, 0x49, 0x49, 0x41], // E
    [0x7F, 0x09, 0x09, 0x09, 0x01], // F
    [0x3E, 0x41, 0x49, 0x49, 0x7A], // G
    [0x7F, 0x08, 0x08, 0x08, 0x7F], // H
    [0x00, 0x41, 0x7F, 0x41, 0x00], // I
    [0x20, 0x40, 0x41, 0x3F, 0x01], // J
    [0x7F, 0x08, 0x14, 0x22, 0x41], // K
    [0x7F, 0x40, 0x40, 0x40, 0x40], // L
    [0x7F, 0x02, 0x0C, 0x02, 0x7F], // M
    [0x7F, 0x04, 0x08, 0x10, 0x7F], // N
    [0x3E, 0x41, 0x41, 0x41, 0x3E], // O
    [0x7F, 0x09, 0x09, 0x09, 0x06], // P
    [0x3E, 0x41, 0x51, 0x21, 0x5E], // Q
    [0x7F, 0x09, 0x19, 0x29, 0x46], // R
    [0x46, 0x49, 0x49, 0x49, 0x31], // S
    [0x01, 0x01, 0x7F, 0x01, 0x01], // T
    [0x3F, 0x40, 0x40, 0x40, 0x3F], // U
    [0x1F, 0x20, 0x40, 0x20, 0x1F], // V
    [0x3F, 0x40, 0x38, 0x40, 0x3F], // W
    [0x63, 0x14, 0x08, 0x14, 0x63], // X
    [0x07, 0x08, 0x70, 0x08, 0x07], // Y
    [0x61, 0x51, 0x49, 0x45, 0x43], // Z
];

/// Column bytes of a character, if it is in the atlas. Lowercase letters map
/// onto their uppercase glyphs.
pub fn glyph(ch: char) -> Option<&'static [u8; 5]> {
    let ch = ch.to_ascii_uppercase();
    ALPHABET.find(ch).map(|index| &GLYPHS[index])
}

/// Render one glyph as a grayscale cell, foreground 255 on background 0,
/// magnified by `scale`.
pub fn render_glyph(ch: char, scale: u32) -> Option<GrayImage> {
    let columns = glyph(ch)?;
    let scale = scale.max(1);
    let mut cell = GrayImage::new(GLYPH_WIDTH * scale, GLYPH_HEIGHT * scale);
    for (col, bits) in columns.iter().enumerate() {
        for row in 0..GLYPH_HEIGHT {
            if bits >> row & 1 == 1 {
                for sy in 0..scale {
                    for sx in 0..scale {
                        cell.put_pixel(col as u32 * scale + sx, row * scale + sy, Luma([255]));
                    }
                }
            }
        }
    }
    Some(cell)
}

/// Render a line of text as dark glyphs on a light background, surrounded by
/// `margin` background pixels. Characters outside the atlas render as blank
/// cells.
pub fn render_text(text: &str, scale: u32, margin: u32) -> RgbImage {
    let scale = scale.max(1);
    let chars: Vec<char> = text.chars().collect();
    let advance = (GLYPH_WIDTH + GLYPH_SPACING) * scale;
    let width = chars.len() as u32 * advance + 2 * margin;
    let height = GLYPH_HEIGHT * scale + 2 * margin;
    let mut canvas = RgbImage::from_pixel(width.max(1), height, Rgb([255, 255, 255]));
    for (i, ch) in chars.iter().enumerate() {
        if let Some(cell) = render_glyph(*ch, scale) {
            let ox = margin + i as u32 * advance;
            for (x, y, pixel) in cell.enumerate_pixels() {
                if pixel[0] > 0 {
                    canvas.put_pixel(ox + x, margin + y, Rgb([0, 0, 0]));
                }
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atlas_covers_digits_and_letters() {
        for ch in ALPHABET.chars() {
            assert!(glyph(ch).is_some(), "missing glyph for {ch}");
        }
        assert!(glyph('a').is_some(), "lowercase maps onto uppercase");
        assert!(glyph('!').is_none());
    }

    #[test]
    fn rendered_glyphs_have_ink() {
        for ch in ALPHABET.chars() {
            let cell = render_glyph(ch, 1).unwrap();
            let ink = cell.pixels().filter(|p| p[0] > 0).count();
            assert!(ink > 3, "glyph {ch} is nearly empty");
        }
    }

    #[test]
    fn distinct_glyphs_render_differently() {
        let o = render_glyph('O', 1).unwrap();
        let x = render_glyph('X', 1).unwrap();
        assert_ne!(o.as_raw(), x.as_raw());
    }

    #[test]
    fn text_line_has_expected_geometry() {
        let img = render_text("AB", 2, 4);
        assert_eq!(img.height(), 7 * 2 + 8);
        assert_eq!(img.width(), 2 * (5 + 1) * 2 + 8);
        let dark = img.pixels().filter(|p| p[0] < 128).count();
        assert!(dark > 0);
    }
}
