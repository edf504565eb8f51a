//! Overwrite-in-place progress rendering.
//!
//! Progress is drawn on an interactive terminal by rewriting one line over
//! and over: emit the text, pad with spaces to rub out a longer previous
//! render, then emit backspaces so the cursor returns to the start of the
//! line, ready for the next frame. No cursor-addressing escape codes, so it
//! works on anything that honors `\x08`.

/// Renders successive progress frames over one terminal line.
#[derive(Debug, Default)]
pub struct Overwriter {
    /// Visible width of the previous frame.
    prev_width: usize,
}

impl Overwriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the byte sequence that replaces the previous frame with
    /// `text` and leaves the cursor at the start of the line.
    pub fn frame(&mut self, text: &str) -> String {
        let width = text.chars().count();
        let mut out = String::from(text);
        if width < self.prev_width {
            // Rub out the tail of the longer previous frame.
            for _ in width..self.prev_width {
                out.push(' ');
            }
        }
        let written = out.chars().count();
        for _ in 0..written {
            out.push('\u{8}');
        }
        self.prev_width = width;
        out
    }

    /// Blank whatever frame is currently visible.
    pub fn finish(&mut self) -> String {
        let frame = self.frame("");
        self.prev_width = 0;
        frame
    }
}
