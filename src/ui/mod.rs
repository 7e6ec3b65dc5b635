//! UI layer - line-oriented rendering of step frames

mod format;
mod spinner;
mod terminal;

pub use format::{
    format_footer, format_line, format_report, truncate_visible, FailureReport, FooterStatus,
    LineStatus, Palette, Tone, TITLE_COLUMN,
};
pub use spinner::Spinner;
pub use terminal::TerminalRenderer;

use anyhow::Result;

/// Width assumed when the terminal size is unknown
pub const DEFAULT_WIDTH: usize = 80;

/// Draws fully formatted lines into the frame of the current step.
///
/// A frame is an optional header, `rows` task lines and an optional footer.
/// Rows are addressed by index; the renderer owns the cursor protocol.
pub trait Renderer {
    fn begin_frame(&mut self, rows: usize, has_header: bool, has_footer: bool) -> Result<()>;
    fn draw_line(&mut self, row: usize, line: &str) -> Result<()>;
    fn draw_header(&mut self, line: &str) -> Result<()>;
    fn draw_footer(&mut self, line: &str) -> Result<()>;
    /// Leave the frame; `collapse` erases everything below its first line
    fn end_frame(&mut self, collapse: bool) -> Result<()>;
    fn width(&self) -> usize;
}

/// Renderer that draws nothing, for headless runs
#[derive(Debug, Clone, Copy)]
pub struct NullRenderer {
    width: usize,
}

impl NullRenderer {
    pub fn new() -> Self {
        Self {
            width: DEFAULT_WIDTH,
        }
    }
}

impl Default for NullRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for NullRenderer {
    fn begin_frame(&mut self, _rows: usize, _has_header: bool, _has_footer: bool) -> Result<()> {
        Ok(())
    }

    fn draw_line(&mut self, _row: usize, _line: &str) -> Result<()> {
        Ok(())
    }

    fn draw_header(&mut self, _line: &str) -> Result<()> {
        Ok(())
    }

    fn draw_footer(&mut self, _line: &str) -> Result<()> {
        Ok(())
    }

    fn end_frame(&mut self, _collapse: bool) -> Result<()> {
        Ok(())
    }

    fn width(&self) -> usize {
        self.width
    }
}
