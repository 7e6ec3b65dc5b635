//! Terminal renderer - draws frames in place with relative cursor moves

use super::{Renderer, DEFAULT_WIDTH};
use anyhow::Result;
use crossterm::{
    cursor::{MoveToNextLine, MoveToPreviousLine},
    queue,
    style::Print,
    terminal::{self, Clear, ClearType},
};
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    rows: usize,
    has_header: bool,
    has_footer: bool,
}

impl Frame {
    fn header_lines(&self) -> usize {
        usize::from(self.has_header)
    }

    fn height(&self) -> usize {
        self.header_lines() + self.rows + usize::from(self.has_footer)
    }
}

/// Draws into the scrollback region below the cursor.
///
/// The frame is paved with newlines so the cursor rests on the line below
/// it; each draw moves up to the target line and back down again.
pub struct TerminalRenderer<W: Write> {
    out: W,
    frame: Frame,
    width: Option<usize>,
}

impl TerminalRenderer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            frame: Frame::default(),
            width: None,
        }
    }

    /// Fix the width instead of asking the terminal
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = Some(width);
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw_at(&mut self, index: usize, line: &str) -> Result<()> {
        let height = self.frame.height();
        if index >= height {
            return Ok(());
        }
        let up = u16::try_from(height - index).unwrap_or(u16::MAX);
        queue!(
            self.out,
            MoveToPreviousLine(up),
            Clear(ClearType::CurrentLine),
            Print(line),
            MoveToNextLine(up)
        )?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Renderer for TerminalRenderer<W> {
    fn begin_frame(&mut self, rows: usize, has_header: bool, has_footer: bool) -> Result<()> {
        self.frame = Frame {
            rows,
            has_header,
            has_footer,
        };
        queue!(self.out, Print("\n".repeat(self.frame.height())))?;
        self.out.flush()?;
        Ok(())
    }

    fn draw_line(&mut self, row: usize, line: &str) -> Result<()> {
        if row >= self.frame.rows {
            return Ok(());
        }
        self.draw_at(self.frame.header_lines() + row, line)
    }

    fn draw_header(&mut self, line: &str) -> Result<()> {
        if !self.frame.has_header {
            return Ok(());
        }
        self.draw_at(0, line)
    }

    fn draw_footer(&mut self, line: &str) -> Result<()> {
        if !self.frame.has_footer {
            return Ok(());
        }
        self.draw_at(self.frame.height() - 1, line)
    }

    fn end_frame(&mut self, collapse: bool) -> Result<()> {
        let height = self.frame.height();
        let keep = if collapse {
            height.min(1)
        } else if self.frame.has_footer {
            height - 1
        } else {
            height
        };
        if keep < height {
            let up = u16::try_from(height - keep).unwrap_or(u16::MAX);
            queue!(
                self.out,
                MoveToPreviousLine(up),
                Clear(ClearType::FromCursorDown)
            )?;
        }
        self.out.flush()?;
        self.frame = Frame::default();
        Ok(())
    }

    fn width(&self) -> usize {
        self.width.unwrap_or_else(|| {
            terminal::size()
                .map(|(cols, _)| usize::from(cols))
                .ok()
                .filter(|cols| *cols > 0)
                .unwrap_or(DEFAULT_WIDTH)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(renderer: TerminalRenderer<Vec<u8>>) -> String {
        String::from_utf8(renderer.into_inner()).unwrap()
    }

    #[test]
    fn test_frame_is_paved() {
        let mut renderer = TerminalRenderer::new(Vec::new()).with_width(40);
        renderer.begin_frame(2, true, true).unwrap();
        assert_eq!(output(renderer), "\n\n\n\n");
    }

    #[test]
    fn test_rows_address_relative_to_bottom() {
        let mut renderer = TerminalRenderer::new(Vec::new()).with_width(40);
        renderer.begin_frame(2, true, false).unwrap();
        renderer.draw_line(1, "second").unwrap();
        // height 3, row 1 sits below the header: one line up from the bottom
        let out = output(renderer);
        assert!(out.contains("\x1b[1F"));
        assert!(out.contains("second"));
        assert!(out.ends_with("\x1b[1E"));
    }

    #[test]
    fn test_out_of_frame_draws_are_ignored() {
        let mut renderer = TerminalRenderer::new(Vec::new()).with_width(40);
        renderer.begin_frame(1, false, false).unwrap();
        renderer.draw_line(3, "nope").unwrap();
        renderer.draw_header("nope").unwrap();
        renderer.draw_footer("nope").unwrap();
        assert!(!output(renderer).contains("nope"));
    }

    #[test]
    fn test_collapse_keeps_first_line() {
        let mut renderer = TerminalRenderer::new(Vec::new()).with_width(40);
        renderer.begin_frame(3, true, true).unwrap();
        renderer.end_frame(true).unwrap();
        // height 5, everything below the header goes
        assert!(output(renderer).ends_with("\x1b[4F\x1b[J"));
    }

    #[test]
    fn test_width_override() {
        let renderer = TerminalRenderer::new(Vec::new()).with_width(132);
        assert_eq!(renderer.width(), 132);
    }
}
