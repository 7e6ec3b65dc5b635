//! Spinner shown in front of running tasks

const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

#[derive(Debug, Clone, Default)]
pub struct Spinner {
    index: usize,
}

impl Spinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one frame
    pub fn next(&mut self) -> &'static str {
        self.index = (self.index + 1) % FRAMES.len();
        self.current()
    }

    pub fn current(&self) -> &'static str {
        FRAMES[self.index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles() {
        let mut spinner = Spinner::new();
        let first = spinner.current();
        for _ in 0..FRAMES.len() - 1 {
            assert_ne!(spinner.next(), first);
        }
        assert_eq!(spinner.next(), first);
    }
}
