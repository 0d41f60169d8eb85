//! Host collaborator interface
//!
//! The processor never renders anything itself. Text, status lines, screen
//! model requests and input all go through a [`Host`].

use std::collections::VecDeque;

use serde::Serialize;

/// Right-hand side of the status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusRight {
    /// Score and turn count
    Score {
        /// Current score
        score: i16,
        /// Turns taken
        turns: u16,
    },
    /// Game clock
    Time {
        /// Hours (0-23)
        hours: u16,
        /// Minutes (0-59)
        minutes: u16,
    },
}

/// Status line contents (v1-3)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    /// Short name of the current location
    pub location: String,
    /// Score or time
    pub right: StatusRight,
}

/// Screen model and sound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScreenCommand {
    /// `split_window`
    SplitWindow(u16),
    /// `set_window`
    SetWindow(u16),
    /// `erase_window` (-1 and -2 have special meanings)
    EraseWindow(i16),
    /// `erase_line`
    EraseLine(u16),
    /// `set_cursor`
    SetCursor {
        /// Line (1-based, negative values hide/show the cursor)
        line: i16,
        /// Column (1-based)
        column: u16,
    },
    /// `set_text_style`
    SetTextStyle(u16),
    /// `buffer_mode`
    BufferMode(bool),
    /// `set_colour`
    SetColour {
        /// Foreground colour number
        foreground: u16,
        /// Background colour number
        background: u16,
    },
    /// `set_true_colour`
    SetTrueColour {
        /// Foreground 15-bit colour
        foreground: u16,
        /// Background 15-bit colour
        background: u16,
    },
    /// `sound_effect`
    SoundEffect {
        /// Sound number (1 and 2 are bleeps)
        number: u16,
        /// Effect (prepare/start/stop/finish)
        effect: u16,
        /// Volume and repeats
        volume: u16,
    },
}

/// Environment the processor prints to and reads from
pub trait Host {
    /// Print text to the screen (stream 1).
    fn print(&mut self, text: &str);

    /// Copy text to the transcript (stream 2).
    fn transcript(&mut self, _text: &str) {}

    /// Redraw the status line.
    fn show_status(&mut self, _status: &StatusLine) {}

    /// Screen model request. Ignored by default.
    fn screen(&mut self, _command: ScreenCommand) {}

    /// Current cursor `(line, column)`.
    fn cursor(&self) -> (u16, u16) {
        (1, 1)
    }

    /// Select a font; returns the previous font, or 0 if unavailable.
    fn set_font(&mut self, font: u16) -> u16 {
        if font == 1 || font == 0 { 1 } else { 0 }
    }

    /// Read a line of at most `max_len` characters. `None` means no input
    /// is available right now.
    fn read_line(&mut self, max_len: usize) -> Option<String>;

    /// Read one key press. `None` means no input is available right now.
    fn read_char(&mut self) -> Option<char>;
}

/// Host that records output and serves queued input
#[derive(Debug, Clone, Default)]
pub struct BufferedHost {
    /// Everything printed to the screen
    pub output: String,
    /// Everything copied to the transcript
    pub transcript: String,
    /// Last status line shown
    pub status: Option<StatusLine>,
    /// Screen requests in order
    pub commands: Vec<ScreenCommand>,
    lines: VecDeque<String>,
    chars: VecDeque<char>,
}

impl BufferedHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line of input.
    pub fn push_line(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push_back(line.into());
        self
    }

    /// Queue a key press.
    pub fn push_char(&mut self, ch: char) -> &mut Self {
        self.chars.push_back(ch);
        self
    }

    /// Take the output collected so far.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

impl Host for BufferedHost {
    fn print(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn transcript(&mut self, text: &str) {
        self.transcript.push_str(text);
    }

    fn show_status(&mut self, status: &StatusLine) {
        self.status = Some(status.clone());
    }

    fn screen(&mut self, command: ScreenCommand) {
        self.commands.push(command);
    }

    fn read_line(&mut self, max_len: usize) -> Option<String> {
        self.lines
            .pop_front()
            .map(|line| line.chars().take(max_len).collect())
    }

    fn read_char(&mut self) -> Option<char> {
        self.chars.pop_front()
    }
}
