use std::io::{self, IsTerminal, Stdout, Write};

use crossterm::{
    cursor::{MoveTo, RestorePosition, SavePosition},
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{self, Clear, ClearType},
};

/// Single line pinned to the bottom of the terminal, redrawn in place.
pub struct StatusLine {
    out: Stdout,
}

impl StatusLine {
    /// `None` when stdout is not a terminal (piped, redirected, cron).
    pub fn stdout() -> Option<Self> {
        let out = io::stdout();
        out.is_terminal().then_some(Self { out })
    }

    pub fn show_request_count(&mut self, count: u64) -> io::Result<()> {
        draw_request_count(&mut self.out, bottom_row(), count)
    }

    pub fn show_shutting_down(&mut self) -> io::Result<()> {
        draw_shutting_down(&mut self.out, bottom_row())
    }
}

fn bottom_row() -> u16 {
    terminal::size()
        .map(|(_, rows)| rows.saturating_sub(1))
        .unwrap_or(0)
}

pub fn draw_request_count<W: Write>(out: &mut W, row: u16, count: u64) -> io::Result<()> {
    queue!(
        out,
        SavePosition,
        MoveTo(0, row),
        SetForegroundColor(Color::Yellow),
        Print("Number of requests received: "),
        SetForegroundColor(Color::Green),
        Print(count),
        ResetColor,
        Clear(ClearType::UntilNewLine),
        RestorePosition
    )?;
    out.flush()
}

pub fn draw_shutting_down<W: Write>(out: &mut W, row: u16) -> io::Result<()> {
    queue!(
        out,
        MoveTo(0, row),
        Clear(ClearType::CurrentLine),
        SetForegroundColor(Color::Red),
        Print("Shutting down\n"),
        ResetColor
    )?;
    out.flush()
}
