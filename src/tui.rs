//! The terminal UI spawned for default-mode consoles.
//!
//! A small launcher drawn with crossterm inside the PTY: it shows the
//! workbench banner and waits for a key. `s` replaces the process with a login
//! shell; `q`, Esc or Ctrl+C exit.

use std::io::Write;
use std::path::PathBuf;

use crossterm::{
    cursor::MoveTo,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    style::{Attribute, Print, SetAttribute},
    terminal::{disable_raw_mode, enable_raw_mode, size, Clear, ClearType},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuiError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("terminal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start {}: {source}", .shell.display())]
    ExecShell {
        shell: PathBuf,
        source: std::io::Error,
    },
}

/// RAII guard for terminal raw mode.
///
/// Raw mode is enabled on creation and restored on drop, including on panic.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TuiError> {
        enable_raw_mode().map_err(TuiError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// What the operator picked in the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherChoice {
    Shell,
    Quit,
}

/// Map a key press to a launcher action. Releases and repeats are ignored.
pub fn choice_for_key(key: KeyEvent) -> Option<LauncherChoice> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(LauncherChoice::Quit)
        }
        KeyCode::Char('s') | KeyCode::Char('S') => Some(LauncherChoice::Shell),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(LauncherChoice::Quit),
        _ => None,
    }
}

/// `$SHELL`, falling back to `/bin/bash`.
pub fn login_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/bin/bash"))
}

/// Run the launcher until the operator picks something.
pub fn run() -> Result<(), TuiError> {
    let choice = {
        let _guard = RawModeGuard::new()?;
        let mut stdout = std::io::stdout();
        draw(&mut stdout)?;
        loop {
            match event::read()? {
                Event::Key(key) => {
                    if let Some(choice) = choice_for_key(key) {
                        break choice;
                    }
                }
                Event::Resize(_, _) => draw(&mut stdout)?,
                _ => {}
            }
        }
    };

    match choice {
        LauncherChoice::Shell => exec_shell(),
        LauncherChoice::Quit => Ok(()),
    }
}

fn draw(out: &mut impl Write) -> Result<(), TuiError> {
    // crossterm reports (cols, rows).
    let (cols, rows) = size()?;
    queue!(
        out,
        Clear(ClearType::All),
        MoveTo(0, 0),
        SetAttribute(Attribute::Bold),
        Print(format!("{} console", env!("CARGO_PKG_NAME"))),
        SetAttribute(Attribute::Reset),
        Print(format!("  {cols}x{rows}\r\n\r\n")),
        Print("  s  open a login shell\r\n"),
        Print("  q  quit\r\n"),
    )?;
    out.flush()?;
    Ok(())
}

#[cfg(unix)]
fn exec_shell() -> Result<(), TuiError> {
    use std::os::unix::process::CommandExt;

    let shell = login_shell();
    print!("\r\n");
    let _ = std::io::stdout().flush();
    // Only returns on failure.
    let source = std::process::Command::new(&shell).arg("--login").exec();
    Err(TuiError::ExecShell { shell, source })
}

#[cfg(not(unix))]
fn exec_shell() -> Result<(), TuiError> {
    let shell = login_shell();
    std::process::Command::new(&shell)
        .status()
        .map_err(|source| TuiError::ExecShell { shell, source })?;
    Ok(())
}
