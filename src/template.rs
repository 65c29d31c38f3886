//! The template scanner.
//!
//! Templates are text files interleaving literal HTML with script
//! fragments bracketed by `<?` and `?>`. The scanner works line by line
//! with one bit of state (HTML or SCRIPT mode) and an accumulator of
//! partial script source; fragments execute through a [`Host`].
//!
//! Accumulated multi-line script executes as soon as it forms a complete
//! syntactic unit. A block left open at the end of the file is discarded
//! silently unless its accumulated source happens to be complete.

use std::io;
use std::path::Path;


/// The execution environment a template runs against.
///
/// [`crate::sandbox::Sandbox`] is the production implementation; tests use
/// a recording mock.
pub trait Host {
    /// Appends literal HTML to the response body.
    fn emit(&mut self, html: &str);

    /// Executes a script fragment. `line` is the 1-based source line the
    /// fragment ends on, for diagnostics.
    fn exec(&mut self, script: &str, line: u32);

    /// Whether the accumulated source forms a complete syntactic unit.
    fn is_complete(&mut self, script: &str) -> bool;

    /// Reports a fatal template error and halts further execution.
    fn die(&mut self, msg: &str);

    /// Whether script execution requested termination.
    fn terminated(&self) -> bool;
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Html,
    Script,
}

const OPEN: &str = "<?";
const CLOSE: &str = "?>";

/// Reads the template at `path` and executes it against `host`.
///
/// # Errors
/// Returns an error if the template file cannot be read. Script errors do
/// not surface here; the host traps them.
pub fn run(host: &mut impl Host, path: &Path) -> io::Result<()> {
    let source = std::fs::read_to_string(path)?;
    run_str(host, &source, path);
    Ok(())
}

/// Executes already-loaded template `source` against `host`.
///
/// `path` is used in diagnostics only.
pub fn run_str(host: &mut impl Host, source: &str, path: &Path) {
    let mut mode = Mode::Html;
    let mut pending = String::new();

    for (idx, line) in source.lines().enumerate() {
        let lineno = idx as u32 + 1;
        let mut scan = 0;

        loop {
            if host.terminated() {
                return;
            }
            let b = line[scan..].find(OPEN).map(|i| i + scan);
            let e = line[scan..].find(CLOSE).map(|i| i + scan);

            match (b, e) {
                // No marker: a full line of HTML or of accumulating script
                (None, None) => {
                    match mode {
                        Mode::Html => emit(host, &line[scan..]),
                        Mode::Script => {
                            pending.push_str(&line[scan..]);
                            pending.push('\n');
                            if host.is_complete(&pending) {
                                host.exec(&pending, lineno);
                                pending.clear();
                            }
                        },
                    }
                    break;
                },

                // An opening marker whose block continues past the line
                (Some(b), None) => {
                    if mode == Mode::Script {
                        return die_invalid(host, path, lineno);
                    }
                    pending.push_str(&line[(b + 2)..]);
                    pending.push('\n');
                    mode = Mode::Script;
                    break;
                },

                // A closing marker for a block opened on an earlier line
                (None, Some(e)) => {
                    if mode == Mode::Html {
                        return die_invalid(host, path, lineno);
                    }
                    pending.push_str(&line[scan..e]);
                    host.exec(&pending, lineno);
                    pending.clear();
                    mode = Mode::Html;
                    emit(host, &line[(e + 2)..]);
                    break;
                },

                // A complete <? ... ?> fragment within the line
                (Some(b), Some(e)) if b < e => {
                    if mode == Mode::Script {
                        return die_invalid(host, path, lineno);
                    }
                    emit(host, &line[scan..b]);
                    // <?> makes the markers overlap; the fragment is empty
                    host.exec(&line[(b + 2).min(e)..e], lineno);
                    scan = e + 2;
                },

                // The line closes one block and opens another
                (Some(b), Some(e)) /* e < b */ => {
                    if mode == Mode::Html {
                        return die_invalid(host, path, lineno);
                    }
                    pending.push_str(&line[scan..e]);
                    host.exec(&pending, lineno);
                    pending.clear();
                    emit(host, &line[(e + 2)..b]);
                    scan = b + 2;
                },
            }
        }

        if host.terminated() {
            return;
        }
        if mode == Mode::Html {
            // Preserve the source line break
            host.emit("\n");
        }
    }
}

fn emit(host: &mut impl Host, html: &str) {
    if !html.is_empty() {
        host.emit(html);
    }
}

fn die_invalid(host: &mut impl Host, path: &Path, lineno: u32) {
    host.die(&format!("{}:{lineno} -- invalid script block", path.display()));
}
