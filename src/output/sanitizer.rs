//! Terminal output sanitization built on the VTE parser.

use vte::{Params, Parser, Perform};

/// Turns raw PTY bytes into plain text.
pub struct OutputSanitizer;

impl OutputSanitizer {
    /// Strip ANSI escape codes from raw bytes.
    ///
    /// CSI, OSC and DCS sequences are dropped, backspaces erase the previous
    /// character (crash and less use them for overstrike), and only newline,
    /// carriage return and tab survive among control characters.
    pub fn strip_ansi(input: &[u8]) -> String {
        let mut extractor = PlainText::default();
        let mut parser = Parser::new();
        parser.advance(&mut extractor, input);
        extractor.into_string()
    }

    pub fn strip_ansi_str(input: &str) -> String {
        Self::strip_ansi(input.as_bytes())
    }
}

#[derive(Default)]
struct PlainText {
    output: String,
}

impl PlainText {
    fn into_string(self) -> String {
        self.output
    }
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        self.output.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' | b'\t' => self.output.push(byte as char),
            0x08 => {
                if !self.output.ends_with(['\n', '\r']) {
                    self.output.pop();
                }
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(
        &mut self,
        _params: &Params,
        _intermediates: &[u8],
        _ignore: bool,
        _action: char,
    ) {
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}
