//! Sentinel demultiplexer.
//!
//! Every command is written as `<command>\n` followed by `echo __done__\n`, so
//! the process itself prints [`SENTINEL`] when the command is done. Output
//! arrives as arbitrary chunks on two independent streams; this module maps
//! those chunks back onto the FIFO of pending commands:
//!
//! - no sentinel in the chunk: everything goes to the head of the queue;
//! - each sentinel pops the head, hands it the text since the previous cursor
//!   (minus the newline just before the sentinel) and finishes it;
//! - text after the last sentinel goes to the new head, unfinished.
//!
//! Offsets are computed on decoded text. An incomplete UTF-8 sequence at the
//! end of a chunk, or a fragment of the sentinel at the end of a stdout chunk,
//! is carried into the next chunk of the same stream.
//!
//! The sentinel may directly follow output that has no trailing newline
//! (`printf abc` yields `abc__done__`), so any stdout chunk ending in `_`,
//! `__`, `__d` and so on is held back, even when it turns out to be real
//! output such as a prompt ending in `_`. Until the next stdout chunk
//! arrives, the head command does not see those bytes: `received_data` and
//! status snapshots lag by that fragment. The command's final output is
//! unaffected.

use crate::command::Command;
use crate::types::StreamKind;
use std::collections::VecDeque;

/// Completion marker printed by the process after each command.
pub const SENTINEL: &str = "__done__";

/// Line written after every command to make the process print [`SENTINEL`].
pub const SENTINEL_ECHO: &str = "echo __done__";

/// What one call to [`Demultiplexer::on_data`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    /// Commands finished by sentinels in this chunk.
    pub finished: usize,
    /// Sentinels seen while the queue was already empty.
    pub orphan_sentinels: usize,
    /// Non-whitespace bytes that arrived with no pending command to own them.
    pub unclaimed_bytes: usize,
}

/// FIFO of pending commands plus the per-stream carry-over state.
#[derive(Debug)]
pub struct Demultiplexer {
    queue: VecDeque<Command>,
    scan_stderr: bool,
    stdout_carry: Vec<u8>,
    stderr_carry: Vec<u8>,
}

impl Demultiplexer {
    /// `scan_stderr` controls whether a sentinel on stderr also completes
    /// the head command.
    pub fn new(scan_stderr: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            scan_stderr,
            stdout_carry: Vec::new(),
            stderr_carry: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pending commands, oldest first, without removing them.
    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    /// Remove every pending command. Dropping them drops their callbacks.
    pub fn drain(&mut self) -> Vec<Command> {
        self.stdout_carry.clear();
        self.stderr_carry.clear();
        self.queue.drain(..).collect()
    }

    /// Feed one chunk. `on_finished` receives each completed command, in
    /// completion order, right after its `finish()`.
    pub fn on_data(
        &mut self,
        kind: StreamKind,
        data: &[u8],
        on_finished: &mut dyn FnMut(Command),
    ) -> ChunkReport {
        let mut report = ChunkReport::default();

        let carry = match kind {
            StreamKind::Stdout => &mut self.stdout_carry,
            StreamKind::Stderr => &mut self.stderr_carry,
        };
        let mut bytes = std::mem::take(carry);
        bytes.extend_from_slice(data);

        let cut = bytes.len() - incomplete_utf8_suffix(&bytes);
        let utf8_tail = bytes.split_off(cut);
        let decoded = String::from_utf8_lossy(&bytes);
        let text: &str = &decoded;

        let scan = kind == StreamKind::Stdout || self.scan_stderr;
        let mut cursor = 0;

        if scan {
            while let Some(rel) = text[cursor..].find(SENTINEL) {
                let at = cursor + rel;

                match self.queue.pop_front() {
                    Some(mut cmd) => {
                        if at > cursor {
                            let slice = &text[cursor..at];
                            let slice = slice.strip_suffix('\n').unwrap_or(slice);
                            cmd.handle_data(kind, slice.as_bytes());
                        }
                        cmd.finish();
                        report.finished += 1;
                        on_finished(cmd);
                    }
                    None => report.orphan_sentinels += 1,
                }

                cursor = at + SENTINEL.len();
            }
        }

        let mut rest = &text[cursor..];
        let mut held = "";
        if kind == StreamKind::Stdout && utf8_tail.is_empty() {
            let keep = rest.len() - partial_sentinel_suffix(rest);
            held = &rest[keep..];
            rest = &rest[..keep];
        }

        if !rest.is_empty() {
            match self.queue.front_mut() {
                Some(head) => head.handle_data(kind, rest.as_bytes()),
                None => report.unclaimed_bytes += rest.trim().len(),
            }
        }

        let carry = match kind {
            StreamKind::Stdout => &mut self.stdout_carry,
            StreamKind::Stderr => &mut self.stderr_carry,
        };
        carry.extend_from_slice(held.as_bytes());
        carry.extend_from_slice(&utf8_tail);

        report
    }
}

/// Length of a trailing, not-yet-complete UTF-8 sequence (0 if none).
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            return 0;
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Length of the longest proper prefix of [`SENTINEL`] that ends `text`.
fn partial_sentinel_suffix(text: &str) -> usize {
    (1..SENTINEL.len())
        .rev()
        .find(|&n| text.ends_with(&SENTINEL[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandResult;
    use std::sync::{Arc, Mutex};

    type Results = Arc<Mutex<Vec<CommandResult>>>;

    fn demux_with(commands: &[&str]) -> (Demultiplexer, Results) {
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let mut demux = Demultiplexer::new(true);
        for c in commands {
            let sink = Arc::clone(&results);
            demux.push(Command::new(*c, move |r| sink.lock().unwrap().push(r)));
        }
        (demux, results)
    }

    fn feed(demux: &mut Demultiplexer, kind: StreamKind, data: &str) -> (ChunkReport, Vec<Command>) {
        let mut done = Vec::new();
        let report = demux.on_data(kind, data.as_bytes(), &mut |c| done.push(c));
        (report, done)
    }

    #[test]
    fn chunk_without_sentinel_goes_to_head() {
        let (mut demux, results) = demux_with(&["a", "b"]);
        let (report, done) = feed(&mut demux, StreamKind::Stdout, "partial output\n");
        assert_eq!(report.finished, 0);
        assert!(done.is_empty());
        assert_eq!(demux.len(), 2);
        assert!(demux.pending().next().unwrap().received_data());
        assert!(results.lock().unwrap().is_empty());
    }

    #[test]
    fn single_command_completes() {
        let (mut demux, results) = demux_with(&["echo hi"]);
        let (report, done) = feed(&mut demux, StreamKind::Stdout, "hi\n__done__\n");
        assert_eq!(report.finished, 1);
        assert_eq!(report.unclaimed_bytes, 0);
        assert_eq!(done[0].stdout(), Some("hi"));
        assert!(demux.is_empty());
        assert_eq!(results.lock().unwrap()[0].stdout, "hi");
    }

    #[test]
    fn sentinel_at_cursor_finishes_with_no_new_output() {
        let (mut demux, results) = demux_with(&["true"]);
        feed(&mut demux, StreamKind::Stdout, "__done__\n");
        let results = results.lock().unwrap();
        assert_eq!(results[0].stdout, "");
        assert_eq!(results[0].stderr, "");
    }

    #[test]
    fn many_sentinels_in_one_chunk_complete_in_order() {
        let (mut demux, results) = demux_with(&["one", "two", "three"]);
        let (report, _) = feed(
            &mut demux,
            StreamKind::Stdout,
            "1\n__done__\n2\n__done__\n__done__\n",
        );
        assert_eq!(report.finished, 3);

        let results = results.lock().unwrap();
        let commands: Vec<_> = results.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, ["one", "two", "three"]);
        let outputs: Vec<_> = results.iter().map(|r| r.stdout.as_str()).collect();
        assert_eq!(outputs, ["1", "2", ""]);
    }

    #[test]
    fn trailing_data_belongs_to_next_command() {
        let (mut demux, results) = demux_with(&["first", "second"]);
        feed(&mut demux, StreamKind::Stdout, "a\n__done__\nstart of b ");
        assert_eq!(demux.len(), 1);
        feed(&mut demux, StreamKind::Stdout, "end of b\n__done__\n");

        let results = results.lock().unwrap();
        assert_eq!(results[0].stdout, "a");
        assert_eq!(results[1].stdout, "start of b end of b");
    }

    #[test]
    fn stderr_lands_in_stderr_buffer() {
        let (mut demux, results) = demux_with(&["bad"]);
        feed(&mut demux, StreamKind::Stderr, "oops\n");
        feed(&mut demux, StreamKind::Stdout, "__done__\n");
        let results = results.lock().unwrap();
        assert_eq!(results[0].stdout, "");
        assert_eq!(results[0].stderr, "oops");
    }

    #[test]
    fn sentinel_on_stderr_completes_by_default() {
        let (mut demux, results) = demux_with(&["x"]);
        let (report, _) = feed(&mut demux, StreamKind::Stderr, "err\n__done__");
        assert_eq!(report.finished, 1);
        assert_eq!(results.lock().unwrap()[0].stderr, "err");
    }

    #[test]
    fn stderr_scanning_can_be_disabled() {
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let mut demux = Demultiplexer::new(false);
        demux.push(Command::new("x", move |r| sink.lock().unwrap().push(r)));

        let (report, _) = feed(&mut demux, StreamKind::Stderr, "says __done__ here\n");
        assert_eq!(report.finished, 0);
        feed(&mut demux, StreamKind::Stdout, "__done__\n");
        assert_eq!(results.lock().unwrap()[0].stderr, "says __done__ here");
    }

    #[test]
    fn output_without_trailing_newline_keeps_last_char() {
        let (mut demux, results) = demux_with(&["printf abc"]);
        feed(&mut demux, StreamKind::Stdout, "abc__done__\n");
        assert_eq!(results.lock().unwrap()[0].stdout, "abc");
    }

    #[test]
    fn sentinel_split_across_chunks_is_recognised() {
        let (mut demux, results) = demux_with(&["echo x", "echo y"]);
        feed(&mut demux, StreamKind::Stdout, "x\n__do");
        assert!(results.lock().unwrap().is_empty());
        feed(&mut demux, StreamKind::Stdout, "ne__\ny\n__done__\n");

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].stdout, "x");
        assert_eq!(results[1].stdout, "y");
    }

    #[test]
    fn held_fragment_that_is_not_a_sentinel_is_kept() {
        let (mut demux, results) = demux_with(&["echo"]);
        feed(&mut demux, StreamKind::Stdout, "value__");
        feed(&mut demux, StreamKind::Stdout, "x\n__done__\n");
        assert_eq!(results.lock().unwrap()[0].stdout, "value__x");
    }

    #[test]
    fn trailing_underscore_is_delivered_with_next_chunk() {
        let (mut demux, results) = demux_with(&["read -p 'name_' n"]);
        feed(&mut demux, StreamKind::Stdout, "_");
        assert!(!demux.pending().next().unwrap().received_data());

        feed(&mut demux, StreamKind::Stdout, "\n");
        assert!(demux.pending().next().unwrap().received_data());
        feed(&mut demux, StreamKind::Stdout, "__done__\n");
        assert_eq!(results.lock().unwrap()[0].stdout, "_");
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let (mut demux, results) = demux_with(&["echo €"]);
        let bytes = "€\n__done__\n".as_bytes();
        demux.on_data(StreamKind::Stdout, &bytes[..2], &mut |_| {});
        demux.on_data(StreamKind::Stdout, &bytes[2..], &mut |_| {});
        assert_eq!(results.lock().unwrap()[0].stdout, "€");
    }

    #[test]
    fn sentinel_with_empty_queue_is_reported() {
        let (mut demux, _) = demux_with(&[]);
        let (report, _) = feed(&mut demux, StreamKind::Stdout, "stray\n__done__\n");
        assert_eq!(report.orphan_sentinels, 1);
        assert_eq!(report.unclaimed_bytes, 0);

        let (report, _) = feed(&mut demux, StreamKind::Stdout, "noise");
        assert_eq!(report.unclaimed_bytes, 5);
    }

    #[test]
    fn drain_drops_callbacks_without_firing() {
        let (mut demux, results) = demux_with(&["a", "b"]);
        let drained = demux.drain();
        assert_eq!(drained.len(), 2);
        assert!(demux.is_empty());
        assert!(results.lock().unwrap().is_empty());
    }

    #[test]
    fn utf8_suffix_detection() {
        assert_eq!(incomplete_utf8_suffix(b"abc"), 0);
        assert_eq!(incomplete_utf8_suffix(&"€".as_bytes()[..1]), 1);
        assert_eq!(incomplete_utf8_suffix(&"€".as_bytes()[..2]), 2);
        assert_eq!(incomplete_utf8_suffix("€".as_bytes()), 0);
        assert_eq!(incomplete_utf8_suffix(b""), 0);
    }

    #[test]
    fn partial_sentinel_detection() {
        assert_eq!(partial_sentinel_suffix("abc"), 0);
        assert_eq!(partial_sentinel_suffix("abc_"), 1);
        assert_eq!(partial_sentinel_suffix("abc__don"), 5);
        assert_eq!(partial_sentinel_suffix("__done__"), 0);
    }
}
