use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Cause recorded when no classifier looked at the crash.
pub const UNCLASSIFIED_CAUSE: &str = "debugserver: n/a";

/// Structured result of reproducing a crash under a debugger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    /// Frame descriptions, outermost first, exactly as the debugger printed them.
    pub backtrace: Vec<String>,
    /// Full transcript of the debugger session.
    pub raw_output: String,
    /// Classification, or [`UNCLASSIFIED_CAUSE`].
    pub cause: String,
    /// Report written by a memory-safety sanitizer for the crashing process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitizer_output: Option<String>,
}

impl CrashRecord {
    /// Creates an unclassified record without a sanitizer report.
    pub fn new(backtrace: Vec<String>, raw_output: String) -> Self {
        Self {
            backtrace,
            raw_output,
            cause: UNCLASSIFIED_CAUSE.to_string(),
            sanitizer_output: None,
        }
    }

    pub fn with_sanitizer_output(mut self, report: String) -> Self {
        self.sanitizer_output = Some(report);
        self
    }

    /// Whether some classifier replaced the default cause.
    pub fn is_classified(&self) -> bool {
        self.cause != UNCLASSIFIED_CAUSE
    }

    /// Hex md5 over the frames with their `#N` index and any hex addresses
    /// removed, so the same crash hashes the same across ASLR layouts.
    pub fn fingerprint(&self) -> String {
        let mut hash = md5::Context::new();
        for frame in &self.backtrace {
            let without_index = frame_marker()
                .find(frame)
                .map_or(frame.as_str(), |m| &frame[m.end()..]);
            let normalized = hex_address().replace_all(without_index, "");
            hash.consume(normalized.split_whitespace().collect::<Vec<_>>().join(" "));
            hash.consume(b"\n");
        }
        format!("{:x}", hash.compute())
    }
}

fn frame_marker() -> &'static Regex {
    static FRAME_MARKER: OnceLock<Regex> = OnceLock::new();
    FRAME_MARKER.get_or_init(|| Regex::new(r"^#\d+").expect("valid frame marker regex"))
}

fn hex_address() -> &'static Regex {
    static HEX_ADDRESS: OnceLock<Regex> = OnceLock::new();
    HEX_ADDRESS.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid address regex"))
}

fn innermost_frame() -> &'static Regex {
    static INNERMOST_FRAME: OnceLock<Regex> = OnceLock::new();
    INNERMOST_FRAME.get_or_init(|| Regex::new(r"^#0\b").expect("valid innermost frame regex"))
}

fn inferior_process() -> &'static Regex {
    static INFERIOR: OnceLock<Regex> = OnceLock::new();
    INFERIOR.get_or_init(|| Regex::new(r"process (\d+)").expect("valid process regex"))
}

/// Pulls the backtrace out of a debugger transcript.
///
/// A backtrace region starts at an innermost frame (`#0`) printed either at
/// the start of a line or right after one or more prompts, since prompts are
/// not terminated by a newline. It ends at the next `prompt`. Every line in the
/// region that starts with a frame marker is kept, without its line
/// terminator.
///
/// `#` followed by a digit in the middle of a line is program output, not a
/// frame, and never starts a region.
///
/// # Arguments
/// * `transcript`: Everything the debugger wrote to stdout.
/// * `prompt`: The debugger's interactive prompt, e.g. `(gdb)`.
///
/// # Returns
/// The frames of the first region that is closed by a prompt, or `None` when
/// the transcript holds no such region.
pub fn extract_backtrace(transcript: &str, prompt: &str) -> Option<Vec<String>> {
    region_starts(transcript, prompt).find_map(|start| {
        let region = &transcript[start..];
        let end = region.find(prompt)?;
        let frames: Vec<String> = region[..end]
            .lines()
            .filter(|line| frame_marker().is_match(line))
            .map(|line| line.trim_end_matches(['\r', '\n']).to_string())
            .collect();
        if frames.is_empty() { None } else { Some(frames) }
    })
}

/// Byte offsets of every `#0` that sits at a line start or directly after
/// the prompt.
fn region_starts<'a>(transcript: &'a str, prompt: &'a str) -> impl Iterator<Item = usize> + 'a {
    let mut offset = 0;
    transcript.split_inclusive('\n').filter_map(move |line| {
        let line_start = offset;
        offset += line.len();
        let mut rest = line;
        while !prompt.is_empty() {
            match rest.strip_prefix(prompt) {
                Some(after) => rest = after.trim_start_matches([' ', '\t']),
                None => break,
            }
        }
        innermost_frame()
            .is_match(rest)
            .then(|| line_start + (line.len() - rest.len()))
    })
}

/// Process id of the debugged program, if the debugger mentioned it.
pub fn inferior_pid(transcript: &str) -> Option<u32> {
    inferior_process()
        .captures(transcript)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GDB_SESSION: &str = "Reading symbols from ./server...\n\
        (gdb) Starting program: /opt/server --port 20001\n\
        [Thread debugging using libthread_db enabled]\n\
        \n\
        Program received signal SIGSEGV, Segmentation fault.\n\
        0x0000555555555139 in foo () at server.c:4\n\
        4\t  *p = 1;\n\
        (gdb) #0  0x0000555555555139 in foo () at server.c:4\n\
        #1  0x0000555555555150 in bar () at server.c:8\n\
        #2  0x0000555555555165 in main () at server.c:12\n\
        (gdb) A debugging session is active.\n\
        \n\
        \tInferior 1 [process 48213] will be killed.\n\
        \n\
        Quit anyway? (y or n) [answered Y; input not from terminal]\n";

    #[test]
    fn frames_between_first_marker_and_next_prompt_are_kept() {
        let transcript = "(gdb) run\n#0 foo ()\n#1 bar ()\n#2 main ()\n(gdb) ";
        let frames = extract_backtrace(transcript, "(gdb)").unwrap();
        assert_eq!(frames, vec!["#0 foo ()", "#1 bar ()", "#2 main ()"]);
    }

    #[test]
    fn real_gdb_transcript_yields_three_frames() {
        let frames = extract_backtrace(GDB_SESSION, "(gdb)").unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("#0  0x0000555555555139 in foo ()"));
        assert!(frames[2].ends_with("in main () at server.c:12"));
        assert_eq!(inferior_pid(GDB_SESSION), Some(48213));
    }

    #[test]
    fn carriage_returns_are_trimmed() {
        let transcript = "#0 foo ()\r\n#1 main ()\r\n(gdb) ";
        let frames = extract_backtrace(transcript, "(gdb)").unwrap();
        assert_eq!(frames, vec!["#0 foo ()", "#1 main ()"]);
    }

    #[test]
    fn wrapped_continuation_lines_are_dropped() {
        let transcript =
            "#0  0x1 in handler (conn=0x5555,\n    buf=0x6666) at srv.c:9\n#1  0x2 in main ()\n(gdb) ";
        let frames = extract_backtrace(transcript, "(gdb)").unwrap();
        assert_eq!(
            frames,
            vec!["#0  0x1 in handler (conn=0x5555,", "#1  0x2 in main ()"]
        );
    }

    #[test]
    fn transcripts_without_frames_yield_nothing() {
        let clean_exit = "(gdb) Starting program: /opt/server\n[Inferior 1 (process 77) exited normally]\n(gdb) ";
        assert_eq!(extract_backtrace(clean_exit, "(gdb)"), None);
        assert_eq!(extract_backtrace("# not a frame\n(gdb) ", "(gdb)"), None);
        assert_eq!(extract_backtrace("", "(gdb)"), None);
        assert_eq!(inferior_pid(clean_exit), Some(77));
    }

    #[test]
    fn hash_digits_in_program_output_are_not_frames() {
        let transcript = "(gdb) Starting program: /opt/server --port 20001\n\
            conn #1 accepted\n\
            #1 is not a frame either\n\
            \n\
            Program received signal SIGSEGV, Segmentation fault.\n\
            (gdb) #0 foo ()\n#1 bar ()\n#2 main ()\n(gdb) ";
        let frames = extract_backtrace(transcript, "(gdb)").unwrap();
        assert_eq!(frames, vec!["#0 foo ()", "#1 bar ()", "#2 main ()"]);
    }

    #[test]
    fn clean_exit_with_hash_digits_in_output_yields_nothing() {
        let transcript = "(gdb) Starting program: /opt/server\n\
            req #5 served\n\
            [Inferior 1 (process 77) exited normally]\n\
            (gdb) No stack.\n(gdb) ";
        assert_eq!(extract_backtrace(transcript, "(gdb)"), None);
    }

    #[test]
    fn stacked_prompts_before_the_backtrace_are_skipped() {
        let transcript = "(gdb) (gdb) #0 foo ()\n#1 main ()\n(gdb) ";
        let frames = extract_backtrace(transcript, "(gdb)").unwrap();
        assert_eq!(frames, vec!["#0 foo ()", "#1 main ()"]);
    }

    #[test]
    fn frames_without_a_closing_prompt_yield_nothing() {
        assert_eq!(extract_backtrace("#0 foo ()\n#1 main ()\n", "(gdb)"), None);
    }

    #[test]
    fn new_records_are_unclassified() {
        let record = CrashRecord::new(vec!["#0 foo ()".to_string()], "raw".to_string());
        assert_eq!(record.cause, UNCLASSIFIED_CAUSE);
        assert!(!record.is_classified());
        assert!(record.sanitizer_output.is_none());

        let record = record.with_sanitizer_output("==1==ERROR: AddressSanitizer".to_string());
        assert!(record.sanitizer_output.is_some());
    }

    #[test]
    fn fingerprint_ignores_addresses_and_spacing() {
        let a = CrashRecord::new(
            vec![
                "#0  0x0000555555555139 in foo () at server.c:4".to_string(),
                "#1  0x0000555555555150 in main () at server.c:8".to_string(),
            ],
            String::new(),
        );
        let b = CrashRecord::new(
            vec![
                "#0 0x00007f0000001139 in foo () at server.c:4".to_string(),
                "#1 0x00007f0000001150 in main () at server.c:8".to_string(),
            ],
            "different transcript".to_string(),
        );
        let c = CrashRecord::new(
            vec!["#0  0x0000555555555139 in bar () at server.c:4".to_string()],
            String::new(),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 32);
    }
}
