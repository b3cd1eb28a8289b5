//! Streaming redaction of secret values in child-process output.
//!
//! Every sensitive value injected into a child's environment is compiled
//! into one multi-pattern matcher (Aho-Corasick, leftmost-longest). The
//! child's stdout/stderr are pushed through [`Sanitizer::push`] chunk by
//! chunk; each exact byte occurrence of a value is replaced with
//! `[REDACTED:<key>]`. A carry-over buffer of `max value length − 1` bytes
//! keeps matches that span chunk boundaries detectable.
//!
//! Limits, by design: exact byte match only. Encoded forms (Base64, hex,
//! URL-encoding) and partial matches are not detected. Values shorter than
//! four bytes are not scanned — they would redact half the alphabet.
//! Output is treated as raw bytes; no UTF-8 validation is performed.

use aho_corasick::{AhoCorasick, MatchKind};

use crate::error::ExecError;

/// Values shorter than this are not scanned.
pub const MIN_SECRET_LEN: usize = 4;

/// Compiled multi-pattern redaction filter. One per `run` call; shared by
/// the stdout and stderr readers, each with its own [`SanitizeState`].
pub struct Sanitizer {
    matcher: Option<AhoCorasick>,
    replacements: Vec<Vec<u8>>,
    carry_len: usize,
}

/// Per-stream scan state.
#[derive(Debug, Default)]
pub struct SanitizeState {
    carry: Vec<u8>,
    matched: bool,
}

impl Sanitizer {
    /// Compile a sanitizer from `(record key, secret value)` pairs.
    ///
    /// Values shorter than [`MIN_SECRET_LEN`] are skipped. When two records
    /// share a value, the first key wins the label.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Sanitizer`] if the matcher cannot be built.
    pub fn new(secrets: &[(String, Vec<u8>)]) -> Result<Self, ExecError> {
        let mut patterns: Vec<&[u8]> = Vec::new();
        let mut replacements = Vec::new();
        for (key, value) in secrets {
            if value.len() < MIN_SECRET_LEN {
                continue;
            }
            if patterns.iter().any(|p| *p == value.as_slice()) {
                continue;
            }
            patterns.push(value.as_slice());
            replacements.push(format!("[REDACTED:{key}]").into_bytes());
        }

        if patterns.is_empty() {
            return Ok(Self {
                matcher: None,
                replacements,
                carry_len: 0,
            });
        }

        let carry_len = patterns.iter().map(|p| p.len()).max().unwrap_or(1) - 1;
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .map_err(|e| ExecError::Sanitizer {
                reason: e.to_string(),
            })?;

        Ok(Self {
            matcher: Some(matcher),
            replacements,
            carry_len,
        })
    }

    /// Fresh per-stream state.
    #[must_use]
    pub fn state(&self) -> SanitizeState {
        SanitizeState::default()
    }

    /// Scan one chunk, appending sanitized bytes to `out`.
    ///
    /// The trailing `carry_len` bytes are withheld until the next chunk or
    /// [`finish`](Self::finish): an occurrence spanning into the next chunk
    /// has at most `carry_len` bytes here, so it must start inside that
    /// suffix. Matches starting inside the suffix are deferred rather than
    /// committed — more bytes may still extend them to a longer pattern.
    pub fn push(&self, state: &mut SanitizeState, chunk: &[u8], out: &mut Vec<u8>) {
        let Some(matcher) = &self.matcher else {
            out.extend_from_slice(chunk);
            return;
        };

        let mut buf = std::mem::take(&mut state.carry);
        buf.extend_from_slice(chunk);

        let cut = buf.len().saturating_sub(self.carry_len);
        let mut cursor = 0;
        for mat in matcher.find_iter(&buf) {
            if mat.start() >= cut {
                break;
            }
            out.extend_from_slice(&buf[cursor..mat.start()]);
            out.extend_from_slice(&self.replacements[mat.pattern().as_usize()]);
            cursor = mat.end();
            state.matched = true;
        }

        let carry_start = cursor.max(cut);
        out.extend_from_slice(&buf[cursor..carry_start]);
        state.carry = buf[carry_start..].to_vec();
    }

    /// Flush the stream: scan the withheld suffix one last time (no more
    /// bytes are coming, so deferred matches are final) and report whether
    /// any substitution occurred on this stream.
    #[must_use]
    pub fn finish(&self, state: SanitizeState, out: &mut Vec<u8>) -> bool {
        let SanitizeState { carry, mut matched } = state;
        if let Some(matcher) = &self.matcher {
            let mut cursor = 0;
            for mat in matcher.find_iter(&carry) {
                out.extend_from_slice(&carry[cursor..mat.start()]);
                out.extend_from_slice(&self.replacements[mat.pattern().as_usize()]);
                cursor = mat.end();
                matched = true;
            }
            out.extend_from_slice(&carry[cursor..]);
        } else {
            out.extend_from_slice(&carry);
        }
        matched
    }

    /// Scan a complete buffer in one pass. Convenience for callers that
    /// already hold all the bytes.
    #[must_use]
    pub fn scrub(&self, bytes: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(bytes.len());
        let mut state = self.state();
        self.push(&mut state, bytes, &mut out);
        let matched = self.finish(state, &mut out);
        (out, matched)
    }
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer")
            .field("patterns", &self.replacements.len())
            .finish_non_exhaustive()
    }
}
