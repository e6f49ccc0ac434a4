//! µ-law clock accounting and per-utterance playback tracking.
//!
//! Twilio media streams and the realtime model both speak G.711 µ-law at
//! 8 kHz mono, so one byte is 1/8 of a millisecond and audio duration can be
//! derived from byte counts alone.  Forwarded audio sits in Twilio's jitter
//! buffer; the only reliable playback-position signal is Twilio's mark
//! acknowledgements, which is what `PlaybackTracker` keys truncation on.

use base64::{engine, Engine};
use std::collections::HashMap;
use std::io::{Cursor, Read};

/// µ-law 8 kHz mono: 8000 samples/s at one byte per sample.
pub const ULAW_BYTES_PER_SEC: u64 = 8_000;

/// Minimum spacing between playback marks on the outbound stream.
pub const MARK_INTERVAL_MS: u64 = 300;

/// Milliseconds of audio represented by `bytes` of µ-law 8 kHz, rounded to
/// the nearest millisecond.
pub fn ulaw_ms(bytes: u64) -> u64 {
    (bytes * 1_000 + ULAW_BYTES_PER_SEC / 2) / ULAW_BYTES_PER_SEC
}

/// Decoded byte count of a standard base64 string, computed without decoding
/// so passthrough payloads can be accounted for at zero cost.
pub fn b64_decoded_len(encoded: &str) -> u64 {
    let len = encoded.len() as u64;
    if len == 0 {
        return 0;
    }
    let padding = encoded.bytes().rev().take_while(|&b| b == b'=').count() as u64;
    if len % 4 == 0 {
        len / 4 * 3 - padding
    } else {
        // Unpadded input; three bytes per full quantum plus the remainder.
        len * 3 / 4
    }
}

pub fn b64_decode_to_buf(enc: &str, buf: &mut Vec<u8>) -> Result<(), base64::DecodeError> {
    let mut cur = Cursor::new(enc);
    let mut decoder = base64::read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder
        .read_to_end(buf)
        .map_err(|_| base64::DecodeError::InvalidPadding)?;
    Ok(())
}

pub fn b64_encode(raw: &[u8]) -> String {
    engine::general_purpose::STANDARD.encode(raw)
}

/// Outcome of accounting one outbound audio delta.
pub struct DeltaAccounting {
    /// Mark to emit to Twilio after the media frame, if one is due.
    pub mark: Option<String>,
}

/// Per-assistant-utterance playback accounting.
///
/// `sent_ms` counts audio forwarded to Twilio; `played_ms` is the high-water
/// mark of acknowledged playback and only ever advances on a mark ack
/// received outside a clearing window.  `0 <= played_ms <= sent_ms` holds at
/// all times.
#[derive(Debug, Default)]
pub struct PlaybackTracker {
    item_id: Option<String>,
    sent_ms: u64,
    played_ms: u64,
    last_mark_sent_ms: u64,
    mark_seq: u64,
    marks: HashMap<String, u64>,
    clearing: bool,
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new assistant utterance began (`response.output_item.added`).
    /// Resets all counters and ends any clearing window.
    pub fn begin_item(&mut self, item_id: &str) {
        self.item_id = Some(item_id.to_string());
        self.sent_ms = 0;
        self.played_ms = 0;
        self.last_mark_sent_ms = 0;
        self.mark_seq = 0;
        self.marks.clear();
        self.clearing = false;
    }

    /// Account `bytes` of decoded µ-law forwarded to Twilio.  Returns a mark
    /// name to emit when at least `MARK_INTERVAL_MS` has elapsed since the
    /// previous mark.
    pub fn on_delta_bytes(&mut self, bytes: u64) -> DeltaAccounting {
        self.sent_ms += ulaw_ms(bytes);
        let mark = if self.sent_ms - self.last_mark_sent_ms >= MARK_INTERVAL_MS {
            let item = self.item_id.as_deref().unwrap_or("unknown");
            let name = format!("a:{item}:ms:{}:seq:{}", self.sent_ms, self.mark_seq);
            self.marks.insert(name.clone(), self.sent_ms);
            self.last_mark_sent_ms = self.sent_ms;
            self.mark_seq += 1;
            Some(name)
        } else {
            None
        };
        DeltaAccounting { mark }
    }

    /// Twilio acknowledged a mark.  Advances `played_ms` unless a clearing
    /// window is open, in which case the ack belongs to pre-clear audio and
    /// is discarded.  Returns whether the ack was accepted.
    pub fn on_mark_ack(&mut self, name: &str) -> bool {
        match self.marks.remove(name) {
            Some(sent_at) if !self.clearing => {
                self.played_ms = self.played_ms.max(sent_at);
                true
            }
            _ => false,
        }
    }

    /// A confirmed barge-in is clearing Twilio's output buffer; late acks for
    /// already-queued audio must not bump `played_ms` past the interruption.
    pub fn begin_clearing(&mut self) {
        self.clearing = true;
    }

    pub fn item_id(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    pub fn sent_ms(&self) -> u64 {
        self.sent_ms
    }

    pub fn played_ms(&self) -> u64 {
        self.played_ms
    }

    pub fn remaining_ms(&self) -> u64 {
        self.sent_ms - self.played_ms
    }

    pub fn clearing(&self) -> bool {
        self.clearing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_ms_is_eight_bytes_per_ms() {
        assert_eq!(ulaw_ms(160), 20);
        assert_eq!(ulaw_ms(8_000), 1_000);
        assert_eq!(ulaw_ms(0), 0);
        // rounds to nearest
        assert_eq!(ulaw_ms(4), 1);
        assert_eq!(ulaw_ms(3), 0);
    }

    #[test]
    fn decoded_len_matches_real_decode() {
        for raw in [&b""[..], b"a", b"ab", b"abc", b"abcd", &[0u8; 160][..]] {
            let enc = b64_encode(raw);
            assert_eq!(b64_decoded_len(&enc), raw.len() as u64, "input {raw:?}");
        }
    }

    #[test]
    fn sent_ms_accumulates_byte_count_law() {
        let mut t = PlaybackTracker::new();
        t.begin_item("item_1");
        // 10 twenty-millisecond frames
        for _ in 0..10 {
            t.on_delta_bytes(160);
        }
        assert_eq!(t.sent_ms(), 200);
    }

    #[test]
    fn marks_are_spaced_at_least_300ms() {
        let mut t = PlaybackTracker::new();
        t.begin_item("item_1");
        let mut marks = vec![];
        for _ in 0..50 {
            if let Some(m) = t.on_delta_bytes(160).mark {
                marks.push((m, t.sent_ms()));
            }
        }
        assert!(!marks.is_empty());
        let mut prev = 0;
        for (_, at) in &marks {
            assert!(at - prev >= MARK_INTERVAL_MS);
            prev = *at;
        }
        assert!(marks[0].0.starts_with("a:item_1:ms:"));
    }

    #[test]
    fn mark_ack_advances_played_up_to_sent() {
        let mut t = PlaybackTracker::new();
        t.begin_item("item_1");
        let mut first_mark = None;
        for _ in 0..20 {
            if let Some(m) = t.on_delta_bytes(160).mark {
                first_mark.get_or_insert(m);
            }
        }
        let mark = first_mark.expect("a mark after 400ms of audio");
        assert!(t.on_mark_ack(&mark));
        assert!(t.played_ms() > 0);
        assert!(t.played_ms() <= t.sent_ms());
        // unknown names never move the needle
        assert!(!t.on_mark_ack("a:item_1:ms:9999:seq:9"));
    }

    #[test]
    fn acks_during_clearing_are_discarded() {
        let mut t = PlaybackTracker::new();
        t.begin_item("item_1");
        let mut marks = vec![];
        for _ in 0..40 {
            if let Some(m) = t.on_delta_bytes(160).mark {
                marks.push(m);
            }
        }
        assert!(t.on_mark_ack(&marks[0]));
        let played = t.played_ms();
        t.begin_clearing();
        assert!(!t.on_mark_ack(&marks[1]));
        assert_eq!(t.played_ms(), played);
        // a fresh utterance ends the clearing window
        t.begin_item("item_2");
        assert!(!t.clearing());
        assert_eq!(t.played_ms(), 0);
    }

    #[test]
    fn played_is_monotonic_under_out_of_order_acks() {
        let mut t = PlaybackTracker::new();
        t.begin_item("item_1");
        let mut marks = vec![];
        for _ in 0..60 {
            if let Some(m) = t.on_delta_bytes(160).mark {
                marks.push(m);
            }
        }
        assert!(marks.len() >= 3);
        assert!(t.on_mark_ack(&marks[2]));
        let high = t.played_ms();
        // a late ack for an earlier mark must not regress played_ms
        assert!(t.on_mark_ack(&marks[0]));
        assert_eq!(t.played_ms(), high);
    }
}
