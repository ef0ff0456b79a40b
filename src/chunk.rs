//! Paragraph-boundary text chunker.
//!
//! Splits source text into passages of at most `max_chars` characters.
//! Splitting happens on paragraph boundaries (`\n\n`); a paragraph that is
//! longer than the limit on its own is cut at the last whitespace inside
//! the window, and only a single unbroken run of `max_chars` characters is
//! ever hard-split.
//!
//! [`Chunker::chunks`] is lazy: passages are produced on demand and the
//! iterator can be cloned or re-created to restart. Empty or
//! whitespace-only input yields no passages.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Module};

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
}

impl Chunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Lazily split `text` into passages.
    pub fn chunks<'a>(&self, text: &'a str) -> Chunks<'a> {
        Chunks {
            paragraphs: text.split("\n\n"),
            max_chars: self.max_chars,
            carry: None,
            oversize: "",
        }
    }

    /// Split a source document into [`Chunk`] rows with contiguous
    /// `order_index` values starting at 0.
    pub fn build_chunks(
        &self,
        tenant_id: &str,
        module: Module,
        source_id: &str,
        title: &str,
        text: &str,
    ) -> Vec<Chunk> {
        self.chunks(text)
            .enumerate()
            .map(|(i, content)| Chunk {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                module,
                source_id: source_id.to_string(),
                title: title.to_string(),
                hash: hash_text(&content),
                content,
                order_index: i as i64,
            })
            .collect()
    }
}

/// Iterator over the passages of one text. See [`Chunker::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    paragraphs: std::str::Split<'a, &'static str>,
    max_chars: usize,
    /// A paragraph that did not fit into the previous passage.
    carry: Option<&'a str>,
    /// Remainder of a paragraph that is being split across passages.
    oversize: &'a str,
}

impl<'a> Chunks<'a> {
    fn split_oversize(&mut self) -> String {
        let text = self.oversize;
        let cut = match text.char_indices().nth(self.max_chars) {
            Some((byte_at, _)) => byte_at,
            None => {
                self.oversize = "";
                return text.trim_end().to_string();
            }
        };

        let window = &text[..cut];
        let split_at = match window.rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => cut,
        };

        let piece = text[..split_at].trim_end();
        self.oversize = text[split_at..].trim_start();
        piece.to_string()
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if !self.oversize.is_empty() {
            return Some(self.split_oversize());
        }

        let mut buf = String::new();
        let mut buf_chars = 0usize;

        loop {
            let para = match self.carry.take().or_else(|| self.paragraphs.next()) {
                Some(p) => p.trim(),
                None => break,
            };
            if para.is_empty() {
                continue;
            }

            let para_chars = para.chars().count();

            if para_chars > self.max_chars {
                if buf.is_empty() {
                    self.oversize = para;
                    return Some(self.split_oversize());
                }
                self.carry = Some(para);
                break;
            }

            let would_be = if buf.is_empty() {
                para_chars
            } else {
                buf_chars + 2 + para_chars
            };
            if would_be > self.max_chars && !buf.is_empty() {
                self.carry = Some(para);
                break;
            }

            if !buf.is_empty() {
                buf.push_str("\n\n");
                buf_chars += 2;
            }
            buf.push_str(para);
            buf_chars += para_chars;
        }

        if buf.is_empty() {
            None
        } else {
            Some(buf)
        }
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
