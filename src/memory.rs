//! Paged, word-addressed firmware image model.
//!
//! A word is either a concrete 16-bit value or absent (never programmed /
//! erased). Pages are fixed runs of [`PAGE_WORDS`] words; an [`Image`] is a
//! sparse, growable collection of pages where unreferenced page numbers are
//! implicitly fully absent.

use std::fmt;

use crate::constants::PAGE_WORDS;
use crate::error::{Error, Result};

/// One page of words. Absent words are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Page {
    words: [Option<u16>; PAGE_WORDS],
}

impl Page {
    pub fn new() -> Self {
        Page {
            words: [None; PAGE_WORDS],
        }
    }

    /// Build a page from little-endian byte pairs. Shorter input pads the
    /// tail with absent words; odd or oversized input fails.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() % 2 != 0 || raw.len() > PAGE_WORDS * 2 {
            return Err(Error::SpanMismatch {
                want: PAGE_WORDS * 2,
                got: raw.len(),
            });
        }
        let mut page = Page::new();
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            page.words[i] = Some(u16::from_le_bytes([pair[0], pair[1]]));
        }
        Ok(page)
    }

    /// Parse a page from hex text, four uppercase digits per word in
    /// LSB-MSB order, four spaces marking an absent word.
    pub fn from_hex_str(s: &str) -> Result<Self> {
        if s.len() % 4 != 0 || s.len() > PAGE_WORDS * 4 {
            return Err(Error::SpanMismatch {
                want: PAGE_WORDS * 4,
                got: s.len(),
            });
        }
        let mut page = Page::new();
        for (i, chunk) in s.as_bytes().chunks_exact(4).enumerate() {
            let chunk = std::str::from_utf8(chunk).map_err(|_| Error::Format {
                line: 0,
                reason: "non-ASCII page text".into(),
            })?;
            if chunk == "    " {
                continue;
            }
            let lo = u8::from_str_radix(&chunk[..2], 16);
            let hi = u8::from_str_radix(&chunk[2..], 16);
            match (lo, hi) {
                (Ok(lo), Ok(hi)) => page.words[i] = Some(u16::from_le_bytes([lo, hi])),
                _ => {
                    return Err(Error::Format {
                        line: 0,
                        reason: format!("bad word {chunk:?} in page text"),
                    });
                }
            }
        }
        Ok(page)
    }

    /// Serialize to wire bytes, filling absent words with `blank`.
    pub fn to_bytes(&self, blank: u16) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PAGE_WORDS * 2);
        for w in &self.words {
            raw.extend_from_slice(&w.unwrap_or(blank).to_le_bytes());
        }
        raw
    }

    pub fn word(&self, offset: usize) -> Result<Option<u16>> {
        self.words
            .get(offset)
            .copied()
            .ok_or(Error::PageIndex {
                offset,
                len: PAGE_WORDS,
            })
    }

    pub fn set_word(&mut self, offset: usize, word: Option<u16>) -> Result<()> {
        if offset >= PAGE_WORDS {
            return Err(Error::PageIndex {
                offset,
                len: PAGE_WORDS,
            });
        }
        self.words[offset] = word;
        Ok(())
    }

    /// Write `words` over `start..end`. The slice must cover the span
    /// exactly and the span must fit the page.
    pub fn set_span(&mut self, start: usize, end: usize, words: &[Option<u16>]) -> Result<()> {
        if end > PAGE_WORDS || start > end {
            return Err(Error::PageIndex {
                offset: end,
                len: PAGE_WORDS,
            });
        }
        if words.len() != end - start {
            return Err(Error::SpanMismatch {
                want: end - start,
                got: words.len(),
            });
        }
        self.words[start..end].copy_from_slice(words);
        Ok(())
    }

    /// Turn every word equal to `sentinel` absent. Applied to read-back
    /// pages so factory-blank locations do not end up in HEX output.
    pub fn blank_where(&mut self, sentinel: u16) {
        for w in &mut self.words {
            if *w == Some(sentinel) {
                *w = None;
            }
        }
    }

    pub fn is_blank(&self) -> bool {
        self.words.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<u16>> + '_ {
        self.words.iter().copied()
    }

    /// Hex dump with page/word addresses, two rows of sixteen words.
    pub fn display(&self, page_num: usize) -> String {
        let text = self.to_string();
        let addr = page_num * PAGE_WORDS;
        let quad = |n: usize| &text[n * 16..(n + 1) * 16];
        format!(
            "{:03X}-{:04X} : |{} {} {} {}|\n{:03X}-{:04X} : |{} {} {} {}|",
            page_num,
            addr,
            quad(0),
            quad(1),
            quad(2),
            quad(3),
            page_num,
            addr + PAGE_WORDS / 2,
            quad(4),
            quad(5),
            quad(6),
            quad(7),
        )
    }
}

impl fmt::Display for Page {
    /// Four hex digits per word, LSB first, spaces for absent words.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for w in &self.words {
            match w {
                Some(w) => write!(f, "{:02X}{:02X}", w & 0xFF, w >> 8)?,
                None => write!(f, "    ")?,
            }
        }
        Ok(())
    }
}

/// Sparse collection of pages keyed by page number.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pages: Vec<Option<Page>>,
}

impl Image {
    pub fn new() -> Self {
        Image::default()
    }

    /// Number of page slots currently held (highest touched page + 1).
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.is_none())
    }

    pub fn page(&self, page_num: usize) -> Option<&Page> {
        self.pages.get(page_num).and_then(Option::as_ref)
    }

    /// Store a page, growing the image with absent pages as needed.
    /// Storing `None` blanks the slot.
    pub fn set_page(&mut self, page_num: usize, page: Option<Page>) {
        if page_num >= self.pages.len() {
            self.pages.resize(page_num + 1, None);
        }
        self.pages[page_num] = page;
    }

    /// Mutable access to a page slot, creating an empty page if absent.
    pub fn page_entry(&mut self, page_num: usize) -> &mut Page {
        if page_num >= self.pages.len() {
            self.pages.resize(page_num + 1, None);
        }
        self.pages[page_num].get_or_insert_with(Page::new)
    }

    /// Merge two images; wherever both hold a page, `other` wins.
    pub fn overlay(&self, other: &Image) -> Image {
        let len = self.pages.len().max(other.pages.len());
        let mut pages = Vec::with_capacity(len);
        for n in 0..len {
            let ours = self.pages.get(n).cloned().flatten();
            let theirs = other.pages.get(n).cloned().flatten();
            pages.push(theirs.or(ours));
        }
        Image { pages }
    }

    /// Compare the listed pages against `other`, treating absent pages as
    /// all-blank. Returns the page numbers whose contents differ.
    pub fn compare(&self, other: &Image, pages: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let blank = Page::new();
        let mut errors = Vec::new();
        for page_num in pages {
            let this = self.page(page_num).unwrap_or(&blank);
            let that = other.page(page_num).unwrap_or(&blank);
            if this != that {
                errors.push(page_num);
            }
        }
        errors
    }

    /// Word-usage chart in the style of an assembler listing.
    pub fn usage_map(&self) -> String {
        let mut out = String::from("MEMORY USAGE MAP ('X' = Used,  '-' = Unused)\n\n");
        let mut used = 0usize;

        let blank = Page::new();
        for row in (0..self.pages.len()).step_by(2) {
            let left = self.page(row);
            let right = self.page(row + 1);
            if left.is_none() && right.is_none() {
                continue;
            }

            out.push_str(&format!("{:04X} : ", row * PAGE_WORDS));
            for page in [left.unwrap_or(&blank), right.unwrap_or(&blank)] {
                for (i, w) in page.iter().enumerate() {
                    if w.is_some() {
                        out.push('X');
                        used += 1;
                    } else {
                        out.push('-');
                    }
                    if (i + 1) % 16 == 0 {
                        out.push(' ');
                    }
                }
            }
            out.pop();
            out.push('\n');
        }

        out.push_str("\nAll other memory blocks unused.\n\n");
        out.push_str(&format!("Program Memory Words Used: {used:5}\n"));
        out
    }
}

impl PartialEq for Image {
    /// Pages past either image's extent count as all-blank, and an absent
    /// page equals a present page holding only absent words.
    fn eq(&self, other: &Image) -> bool {
        let len = self.pages.len().max(other.pages.len());
        self.compare(other, 0..len).is_empty()
    }
}

impl Eq for Image {}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (page_num, page) in self.pages.iter().enumerate() {
            if let Some(page) = page {
                if !page.is_blank() {
                    writeln!(f, "{}", page.display(page_num))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_page() -> Page {
        let mut p = Page::new();
        p.set_word(2, Some(0x2C4F)).unwrap();
        p.set_word(PAGE_WORDS - 1, Some(0x6C9F)).unwrap();
        p.set_word(23, Some(0x005F)).unwrap();
        p.set_word(9, Some(0x3FFF)).unwrap();
        p
    }

    #[test]
    fn word_index_out_of_range() {
        let mut p = Page::new();
        assert!(matches!(
            p.set_word(PAGE_WORDS, Some(0x77)),
            Err(Error::PageIndex { .. })
        ));
        assert!(matches!(p.word(PAGE_WORDS), Err(Error::PageIndex { .. })));
    }

    #[test]
    fn span_must_match_exactly() {
        let mut p = Page::new();
        assert!(matches!(
            p.set_span(0, 3, &[Some(1), Some(2)]),
            Err(Error::SpanMismatch { want: 3, got: 2 })
        ));
        assert!(matches!(
            p.set_span(30, 34, &[None; 4]),
            Err(Error::PageIndex { .. })
        ));
        p.set_span(5, 7, &[Some(0x3412), Some(0x7856)]).unwrap();
        assert_eq!(p.word(5).unwrap(), Some(0x3412));
        assert_eq!(p.word(6).unwrap(), Some(0x7856));
    }

    #[test]
    fn hex_text_round_trip() {
        let p = sample_page();
        let q = Page::from_hex_str(&p.to_string()).unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn display_format() {
        let text = "00308C0001308D002100EA3099001A1C172888018C1425238C1025231A28    \
                    00308C0001308D002100EA3099001A1C172888018C1425238C1025231A28    ";
        let q = Page::from_hex_str(text).unwrap();
        assert_eq!(
            q.display(0),
            "000-0000 : |00308C0001308D00 2100EA3099001A1C 172888018C142523 8C1025231A28    |\n\
             000-0010 : |00308C0001308D00 2100EA3099001A1C 172888018C142523 8C1025231A28    |"
        );
    }

    #[test]
    fn to_bytes_fills_blanks() {
        let mut p = Page::new();
        p.set_word(0, Some(0x0102)).unwrap();
        let raw = p.to_bytes(0x3FFF);
        assert_eq!(&raw[..4], &[0x02, 0x01, 0xFF, 0x3F]);
        assert_eq!(raw.len(), PAGE_WORDS * 2);
    }

    #[test]
    fn blank_where_drops_sentinels() {
        let mut p = Page::from_bytes(&[0xFF, 0x3F, 0x34, 0x12]).unwrap();
        p.blank_where(0x3FFF);
        assert_eq!(p.word(0).unwrap(), None);
        assert_eq!(p.word(1).unwrap(), Some(0x1234));
    }

    #[test]
    fn image_grows_and_compares() {
        let mut a = Image::new();
        a.set_page(5, Some(sample_page()));
        assert_eq!(a.len(), 6);
        assert!(a.page(3).is_none());

        let mut b = Image::new();
        b.set_page(5, Some(sample_page()));
        assert_eq!(a.compare(&b, 0..10), Vec::<usize>::new());

        b.page_entry(5).set_word(0, Some(1)).unwrap();
        assert_eq!(a.compare(&b, 0..10), vec![5]);
    }

    #[test]
    fn absent_page_equals_blank_page() {
        let mut a = Image::new();
        a.set_page(2, Some(Page::new()));
        let b = Image::new();
        assert_eq!(a, b);
    }

    #[test]
    fn overlay_prefers_other() {
        let mut a = Image::new();
        let mut b = Image::new();
        a.set_page(0, Some(sample_page()));
        a.set_page(1, Some(sample_page()));
        let mut changed = Page::new();
        changed.set_word(0, Some(0xBEEF)).unwrap();
        b.set_page(1, Some(changed.clone()));

        let merged = a.overlay(&b);
        assert_eq!(merged.page(0), Some(&sample_page()));
        assert_eq!(merged.page(1), Some(&changed));
    }

    #[test]
    fn usage_map_counts_words() {
        let mut image = Image::new();
        image.set_page(0, Some(sample_page()));
        let map = image.usage_map();
        assert!(map.starts_with("MEMORY USAGE MAP"));
        assert!(map.contains("Program Memory Words Used:     4"));
    }
}
